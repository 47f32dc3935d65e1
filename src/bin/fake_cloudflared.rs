//! Stand-in for `cloudflared tunnel --url <target>` used by the tests.
//!
//! FAKE_TUNNEL_URL      URL to announce, or `none` to stay silent
//! FAKE_TUNNEL_BANNER   line printed instead of the framed banner
//! FAKE_TUNNEL_STREAM   `stdout` or `stderr` (default: stderr)
//! FAKE_TUNNEL_DELAY_MS delay before the banner
//! FAKE_TUNNEL_EXIT     exit with this code right after the banner
//! FAKE_TUNNEL_LIFETIME_MS how long to keep running (default: 60000)

use std::env;
use std::io::Write;
use std::thread;
use std::time::Duration;

fn main() {
    let args: Vec<String> = env::args().skip(1).collect();
    let target = args
        .iter()
        .position(|arg| arg == "--url")
        .and_then(|idx| args.get(idx + 1))
        .cloned()
        .unwrap_or_else(|| "http://localhost:8080".to_string());
    let url = env::var("FAKE_TUNNEL_URL")
        .unwrap_or_else(|_| "https://example.trycloudflare.com".to_string());
    let to_stdout = env::var("FAKE_TUNNEL_STREAM").as_deref() == Ok("stdout");

    let emit = |line: &str| {
        if to_stdout {
            let mut out = std::io::stdout();
            let _ = writeln!(out, "{line}");
            let _ = out.flush();
        } else {
            let mut err = std::io::stderr();
            let _ = writeln!(err, "{line}");
            let _ = err.flush();
        }
    };

    emit("INF Thank you for trying Cloudflare Tunnel.");
    emit(&format!("INF Settings: map[no-autoupdate:true url:{target}]"));
    emit("INF Requesting new quick Tunnel on trycloudflare.com...");

    if let Some(delay) = millis("FAKE_TUNNEL_DELAY_MS") {
        thread::sleep(delay);
    }
    if let Ok(banner) = env::var("FAKE_TUNNEL_BANNER") {
        emit(&banner);
    } else if url != "none" {
        emit("INF +--------------------------------------------------------------------------------------------+");
        emit("INF |  Your quick Tunnel has been created! Visit it at (it may take some time to be reachable):  |");
        emit(&format!("INF |  {url}  |"));
        emit("INF +--------------------------------------------------------------------------------------------+");
    }

    if let Ok(code) = env::var("FAKE_TUNNEL_EXIT") {
        std::process::exit(code.trim().parse().unwrap_or(1));
    }
    thread::sleep(millis("FAKE_TUNNEL_LIFETIME_MS").unwrap_or(Duration::from_secs(60)));
}

fn millis(key: &str) -> Option<Duration> {
    env::var(key)
        .ok()
        .and_then(|value| value.trim().parse::<u64>().ok())
        .map(Duration::from_millis)
}
