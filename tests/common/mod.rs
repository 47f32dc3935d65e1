#![allow(dead_code)]

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tunnel_launcher::config::LauncherConfig;
use tunnel_launcher::verify::Probe;

pub fn resolve_bin(name: &str) -> PathBuf {
    let key = format!("CARGO_BIN_EXE_{name}");
    if let Ok(value) = std::env::var(&key) {
        return PathBuf::from(value);
    }
    let mut path = std::env::current_exe().unwrap();
    path.pop();
    if path.file_name().and_then(|name| name.to_str()) == Some("deps") {
        path.pop();
    }
    path.push(binary_name(name));
    path
}

pub fn resolve_fake_cloudflared() -> PathBuf {
    resolve_bin("fake_cloudflared")
}

fn binary_name(name: &str) -> String {
    if cfg!(windows) {
        format!("{name}.exe")
    } else {
        name.to_string()
    }
}

pub fn free_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

/// Launcher config pointed at the fake tunnel client with short timings.
pub fn fast_config(api_port: u16, tunnel_env: &[(&str, &str)]) -> LauncherConfig {
    let mut config = LauncherConfig::default();
    config.tunnel.binary = resolve_fake_cloudflared().display().to_string();
    config.tunnel.env = tunnel_env
        .iter()
        .map(|(key, value)| (key.to_string(), value.to_string()))
        .collect::<BTreeMap<_, _>>();
    config.tunnel.detection_deadline_secs = 1;
    config.services.api.port = api_port;
    config.services.api.argv = vec![resolve_bin("fake_service").display().to_string()];
    config.readiness.max_wait_ms = 3_000;
    config.readiness.poll_interval_ms = 50;
    config.readiness.connect_timeout_ms = 200;
    config.verify.max_attempts = 3;
    config.verify.backoff_ms = 20;
    config.stop_grace_ms = 500;
    config
}

/// Probe with a fixed answer that records every URL it was asked about.
pub struct RecordingProbe {
    reachable: bool,
    delay: Duration,
    seen: Mutex<Vec<String>>,
}

impl RecordingProbe {
    pub fn new(reachable: bool) -> Self {
        Self::with_delay(reachable, Duration::from_millis(5))
    }

    pub fn with_delay(reachable: bool, delay: Duration) -> Self {
        Self {
            reachable,
            delay,
            seen: Mutex::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> Vec<String> {
        self.seen.lock().unwrap().clone()
    }
}

#[async_trait]
impl Probe for RecordingProbe {
    async fn probe(&self, url: &str) -> anyhow::Result<bool> {
        self.seen.lock().unwrap().push(url.to_string());
        tokio::time::sleep(self.delay).await;
        Ok(self.reachable)
    }
}
