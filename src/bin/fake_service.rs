//! Minimal HTTP responder used as a managed service in tests.
//! Listens on 127.0.0.1:$PORT and answers every request with 200.

use std::env;
use std::io::{Read, Write};
use std::net::TcpListener;
use std::time::{Duration, Instant};

fn main() {
    let port = env::var("PORT")
        .ok()
        .and_then(|value| value.trim().parse::<u16>().ok())
        .unwrap_or(3001);
    let lifetime = env::args()
        .nth(1)
        .and_then(|value| value.parse::<u64>().ok())
        .map(Duration::from_secs)
        .unwrap_or(Duration::from_secs(60));

    let listener = match TcpListener::bind(("127.0.0.1", port)) {
        Ok(listener) => listener,
        Err(err) => {
            eprintln!("fake_service: bind 127.0.0.1:{port} failed: {err}");
            std::process::exit(1);
        }
    };
    let _ = listener.set_nonblocking(true);
    println!("ready on {port}");

    let started = Instant::now();
    while started.elapsed() < lifetime {
        match listener.accept() {
            Ok((mut stream, _)) => {
                let _ = stream.set_nonblocking(false);
                let _ = stream.set_read_timeout(Some(Duration::from_millis(200)));
                let mut buf = [0u8; 1024];
                let _ = stream.read(&mut buf);
                let _ = stream.write_all(
                    b"HTTP/1.1 200 OK\r\ncontent-length: 2\r\nconnection: close\r\n\r\nok",
                );
            }
            Err(_) => std::thread::sleep(Duration::from_millis(20)),
        }
    }
}
