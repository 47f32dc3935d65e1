mod common;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tunnel_launcher::endpoint::ServiceEndpoint;
use tunnel_launcher::pattern::PatternMatcher;
use tunnel_launcher::tunnel::{
    DetectionOutcome, DetectionState, TunnelClientConfig, TunnelOutput, TunnelSupervisor,
};

fn supervisor(env: &[(&str, &str)], deadline: Duration) -> TunnelSupervisor {
    let config = TunnelClientConfig {
        binary: common::resolve_fake_cloudflared(),
        args: vec![
            "tunnel".to_string(),
            "--no-autoupdate".to_string(),
            "--url".to_string(),
        ],
        env: env
            .iter()
            .map(|(key, value)| (key.to_string(), value.to_string()))
            .collect::<BTreeMap<_, _>>(),
        detection_deadline: deadline,
        stop_grace: Duration::from_millis(500),
    };
    TunnelSupervisor::new(config, Arc::new(PatternMatcher::cloudflare().unwrap()))
}

fn target() -> ServiceEndpoint {
    ServiceEndpoint::http("192.168.1.10", 3001)
}

#[tokio::test]
async fn detects_url_on_stderr() {
    let mut tunnel = supervisor(
        &[("FAKE_TUNNEL_URL", "https://abcd-1234.trycloudflare.com")],
        Duration::from_secs(5),
    );
    let mut diagnostics = tunnel.diagnostics();
    tunnel.start(target());

    let outcome = tunnel.detect().await;
    assert_eq!(
        outcome,
        DetectionOutcome::Detected("https://abcd-1234.trycloudflare.com".to_string())
    );
    let session = tunnel.session().unwrap();
    assert_eq!(session.state(), DetectionState::Verifying);
    assert_eq!(
        session.candidate_url(),
        Some("https://abcd-1234.trycloudflare.com")
    );

    let mut saw_target = false;
    let mut saw_found = false;
    while let Ok(output) = diagnostics.try_recv() {
        match output {
            TunnelOutput::Log(line) if line.message.contains("http://192.168.1.10:3001") => {
                saw_target = true;
            }
            TunnelOutput::UrlFound { url, .. } => {
                assert_eq!(url, "https://abcd-1234.trycloudflare.com");
                saw_found = true;
            }
            _ => {}
        }
    }
    assert!(saw_target, "target URL should be passed as the last argument");
    assert!(saw_found);
    tunnel.stop().await;
}

#[tokio::test]
async fn detects_url_on_stdout() {
    let mut tunnel = supervisor(
        &[
            ("FAKE_TUNNEL_URL", "https://out-5678.trycloudflare.com"),
            ("FAKE_TUNNEL_STREAM", "stdout"),
        ],
        Duration::from_secs(5),
    );
    tunnel.start(target());
    assert_eq!(
        tunnel.detect().await,
        DetectionOutcome::Detected("https://out-5678.trycloudflare.com".to_string())
    );
    tunnel.stop().await;
}

#[tokio::test]
async fn silent_client_times_out() {
    let mut tunnel = supervisor(&[("FAKE_TUNNEL_URL", "none")], Duration::from_millis(500));
    tunnel.start(target());
    let started = std::time::Instant::now();
    assert_eq!(tunnel.detect().await, DetectionOutcome::TimedOut);
    assert!(started.elapsed() >= Duration::from_millis(450));
    assert_eq!(tunnel.session().unwrap().state(), DetectionState::TimedOut);
    tunnel.stop().await;
}

#[tokio::test]
async fn late_banner_after_deadline_is_ignored() {
    let mut tunnel = supervisor(
        &[
            ("FAKE_TUNNEL_URL", "https://late-0001.trycloudflare.com"),
            ("FAKE_TUNNEL_DELAY_MS", "1500"),
        ],
        Duration::from_millis(300),
    );
    tunnel.start(target());
    assert_eq!(tunnel.detect().await, DetectionOutcome::TimedOut);
    tokio::time::sleep(Duration::from_millis(1_500)).await;
    let session = tunnel.session().unwrap();
    assert_eq!(session.state(), DetectionState::TimedOut);
    assert_eq!(session.candidate_url(), None);
    tunnel.stop().await;
}

#[tokio::test]
async fn exit_without_url_fails() {
    let mut tunnel = supervisor(
        &[("FAKE_TUNNEL_URL", "none"), ("FAKE_TUNNEL_EXIT", "1")],
        Duration::from_secs(5),
    );
    tunnel.start(target());
    match tunnel.detect().await {
        DetectionOutcome::Failed(reason) => assert!(reason.contains("exited")),
        other => panic!("unexpected outcome {other:?}"),
    }
    assert_eq!(tunnel.session().unwrap().state(), DetectionState::FallenBack);
}

#[tokio::test]
async fn url_printed_right_before_exit_still_counts() {
    let mut tunnel = supervisor(
        &[
            ("FAKE_TUNNEL_URL", "https://brief-0002.trycloudflare.com"),
            ("FAKE_TUNNEL_EXIT", "0"),
        ],
        Duration::from_secs(5),
    );
    tunnel.start(target());
    assert_eq!(
        tunnel.detect().await,
        DetectionOutcome::Detected("https://brief-0002.trycloudflare.com".to_string())
    );
}

#[tokio::test]
async fn restart_cancels_previous_session() {
    let mut tunnel = supervisor(&[("FAKE_TUNNEL_URL", "none")], Duration::from_secs(5));
    let first = tunnel.start(target());
    let second = tunnel.start(target());
    assert_ne!(first, second);
    assert_eq!(tunnel.session().unwrap().id, second);
    tunnel.stop().await;
    assert!(tunnel.session().is_none());
}
