//! Tunnel client supervision and public URL detection.
//!
//! A session spawns the tunnel client against a target, drains stdout and
//! stderr concurrently through the [`PatternMatcher`], and races the first
//! match against a detection deadline. The session record behind a mutex is
//! the only commit flag: a reader proposes its match with
//! [`TunnelSession::offer_candidate`] and only the call that moves the
//! session out of `AwaitingUrl` wins.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use serde::Serialize;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use uuid::Uuid;

use crate::endpoint::ServiceEndpoint;
use crate::launcher_log;
use crate::pattern::PatternMatcher;
use crate::supervisor::terminate_child;

const INSTALL_HINT: &str = "make sure cloudflared is installed: https://developers.cloudflare.com/cloudflare-one/connections/connect-apps/install-and-setup/installation/";
const DIAGNOSTIC_CAPACITY: usize = 256;
const READER_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);
/// Longer output runs without a newline are scanned in pieces of this size.
const MAX_LINE_BYTES: u64 = 64 * 1024;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DetectionState {
    Idle,
    Starting,
    AwaitingUrl,
    Verifying,
    TimedOut,
    Committed,
    FallenBack,
}

impl DetectionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Committed | Self::FallenBack)
    }

    pub fn can_transition_to(self, next: Self) -> bool {
        use DetectionState::*;
        matches!(
            (self, next),
            (Idle, Starting)
                | (Starting, AwaitingUrl)
                | (Starting, FallenBack)
                | (AwaitingUrl, Verifying)
                | (AwaitingUrl, TimedOut)
                | (AwaitingUrl, FallenBack)
                | (TimedOut, Verifying)
                | (TimedOut, FallenBack)
                | (Verifying, Committed)
                | (Verifying, FallenBack)
        )
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum StateError {
    #[error("illegal detection transition {from:?} -> {to:?}")]
    IllegalTransition {
        from: DetectionState,
        to: DetectionState,
    },
    #[error("no tunnel session is active")]
    NoSession,
}

#[derive(Clone, Debug, Serialize)]
pub struct TunnelSession {
    pub id: Uuid,
    pub target: ServiceEndpoint,
    candidate_url: Option<String>,
    state: DetectionState,
    pub started_at: DateTime<Utc>,
    pub detection_deadline: DateTime<Utc>,
}

impl TunnelSession {
    pub fn new(target: ServiceEndpoint, deadline: Duration) -> Self {
        let started_at = Utc::now();
        let window = TimeDelta::from_std(deadline).unwrap_or(TimeDelta::zero());
        Self {
            id: Uuid::new_v4(),
            target,
            candidate_url: None,
            state: DetectionState::Idle,
            started_at,
            detection_deadline: started_at
                .checked_add_signed(window)
                .unwrap_or(started_at),
        }
    }

    pub fn state(&self) -> DetectionState {
        self.state
    }

    pub fn candidate_url(&self) -> Option<&str> {
        self.candidate_url.as_deref()
    }

    pub fn advance(&mut self, next: DetectionState) -> Result<(), StateError> {
        if !self.state.can_transition_to(next) {
            return Err(StateError::IllegalTransition {
                from: self.state,
                to: next,
            });
        }
        self.state = next;
        Ok(())
    }

    /// First match wins: succeeds only while awaiting a URL and no candidate
    /// has been recorded yet.
    pub fn offer_candidate(&mut self, url: &str) -> bool {
        if self.state != DetectionState::AwaitingUrl || self.candidate_url.is_some() {
            return false;
        }
        self.candidate_url = Some(url.to_string());
        self.state = DetectionState::Verifying;
        true
    }

    /// Adopts a URL from the recovery record after the deadline passed.
    pub fn adopt_recovered(&mut self, url: &str) -> bool {
        if self.state != DetectionState::TimedOut || self.candidate_url.is_some() {
            return false;
        }
        self.candidate_url = Some(url.to_string());
        self.state = DetectionState::Verifying;
        true
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputStream {
    Stdout,
    Stderr,
}

#[derive(Clone, Debug, Serialize)]
pub struct LogLine {
    pub stream: OutputStream,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

/// Best-effort diagnostics; never used to drive detection.
#[derive(Clone, Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TunnelOutput {
    Log(LogLine),
    UrlFound {
        url: String,
        full_log: String,
        timestamp: DateTime<Utc>,
    },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DetectionOutcome {
    Detected(String),
    TimedOut,
    Failed(String),
}

#[derive(Clone, Debug)]
pub struct TunnelClientConfig {
    pub binary: PathBuf,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub detection_deadline: Duration,
    pub stop_grace: Duration,
}

impl TunnelClientConfig {
    pub fn argv(&self, target: &ServiceEndpoint) -> Vec<String> {
        let mut argv = vec![self.binary.to_string_lossy().to_string()];
        argv.extend(self.args.iter().cloned());
        argv.push(target.url());
        argv
    }
}

#[derive(Debug)]
enum SessionSignal {
    Candidate(String),
    Exited(String),
    SpawnFailed(String),
}

struct ActiveSession {
    session: Arc<Mutex<TunnelSession>>,
    signals: mpsc::UnboundedReceiver<SessionSignal>,
    readers: Vec<JoinHandle<()>>,
    watcher: Option<JoinHandle<()>>,
    stop_tx: Option<oneshot::Sender<()>>,
    deadline: Instant,
    // set once the client is known to be gone, whoever consumed the signal
    exited: Option<String>,
}

impl ActiveSession {
    fn cancel(&mut self) {
        for reader in self.readers.drain(..) {
            reader.abort();
        }
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.send(());
        }
    }
}

pub struct TunnelSupervisor {
    config: TunnelClientConfig,
    matcher: Arc<PatternMatcher>,
    diagnostics: broadcast::Sender<TunnelOutput>,
    active: Option<ActiveSession>,
}

impl TunnelSupervisor {
    pub fn new(config: TunnelClientConfig, matcher: Arc<PatternMatcher>) -> Self {
        let (diagnostics, _) = broadcast::channel(DIAGNOSTIC_CAPACITY);
        Self {
            config,
            matcher,
            diagnostics,
            active: None,
        }
    }

    pub fn diagnostics(&self) -> broadcast::Receiver<TunnelOutput> {
        self.diagnostics.subscribe()
    }

    pub fn session(&self) -> Option<TunnelSession> {
        self.active
            .as_ref()
            .map(|active| lock_session(&active.session).clone())
    }

    /// Starts a fresh session against `target`, cancelling any previous
    /// one. Spawn failures are reported by [`detect`](Self::detect).
    pub fn start(&mut self, target: ServiceEndpoint) -> Uuid {
        if let Some(mut previous) = self.active.take() {
            launcher_log::info(
                module_path!(),
                format!(
                    "cancelling tunnel session {}",
                    lock_session(&previous.session).id
                ),
            );
            previous.cancel();
        }

        let mut session = TunnelSession::new(target.clone(), self.config.detection_deadline);
        let id = session.id;
        // Idle -> Starting is always legal on a fresh session.
        let _ = session.advance(DetectionState::Starting);
        let session = Arc::new(Mutex::new(session));
        let (signal_tx, signals) = mpsc::unbounded_channel();
        let deadline = Instant::now() + self.config.detection_deadline;
        let argv = self.config.argv(&target);
        launcher_log::info(
            module_path!(),
            format!("starting tunnel session {id}: {}", argv.join(" ")),
        );

        let mut active = ActiveSession {
            session: session.clone(),
            signals,
            readers: Vec::new(),
            watcher: None,
            stop_tx: None,
            deadline,
            exited: None,
        };

        let mut child = match self.spawn(&argv) {
            Ok(child) => child,
            Err(err) => {
                let reason = format!("failed to start tunnel client {}: {err}", argv[0]);
                launcher_log::error(module_path!(), &reason);
                launcher_log::info(module_path!(), INSTALL_HINT);
                let _ = lock_session(&session).advance(DetectionState::FallenBack);
                let _ = signal_tx.send(SessionSignal::SpawnFailed(reason));
                self.active = Some(active);
                return id;
            }
        };
        let _ = lock_session(&session).advance(DetectionState::AwaitingUrl);

        let context = ReaderContext {
            session: session.clone(),
            matcher: self.matcher.clone(),
            signals: signal_tx.clone(),
            diagnostics: self.diagnostics.clone(),
        };
        if let Some(stdout) = child.stdout.take() {
            let context = context.clone();
            active.readers.push(tokio::spawn(async move {
                pump(stdout, OutputStream::Stdout, context).await
            }));
        }
        if let Some(stderr) = child.stderr.take() {
            let context = context.clone();
            active.readers.push(tokio::spawn(async move {
                pump(stderr, OutputStream::Stderr, context).await
            }));
        }

        let (stop_tx, stop_rx) = oneshot::channel();
        let grace = self.config.stop_grace;
        active.stop_tx = Some(stop_tx);
        active.watcher = Some(tokio::spawn(watch_child(child, stop_rx, signal_tx, grace)));
        self.active = Some(active);
        id
    }

    fn spawn(&self, argv: &[String]) -> std::io::Result<Child> {
        let mut command = Command::new(&argv[0]);
        command
            .args(&argv[1..])
            .envs(self.config.env.iter())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        command.spawn()
    }

    /// Waits for the first candidate URL, the detection deadline, or a
    /// process failure. Both readers keep draining throughout.
    pub async fn detect(&mut self) -> DetectionOutcome {
        let Some(active) = self.active.as_mut() else {
            return DetectionOutcome::Failed("no tunnel session".to_string());
        };
        let deadline = active.deadline;
        let mut deadline_passed = false;
        loop {
            let signal = if deadline_passed {
                active.signals.recv().await
            } else {
                tokio::select! {
                    biased;
                    signal = active.signals.recv() => signal,
                    _ = tokio::time::sleep_until(deadline) => {
                        let mut session = lock_session(&active.session);
                        if session.state() == DetectionState::AwaitingUrl {
                            let _ = session.advance(DetectionState::TimedOut);
                            launcher_log::warn(
                                module_path!(),
                                format!(
                                    "no tunnel URL detected within {:?}",
                                    self.config.detection_deadline
                                ),
                            );
                            return DetectionOutcome::TimedOut;
                        }
                        // a reader won the flag just before the deadline;
                        // its candidate is already queued
                        deadline_passed = true;
                        continue;
                    }
                }
            };

            match signal {
                Some(SessionSignal::Candidate(url)) => {
                    launcher_log::info(module_path!(), format!("tunnel URL detected: {url}"));
                    return DetectionOutcome::Detected(url);
                }
                Some(SessionSignal::SpawnFailed(reason)) => {
                    return DetectionOutcome::Failed(reason);
                }
                Some(SessionSignal::Exited(reason)) => {
                    active.exited = Some(reason.clone());
                    // output may still be buffered after the exit is observed
                    for reader in active.readers.drain(..) {
                        let _ = tokio::time::timeout(READER_DRAIN_TIMEOUT, reader).await;
                    }
                    while let Ok(signal) = active.signals.try_recv() {
                        if let SessionSignal::Candidate(url) = signal {
                            return DetectionOutcome::Detected(url);
                        }
                    }
                    let _ = lock_session(&active.session).advance(DetectionState::FallenBack);
                    return DetectionOutcome::Failed(reason);
                }
                None => {
                    let _ = lock_session(&active.session).advance(DetectionState::FallenBack);
                    return DetectionOutcome::Failed("tunnel output closed".to_string());
                }
            }
        }
    }

    /// Resolves when the tunnel client exits, immediately if that was
    /// already observed; pending forever otherwise.
    pub async fn exited(&mut self) -> String {
        let Some(active) = self.active.as_mut() else {
            return std::future::pending().await;
        };
        if let Some(reason) = &active.exited {
            return reason.clone();
        }
        loop {
            match active.signals.recv().await {
                Some(SessionSignal::Exited(reason)) | Some(SessionSignal::SpawnFailed(reason)) => {
                    active.exited = Some(reason.clone());
                    return reason;
                }
                Some(SessionSignal::Candidate(_)) => continue,
                None => return std::future::pending().await,
            }
        }
    }

    pub fn transition(&self, next: DetectionState) -> Result<(), StateError> {
        let active = self.active.as_ref().ok_or(StateError::NoSession)?;
        lock_session(&active.session).advance(next)
    }

    pub fn adopt_recovered(&self, url: &str) -> Result<(), StateError> {
        let active = self.active.as_ref().ok_or(StateError::NoSession)?;
        let mut session = lock_session(&active.session);
        if session.adopt_recovered(url) {
            Ok(())
        } else {
            Err(StateError::IllegalTransition {
                from: session.state(),
                to: DetectionState::Verifying,
            })
        }
    }

    /// Stops the tunnel client and waits for it to go away.
    pub async fn stop(&mut self) {
        let Some(mut active) = self.active.take() else {
            return;
        };
        active.cancel();
        if let Some(watcher) = active.watcher.take() {
            let budget = self.config.stop_grace + Duration::from_secs(1);
            if tokio::time::timeout(budget, watcher).await.is_err() {
                launcher_log::error(
                    module_path!(),
                    "tunnel client did not stop in time; continuing shutdown",
                );
            }
        }
    }
}

impl Drop for TunnelSupervisor {
    fn drop(&mut self) {
        if let Some(active) = self.active.as_mut() {
            active.cancel();
        }
    }
}

#[derive(Clone)]
struct ReaderContext {
    session: Arc<Mutex<TunnelSession>>,
    matcher: Arc<PatternMatcher>,
    signals: mpsc::UnboundedSender<SessionSignal>,
    diagnostics: broadcast::Sender<TunnelOutput>,
}

impl ReaderContext {
    fn handle_chunk(&self, stream: OutputStream, chunk: &str) {
        let timestamp = Utc::now();
        launcher_log::debug("tunnel", format!("[{stream:?}] {chunk}"));
        let _ = self.diagnostics.send(TunnelOutput::Log(LogLine {
            stream,
            message: chunk.to_string(),
            timestamp,
        }));

        let Some(url) = self.matcher.extract(chunk) else {
            return;
        };
        let _ = self.diagnostics.send(TunnelOutput::UrlFound {
            url: url.clone(),
            full_log: chunk.to_string(),
            timestamp,
        });
        let won = lock_session(&self.session).offer_candidate(&url);
        if won {
            let _ = self.signals.send(SessionSignal::Candidate(url));
        } else {
            launcher_log::trace(
                module_path!(),
                format!("ignoring later match {url} on {stream:?}"),
            );
        }
    }
}

async fn pump<R>(reader: R, stream: OutputStream, context: ReaderContext)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        let read = (&mut reader)
            .take(MAX_LINE_BYTES)
            .read_until(b'\n', &mut buf)
            .await;
        match read {
            Ok(0) => break,
            Ok(_) => {
                let chunk = String::from_utf8_lossy(&buf);
                let chunk = chunk.trim_end_matches(['\r', '\n']);
                if !chunk.is_empty() {
                    context.handle_chunk(stream, chunk);
                }
            }
            Err(err) => {
                launcher_log::warn(
                    module_path!(),
                    format!("tunnel {stream:?} reader stopped: {err}"),
                );
                break;
            }
        }
    }
}

async fn watch_child(
    mut child: Child,
    mut stop_rx: oneshot::Receiver<()>,
    signals: mpsc::UnboundedSender<SessionSignal>,
    grace: Duration,
) {
    let stop_requested = tokio::select! {
        status = child.wait() => {
            let reason = match status {
                Ok(status) => format!("tunnel client exited ({status})"),
                Err(err) => format!("tunnel client wait failed: {err}"),
            };
            launcher_log::warn(module_path!(), &reason);
            let _ = signals.send(SessionSignal::Exited(reason));
            false
        }
        _ = &mut stop_rx => true,
    };
    if stop_requested {
        terminate_child("tunnel", child, grace).await;
    }
}

fn lock_session(session: &Mutex<TunnelSession>) -> MutexGuard<'_, TunnelSession> {
    session
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Barrier;

    fn awaiting_session() -> Arc<Mutex<TunnelSession>> {
        let mut session =
            TunnelSession::new(ServiceEndpoint::http("192.168.1.10", 3001), Duration::from_secs(15));
        session.advance(DetectionState::Starting).unwrap();
        session.advance(DetectionState::AwaitingUrl).unwrap();
        Arc::new(Mutex::new(session))
    }

    fn context(
        session: Arc<Mutex<TunnelSession>>,
    ) -> (ReaderContext, mpsc::UnboundedReceiver<SessionSignal>) {
        let (signals, rx) = mpsc::unbounded_channel();
        let (diagnostics, _) = broadcast::channel(16);
        let context = ReaderContext {
            session,
            matcher: Arc::new(PatternMatcher::cloudflare().unwrap()),
            signals,
            diagnostics,
        };
        (context, rx)
    }

    #[test]
    fn transitions_are_monotonic() {
        let mut session =
            TunnelSession::new(ServiceEndpoint::http("localhost", 3001), Duration::from_secs(1));
        assert!(session.detection_deadline > session.started_at);
        session.advance(DetectionState::Starting).unwrap();
        session.advance(DetectionState::AwaitingUrl).unwrap();
        session.advance(DetectionState::TimedOut).unwrap();
        assert_eq!(
            session.advance(DetectionState::AwaitingUrl),
            Err(StateError::IllegalTransition {
                from: DetectionState::TimedOut,
                to: DetectionState::AwaitingUrl,
            })
        );
        session.advance(DetectionState::FallenBack).unwrap();
        assert!(session.state().is_terminal());
        assert!(session.advance(DetectionState::Committed).is_err());
    }

    #[test]
    fn candidate_is_set_once() {
        let session = awaiting_session();
        let mut guard = session.lock().unwrap();
        assert!(guard.offer_candidate("https://a.trycloudflare.com"));
        assert!(!guard.offer_candidate("https://b.trycloudflare.com"));
        assert_eq!(guard.candidate_url(), Some("https://a.trycloudflare.com"));
        assert_eq!(guard.state(), DetectionState::Verifying);
    }

    #[test]
    fn recovered_url_only_after_timeout() {
        let session = awaiting_session();
        let mut guard = session.lock().unwrap();
        assert!(!guard.adopt_recovered("https://r.trycloudflare.com"));
        guard.advance(DetectionState::TimedOut).unwrap();
        assert!(!guard.offer_candidate("https://late.trycloudflare.com"));
        assert!(guard.adopt_recovered("https://r.trycloudflare.com"));
        assert_eq!(guard.candidate_url(), Some("https://r.trycloudflare.com"));
    }

    #[test]
    fn simultaneous_matches_commit_exactly_once() {
        for _ in 0..50 {
            let session = awaiting_session();
            let (context, mut rx) = context(session.clone());
            let barrier = Arc::new(Barrier::new(2));
            let handles: Vec<_> = [
                (OutputStream::Stdout, "Visit https://out-1.trycloudflare.com"),
                (OutputStream::Stderr, "Your quick Tunnel: https://err-2.trycloudflare.com"),
            ]
            .into_iter()
            .map(|(stream, chunk)| {
                let context = context.clone();
                let barrier = barrier.clone();
                std::thread::spawn(move || {
                    barrier.wait();
                    context.handle_chunk(stream, chunk);
                })
            })
            .collect();
            for handle in handles {
                handle.join().unwrap();
            }

            let mut winners = Vec::new();
            while let Ok(SessionSignal::Candidate(url)) = rx.try_recv() {
                winners.push(url);
            }
            assert_eq!(winners.len(), 1);
            let committed = session.lock().unwrap().candidate_url().map(str::to_string);
            assert_eq!(committed.as_ref(), winners.first());
            assert!(
                winners[0] == "https://out-1.trycloudflare.com"
                    || winners[0] == "https://err-2.trycloudflare.com"
            );
        }
    }

    #[test]
    fn match_on_either_stream_is_forwarded() {
        for stream in [OutputStream::Stdout, OutputStream::Stderr] {
            let session = awaiting_session();
            let (context, mut rx) = context(session);
            let mut diagnostics = context.diagnostics.subscribe();
            context.handle_chunk(stream, "INF Registered tunnel connection");
            context.handle_chunk(stream, "INF |  https://abcd-1234.trycloudflare.com  |");
            match rx.try_recv() {
                Ok(SessionSignal::Candidate(url)) => {
                    assert_eq!(url, "https://abcd-1234.trycloudflare.com")
                }
                other => panic!("unexpected signal: {other:?}"),
            }
            assert!(matches!(diagnostics.try_recv(), Ok(TunnelOutput::Log(_))));
            assert!(matches!(diagnostics.try_recv(), Ok(TunnelOutput::Log(_))));
            assert!(matches!(
                diagnostics.try_recv(),
                Ok(TunnelOutput::UrlFound { .. })
            ));
        }
    }

    #[test]
    fn argv_appends_target_last() {
        let config = TunnelClientConfig {
            binary: PathBuf::from("cloudflared"),
            args: vec!["tunnel".into(), "--no-autoupdate".into(), "--url".into()],
            env: BTreeMap::new(),
            detection_deadline: Duration::from_secs(15),
            stop_grace: Duration::from_secs(2),
        };
        let argv = config.argv(&ServiceEndpoint::http("192.168.1.10", 3001));
        assert_eq!(
            argv,
            vec![
                "cloudflared",
                "tunnel",
                "--no-autoupdate",
                "--url",
                "http://192.168.1.10:3001"
            ]
        );
    }

    #[tokio::test]
    async fn spawn_failure_falls_back() {
        let config = TunnelClientConfig {
            binary: PathBuf::from("/definitely/not/here/cloudflared"),
            args: Vec::new(),
            env: BTreeMap::new(),
            detection_deadline: Duration::from_secs(5),
            stop_grace: Duration::from_millis(100),
        };
        let mut tunnel =
            TunnelSupervisor::new(config, Arc::new(PatternMatcher::cloudflare().unwrap()));
        tunnel.start(ServiceEndpoint::http("localhost", 3001));
        assert!(matches!(tunnel.detect().await, DetectionOutcome::Failed(_)));
        assert_eq!(
            tunnel.session().map(|session| session.state()),
            Some(DetectionState::FallenBack)
        );
    }

    #[tokio::test]
    async fn exit_seen_during_detection_is_reported_afterwards() {
        let config = TunnelClientConfig {
            binary: PathBuf::from("cloudflared"),
            args: Vec::new(),
            env: BTreeMap::new(),
            detection_deadline: Duration::from_secs(60),
            stop_grace: Duration::from_millis(100),
        };
        let mut tunnel =
            TunnelSupervisor::new(config, Arc::new(PatternMatcher::cloudflare().unwrap()));
        let session = awaiting_session();
        assert!(session
            .lock()
            .unwrap()
            .offer_candidate("https://last-0002.trycloudflare.com"));
        let (tx, signals) = mpsc::unbounded_channel();
        tunnel.active = Some(ActiveSession {
            session,
            signals,
            readers: Vec::new(),
            watcher: None,
            stop_tx: None,
            deadline: Instant::now() + Duration::from_secs(60),
            exited: None,
        });
        tx.send(SessionSignal::Exited(
            "tunnel client exited (exit status: 1)".to_string(),
        ))
        .unwrap();
        tx.send(SessionSignal::Candidate(
            "https://last-0002.trycloudflare.com".to_string(),
        ))
        .unwrap();

        assert_eq!(
            tunnel.detect().await,
            DetectionOutcome::Detected("https://last-0002.trycloudflare.com".to_string())
        );
        let reason = tokio::time::timeout(Duration::from_millis(500), tunnel.exited())
            .await
            .expect("exit already observed");
        assert_eq!(reason, "tunnel client exited (exit status: 1)");
    }

    #[tokio::test]
    async fn long_output_without_newline_is_scanned_in_pieces() {
        let (context, mut rx) = context(awaiting_session());
        let mut diagnostics = context.diagnostics.subscribe();
        let mut output = vec![b'x'; 200 * 1024];
        output.extend_from_slice(b"\nVisit https://wide-0004.trycloudflare.com\n");

        pump(output.as_slice(), OutputStream::Stderr, context).await;

        match rx.try_recv() {
            Ok(SessionSignal::Candidate(url)) => {
                assert_eq!(url, "https://wide-0004.trycloudflare.com")
            }
            other => panic!("unexpected signal: {other:?}"),
        }
        let mut chunks = 0;
        while let Ok(output) = diagnostics.try_recv() {
            if let TunnelOutput::Log(line) = output {
                assert!(line.message.len() <= MAX_LINE_BYTES as usize);
                chunks += 1;
            }
        }
        assert!(chunks >= 5);
    }
}
