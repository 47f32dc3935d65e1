//! Composes the launcher stages: local services, tunnel detection,
//! verification and publication. Nothing here returns an error to the
//! caller once construction succeeded; every failure ends in a published
//! local endpoint.

use std::sync::Arc;

use serde::Serialize;
use uuid::Uuid;

use crate::bridge::UiBridge;
use crate::config::{LauncherConfig, ServiceConfig};
use crate::endpoint::ServiceEndpoint;
use crate::launcher_log;
use crate::network::{self, LOCALHOST, PortMap};
use crate::publisher::{EndpointPublisher, PublishedEndpoint};
use crate::runtime_state::RuntimePaths;
use crate::supervisor::{self, ServiceHandle, ServiceSupervisor};
use crate::tunnel::{DetectionOutcome, DetectionState, TunnelSession, TunnelSupervisor};
use crate::verify::{AccessibilityVerifier, HttpProbe, Probe};

const PROBE_HOST: &str = "127.0.0.1";

#[derive(Clone, Debug, Serialize)]
pub struct SessionReport {
    pub endpoint: PublishedEndpoint,
    pub session_id: Option<Uuid>,
    pub state: Option<DetectionState>,
}

pub struct OrchestratorController {
    config: LauncherConfig,
    publisher: Arc<EndpointPublisher>,
    bridge: Arc<UiBridge>,
    services: ServiceSupervisor,
    started: Vec<ServiceHandle>,
    tunnel: TunnelSupervisor,
    verifier: AccessibilityVerifier,
    network_ip: String,
    finished: Option<SessionReport>,
}

impl OrchestratorController {
    pub fn new(config: LauncherConfig, paths: &RuntimePaths) -> anyhow::Result<Self> {
        let probe = HttpProbe::new(config.verify_policy().probe_timeout)?;
        Self::with_probe(config, paths, Arc::new(probe))
    }

    pub fn with_probe(
        config: LauncherConfig,
        paths: &RuntimePaths,
        probe: Arc<dyn Probe>,
    ) -> anyhow::Result<Self> {
        let matcher = Arc::new(config.matcher()?);
        let network_ip = network::local_address();
        let local_default = PublishedEndpoint::local(local_url(&config.services.api));
        let publisher = Arc::new(EndpointPublisher::new(
            paths.recovery_path(),
            (*matcher).clone(),
            local_default,
        ));
        let ports = PortMap {
            api: config.services.api.port,
            preview: config.services.preview.as_ref().map(|svc| svc.port),
        };
        let bridge = Arc::new(UiBridge::attach(
            publisher.clone(),
            network_ip.clone(),
            ports,
        ));
        let tunnel = TunnelSupervisor::new(config.tunnel_client(), matcher);
        let verifier = AccessibilityVerifier::new(config.verify_policy(), probe);
        Ok(Self {
            config,
            publisher,
            bridge,
            services: ServiceSupervisor::new(),
            started: Vec::new(),
            tunnel,
            verifier,
            network_ip,
            finished: None,
        })
    }

    pub fn publisher(&self) -> Arc<EndpointPublisher> {
        self.publisher.clone()
    }

    pub fn bridge(&self) -> Arc<UiBridge> {
        self.bridge.clone()
    }

    pub fn session(&self) -> Option<TunnelSession> {
        self.tunnel.session()
    }

    pub fn network_ip(&self) -> &str {
        &self.network_ip
    }

    pub fn started_services(&self) -> &[ServiceHandle] {
        &self.started
    }

    /// Runs one detection session to a terminal state. Calling it again
    /// returns the first result without starting anything.
    pub async fn run(&mut self) -> SessionReport {
        if let Some(report) = &self.finished {
            return report.clone();
        }
        self.publisher.clear_recovery();
        self.bridge.forward_diagnostics(self.tunnel.diagnostics());
        launcher_log::info(
            module_path!(),
            format!("network address: {}", self.network_ip),
        );

        let api = self.config.services.api.clone();
        self.bring_up(&api).await;
        if let Some(preview) = self.config.services.preview.clone() {
            self.bring_up(&preview).await;
        }

        if self.config.tunnel.enabled {
            self.run_tunnel_session(api.port).await;
        } else {
            launcher_log::info(module_path!(), "tunnel disabled; publishing local endpoint");
            self.publisher
                .commit(PublishedEndpoint::local(local_url(&api)));
        }

        let session = self.tunnel.session();
        let report = SessionReport {
            endpoint: self.publisher.current(),
            session_id: session.as_ref().map(|session| session.id),
            state: session.map(|session| session.state()),
        };
        self.finished = Some(report.clone());
        report
    }

    /// Reuses a service already listening on its port, otherwise starts it
    /// and waits for readiness. Readiness failure is not fatal.
    async fn bring_up(&mut self, service: &ServiceConfig) {
        let policy = self.config.readiness_policy();
        if supervisor::is_ready(PROBE_HOST, service.port, policy.connect_timeout).await {
            launcher_log::info(
                module_path!(),
                format!("{}: using existing service on port {}", service.id, service.port),
            );
            return;
        }

        let started = service
            .to_spec()
            .and_then(|spec| self.services.start(spec));
        match started {
            Ok(handle) => self.started.push(handle),
            Err(err) => {
                launcher_log::error(module_path!(), format!("{}: {err:#}", service.id));
                return;
            }
        }

        if !supervisor::wait_ready(PROBE_HOST, service.port, &policy).await {
            launcher_log::warn(
                module_path!(),
                format!(
                    "{} not ready on port {} after {:?}; continuing",
                    service.id, service.port, policy.max_wait
                ),
            );
        }
    }

    async fn run_tunnel_session(&mut self, port: u16) {
        let target = ServiceEndpoint::http(self.network_ip.clone(), port);
        launcher_log::info(module_path!(), format!("tunnel target: {target}"));
        self.tunnel.start(target);

        match self.tunnel.detect().await {
            DetectionOutcome::Detected(url) => self.verify_and_commit(url).await,
            DetectionOutcome::TimedOut => match self.publisher.read_recovery() {
                Some(url) => {
                    launcher_log::info(
                        module_path!(),
                        format!("using tunnel URL from recovery record: {url}"),
                    );
                    if let Err(err) = self.tunnel.adopt_recovered(&url) {
                        self.fall_back(&format!("cannot adopt recovered URL: {err}"));
                        return;
                    }
                    self.verify_and_commit(url).await;
                }
                None => self.fall_back("no tunnel URL detected and no recovery record"),
            },
            DetectionOutcome::Failed(reason) => self.fall_back(&reason),
        }
    }

    async fn verify_and_commit(&mut self, url: String) {
        // an exit already seen during detection must win over a fast probe
        let reachable = tokio::select! {
            biased;
            reason = self.tunnel.exited() => {
                launcher_log::warn(
                    module_path!(),
                    format!("tunnel went away during verification: {reason}"),
                );
                false
            }
            reachable = self.verifier.confirm(&url) => reachable,
        };
        if !reachable {
            self.fall_back(&format!("{url} is not accessible"));
            return;
        }
        if let Err(err) = self.tunnel.transition(DetectionState::Committed) {
            launcher_log::error(module_path!(), format!("cannot commit {url}: {err}"));
            self.fall_back("session left the verifying state");
            return;
        }
        self.publisher.commit(PublishedEndpoint::tunnel(url));
    }

    fn fall_back(&self, reason: &str) {
        let url = local_url(&self.config.services.api);
        launcher_log::warn(
            module_path!(),
            format!("{reason}; falling back to {url}"),
        );
        if let Err(err) = self.tunnel.transition(DetectionState::FallenBack) {
            launcher_log::debug(module_path!(), format!("fallback transition skipped: {err}"));
        }
        self.publisher.commit(PublishedEndpoint::local(url));
    }

    /// Stops the tunnel and every service this run started, then deletes
    /// the recovery record. Services found already running are left alone.
    pub async fn shutdown(&mut self) {
        launcher_log::info(module_path!(), "shutting down launcher");
        self.tunnel.stop().await;
        let grace = self.config.stop_grace();
        for handle in self.started.drain(..) {
            self.services.stop(&handle, grace).await;
        }
        self.publisher.clear_recovery();
    }
}

pub fn local_url(service: &ServiceConfig) -> String {
    format!("http://{LOCALHOST}:{}", service.port)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::publisher::EndpointSource;
    use async_trait::async_trait;
    use std::net::TcpListener;

    struct FixedProbe(bool);

    #[async_trait]
    impl Probe for FixedProbe {
        async fn probe(&self, _url: &str) -> anyhow::Result<bool> {
            Ok(self.0)
        }
    }

    fn config_for(port: u16) -> LauncherConfig {
        let mut config = LauncherConfig::default();
        config.services.api.port = port;
        config.services.api.argv = vec!["tunnel-launcher-missing-api".to_string()];
        config.readiness.max_wait_ms = 200;
        config.readiness.poll_interval_ms = 50;
        config.readiness.connect_timeout_ms = 200;
        config.verify.backoff_ms = 10;
        config.tunnel.detection_deadline_secs = 1;
        config.stop_grace_ms = 200;
        config
    }

    #[tokio::test]
    async fn tunnel_disabled_publishes_local_endpoint() {
        let dir = tempfile::tempdir().unwrap();
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let mut config = config_for(port);
        config.tunnel.enabled = false;

        let paths = RuntimePaths::for_work_dir(dir.path());
        let mut controller =
            OrchestratorController::with_probe(config, &paths, Arc::new(FixedProbe(true)))
                .unwrap();
        let report = controller.run().await;

        assert_eq!(report.endpoint.url, format!("http://localhost:{port}"));
        assert_eq!(report.endpoint.source, EndpointSource::Local);
        assert!(report.session_id.is_none());
        assert!(controller.started_services().is_empty());
        assert!(!paths.recovery_path().exists());
        controller.shutdown().await;
    }

    #[tokio::test]
    async fn missing_tunnel_binary_falls_back_to_local() {
        let dir = tempfile::tempdir().unwrap();
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let mut config = config_for(port);
        config.tunnel.binary = dir
            .path()
            .join("no-such-cloudflared")
            .display()
            .to_string();

        let paths = RuntimePaths::for_work_dir(dir.path());
        let mut controller =
            OrchestratorController::with_probe(config, &paths, Arc::new(FixedProbe(true)))
                .unwrap();
        let report = controller.run().await;

        assert_eq!(report.endpoint, PublishedEndpoint::local(format!("http://localhost:{port}")));
        assert_eq!(report.state, Some(DetectionState::FallenBack));

        let again = controller.run().await;
        assert_eq!(again.session_id, report.session_id);
        controller.shutdown().await;
    }

    #[tokio::test]
    async fn stale_recovery_record_is_cleared_on_start() {
        let dir = tempfile::tempdir().unwrap();
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let mut config = config_for(port);
        config.tunnel.enabled = false;
        let paths = RuntimePaths::for_work_dir(dir.path());
        std::fs::write(
            paths.recovery_path(),
            "https://stale-0001.trycloudflare.com\n",
        )
        .unwrap();

        let mut controller =
            OrchestratorController::with_probe(config, &paths, Arc::new(FixedProbe(true)))
                .unwrap();
        controller.run().await;
        assert!(!paths.recovery_path().exists());
    }
}
