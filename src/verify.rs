use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Method};

use crate::launcher_log;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VerifyPolicy {
    pub max_attempts: u32,
    pub backoff: Duration,
    pub probe_timeout: Duration,
}

impl Default for VerifyPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            backoff: Duration::from_secs(2),
            probe_timeout: Duration::from_secs(5),
        }
    }
}

/// A single reachability check. `Ok(true)` means a success-class response.
#[async_trait]
pub trait Probe: Send + Sync {
    async fn probe(&self, url: &str) -> anyhow::Result<bool>;
}

/// HEAD request; any 2xx counts as reachable.
pub struct HttpProbe {
    client: Client,
}

impl HttpProbe {
    pub fn new(timeout: Duration) -> anyhow::Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(concat!("tunnel-launcher/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl Probe for HttpProbe {
    async fn probe(&self, url: &str) -> anyhow::Result<bool> {
        let response = self.client.request(Method::HEAD, url).send().await?;
        Ok(response.status().is_success())
    }
}

pub struct AccessibilityVerifier<P: ?Sized = dyn Probe> {
    policy: VerifyPolicy,
    probe: std::sync::Arc<P>,
}

impl<P: Probe + ?Sized> AccessibilityVerifier<P> {
    pub fn new(policy: VerifyPolicy, probe: std::sync::Arc<P>) -> Self {
        Self { policy, probe }
    }

    /// Probes `url` up to `max_attempts` times, sleeping `backoff` between
    /// failures. Returns on the first success; never errors.
    pub async fn confirm(&self, url: &str) -> bool {
        let attempts = self.policy.max_attempts.max(1);
        for attempt in 1..=attempts {
            match self.probe.probe(url).await {
                Ok(true) => {
                    launcher_log::info(
                        module_path!(),
                        format!("{url} is reachable (attempt {attempt}/{attempts})"),
                    );
                    return true;
                }
                Ok(false) => launcher_log::debug(
                    module_path!(),
                    format!("attempt {attempt}/{attempts}: {url} answered with a non-success status"),
                ),
                Err(err) => launcher_log::debug(
                    module_path!(),
                    format!("attempt {attempt}/{attempts}: {url} not reachable: {err}"),
                ),
            }
            if attempt < attempts {
                tokio::time::sleep(self.policy.backoff).await;
            }
        }
        launcher_log::warn(
            module_path!(),
            format!("{url} still unreachable after {attempts} attempts"),
        );
        false
    }
}
