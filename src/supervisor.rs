use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::net::TcpStream;
use tokio::process::{Child, Command};
use tokio::time::Instant;

use crate::launcher_log;

#[derive(Clone, Debug, Eq, PartialEq, Hash, PartialOrd, Ord)]
pub struct ServiceId(String);

impl ServiceId {
    pub fn new(value: impl Into<String>) -> anyhow::Result<Self> {
        let value = value.into();
        if value.is_empty() {
            return Err(anyhow::anyhow!("service id cannot be empty"));
        }
        if !value
            .chars()
            .all(|ch| ch.is_ascii_alphanumeric() || ch == '-' || ch == '_')
        {
            return Err(anyhow::anyhow!(
                "invalid service id '{}'; use alphanumeric, '-' or '_'",
                value
            ));
        }
        Ok(Self(value))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

#[derive(Clone, Debug)]
pub struct ServiceSpec {
    pub id: ServiceId,
    pub argv: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub env: BTreeMap<String, String>,
}

#[derive(Clone, Debug)]
pub struct ServiceHandle {
    pub id: ServiceId,
    pub pid: Option<u32>,
    pub started_at: DateTime<Utc>,
}

#[derive(Clone, Debug)]
pub struct ReadinessPolicy {
    pub max_wait: Duration,
    pub poll_interval: Duration,
    pub connect_timeout: Duration,
}

impl Default for ReadinessPolicy {
    fn default() -> Self {
        Self {
            max_wait: Duration::from_secs(15),
            poll_interval: Duration::from_secs(1),
            connect_timeout: Duration::from_secs(2),
        }
    }
}

/// Owns the local service processes started by this run.
#[derive(Default)]
pub struct ServiceSupervisor {
    children: Mutex<BTreeMap<ServiceId, Child>>,
}

impl ServiceSupervisor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawns `spec` with inherited standard streams and the given
    /// environment overrides.
    pub fn start(&self, spec: ServiceSpec) -> anyhow::Result<ServiceHandle> {
        if spec.argv.is_empty() {
            return Err(anyhow::anyhow!("service argv cannot be empty"));
        }
        let mut children = self.lock();
        if children.contains_key(&spec.id) {
            return Err(anyhow::anyhow!(
                "service {} already started by this launcher",
                spec.id.as_str()
            ));
        }

        let mut command = Command::new(&spec.argv[0]);
        if spec.argv.len() > 1 {
            command.args(&spec.argv[1..]);
        }
        if let Some(cwd) = &spec.cwd {
            command.current_dir(cwd);
        }
        command.envs(spec.env.iter());
        let child = command
            .stdin(Stdio::null())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|err| {
                anyhow::anyhow!(
                    "failed to start service {} ({}): {err}",
                    spec.id.as_str(),
                    spec.argv[0]
                )
            })?;

        let pid = child.id();
        launcher_log::info(
            module_path!(),
            format!(
                "{}: started (pid={})",
                spec.id.as_str(),
                pid.map(|value| value.to_string())
                    .unwrap_or_else(|| "-".to_string())
            ),
        );
        children.insert(spec.id.clone(), child);
        Ok(ServiceHandle {
            id: spec.id,
            pid,
            started_at: Utc::now(),
        })
    }

    pub fn is_managed(&self, id: &ServiceId) -> bool {
        self.lock().contains_key(id)
    }

    /// Terminates a service started by [`start`](Self::start). Unknown or
    /// already stopped handles are a no-op; kill failures are logged.
    pub async fn stop(&self, handle: &ServiceHandle, grace: Duration) {
        let child = self.lock().remove(&handle.id);
        let Some(child) = child else {
            return;
        };
        terminate_child(handle.id.as_str(), child, grace).await;
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<ServiceId, Child>> {
        self.children
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// SIGTERM, wait up to `grace`, then SIGKILL.
pub async fn terminate_child(name: &str, mut child: Child, grace: Duration) {
    match child.try_wait() {
        Ok(Some(status)) => {
            launcher_log::debug(module_path!(), format!("{name}: already exited ({status})"));
            return;
        }
        Ok(None) => {}
        Err(err) => {
            launcher_log::warn(module_path!(), format!("{name}: could not poll process: {err}"));
        }
    }

    #[cfg(unix)]
    {
        if let Some(pid) = child.id() {
            let _ = unsafe { libc::kill(pid as i32, libc::SIGTERM) };
        }
    }

    match tokio::time::timeout(grace, child.wait()).await {
        Ok(Ok(status)) => {
            launcher_log::info(module_path!(), format!("{name}: stopped ({status})"));
        }
        Ok(Err(err)) => {
            launcher_log::warn(module_path!(), format!("{name}: wait failed: {err}"));
        }
        Err(_) => {
            if let Err(err) = child.kill().await {
                launcher_log::error(
                    module_path!(),
                    format!("{name}: failed to kill process: {err}"),
                );
            } else {
                launcher_log::info(module_path!(), format!("{name}: killed after {grace:?}"));
            }
        }
    }
}

/// TCP connect check; refusal and timeout both map to `false`.
pub async fn is_ready(host: &str, port: u16, timeout: Duration) -> bool {
    matches!(
        tokio::time::timeout(timeout, TcpStream::connect((host, port))).await,
        Ok(Ok(_))
    )
}

pub async fn wait_ready(host: &str, port: u16, policy: &ReadinessPolicy) -> bool {
    let deadline = Instant::now() + policy.max_wait;
    launcher_log::info(module_path!(), format!("waiting for {host}:{port}"));
    loop {
        if is_ready(host, port, policy.connect_timeout).await {
            launcher_log::info(module_path!(), format!("{host}:{port} is ready"));
            return true;
        }
        let now = Instant::now();
        if now >= deadline {
            launcher_log::warn(
                module_path!(),
                format!("{host}:{port} not ready after {:?}", policy.max_wait),
            );
            return false;
        }
        tokio::time::sleep(policy.poll_interval.min(deadline - now)).await;
    }
}
