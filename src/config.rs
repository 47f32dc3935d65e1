use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Deserializer};

use crate::pattern::{PatternMatcher, RuleConfig, default_rule_configs};
use crate::supervisor::{ReadinessPolicy, ServiceId, ServiceSpec};
use crate::tunnel::TunnelClientConfig;
use crate::verify::VerifyPolicy;

pub const ENV_USE_TUNNEL: &str = "USE_TUNNEL";
pub const ENV_HOST: &str = "HOST";
pub const ENV_PORT: &str = "PORT";

#[derive(Clone, Debug, Deserialize)]
pub struct LauncherConfig {
    #[serde(default)]
    pub tunnel: TunnelConfig,
    #[serde(default)]
    pub verify: VerifyConfig,
    #[serde(default)]
    pub readiness: ReadinessConfig,
    #[serde(default)]
    pub services: ServicesConfig,
    #[serde(default)]
    pub info_server: InfoServerConfig,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default = "default_stop_grace_ms")]
    pub stop_grace_ms: u64,
}

impl Default for LauncherConfig {
    fn default() -> Self {
        Self {
            tunnel: TunnelConfig::default(),
            verify: VerifyConfig::default(),
            readiness: ReadinessConfig::default(),
            services: ServicesConfig::default(),
            info_server: InfoServerConfig::default(),
            log_level: default_log_level(),
            stop_grace_ms: default_stop_grace_ms(),
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct TunnelConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_tunnel_binary")]
    pub binary: String,
    #[serde(default = "default_tunnel_args")]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default = "default_detection_deadline_secs")]
    pub detection_deadline_secs: u64,
    #[serde(default = "default_rule_configs")]
    pub rules: Vec<RuleConfig>,
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            binary: default_tunnel_binary(),
            args: default_tunnel_args(),
            env: BTreeMap::new(),
            detection_deadline_secs: default_detection_deadline_secs(),
            rules: default_rule_configs(),
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct VerifyConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_backoff_ms")]
    pub backoff_ms: u64,
    #[serde(default = "default_probe_timeout_ms")]
    pub probe_timeout_ms: u64,
}

impl Default for VerifyConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            backoff_ms: default_backoff_ms(),
            probe_timeout_ms: default_probe_timeout_ms(),
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct ReadinessConfig {
    #[serde(default = "default_max_wait_ms")]
    pub max_wait_ms: u64,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
}

impl Default for ReadinessConfig {
    fn default() -> Self {
        Self {
            max_wait_ms: default_max_wait_ms(),
            poll_interval_ms: default_poll_interval_ms(),
            connect_timeout_ms: default_connect_timeout_ms(),
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct ServicesConfig {
    #[serde(default = "default_api_service")]
    pub api: ServiceConfig,
    #[serde(default, deserialize_with = "deserialize_preview")]
    pub preview: Option<ServiceConfig>,
}

impl Default for ServicesConfig {
    fn default() -> Self {
        Self {
            api: default_api_service(),
            preview: None,
        }
    }
}

/// A local service process. `host`/`port` are handed to the child through
/// the `host_env`/`port_env` variables.
#[derive(Clone, Debug, Deserialize)]
pub struct ServiceConfig {
    #[serde(default = "default_api_id")]
    pub id: String,
    pub argv: Vec<String>,
    #[serde(default)]
    pub cwd: Option<PathBuf>,
    #[serde(default = "default_bind_host")]
    pub host: String,
    #[serde(default = "default_api_port")]
    pub port: u16,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default = "default_host_env")]
    pub host_env: String,
    #[serde(default = "default_port_env")]
    pub port_env: String,
}

/// `services.preview` as written in the file; id and port fall back to the
/// preview defaults rather than the API ones.
#[derive(Deserialize)]
struct PreviewServiceConfig {
    #[serde(default = "default_preview_id")]
    id: String,
    argv: Vec<String>,
    #[serde(default)]
    cwd: Option<PathBuf>,
    #[serde(default = "default_bind_host")]
    host: String,
    #[serde(default = "default_preview_port")]
    port: u16,
    #[serde(default)]
    env: BTreeMap<String, String>,
    #[serde(default = "default_host_env")]
    host_env: String,
    #[serde(default = "default_port_env")]
    port_env: String,
}

impl From<PreviewServiceConfig> for ServiceConfig {
    fn from(raw: PreviewServiceConfig) -> Self {
        Self {
            id: raw.id,
            argv: raw.argv,
            cwd: raw.cwd,
            host: raw.host,
            port: raw.port,
            env: raw.env,
            host_env: raw.host_env,
            port_env: raw.port_env,
        }
    }
}

fn deserialize_preview<'de, D>(deserializer: D) -> Result<Option<ServiceConfig>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<PreviewServiceConfig>::deserialize(deserializer)?.map(ServiceConfig::from))
}

impl ServiceConfig {
    pub fn to_spec(&self) -> anyhow::Result<ServiceSpec> {
        let mut env = self.env.clone();
        env.insert(self.host_env.clone(), self.host.clone());
        env.insert(self.port_env.clone(), self.port.to_string());
        Ok(ServiceSpec {
            id: ServiceId::new(self.id.clone())?,
            argv: self.argv.clone(),
            cwd: self.cwd.clone(),
            env,
        })
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct InfoServerConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_info_bind")]
    pub bind: String,
}

impl Default for InfoServerConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            bind: default_info_bind(),
        }
    }
}

impl InfoServerConfig {
    pub fn bind_addr(&self) -> anyhow::Result<SocketAddr> {
        SocketAddr::from_str(&self.bind)
            .map_err(|err| anyhow::anyhow!("invalid info_server.bind '{}': {err}", self.bind))
    }
}

impl LauncherConfig {
    /// Applies `USE_TUNNEL`, `HOST` and `PORT` from `lookup`.
    pub fn apply_env_overrides<F>(&mut self, lookup: F) -> anyhow::Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(value) = lookup(ENV_USE_TUNNEL) {
            self.tunnel.enabled = parse_flag(&value).ok_or_else(|| {
                anyhow::anyhow!("{ENV_USE_TUNNEL} must be true/false, got '{value}'")
            })?;
        }
        if let Some(host) = lookup(ENV_HOST)
            && !host.trim().is_empty()
        {
            self.services.api.host = host.trim().to_string();
        }
        if let Some(value) = lookup(ENV_PORT) {
            self.services.api.port = u16::from_str(value.trim())
                .map_err(|err| anyhow::anyhow!("{ENV_PORT} must be a port number: {err}"))?;
        }
        Ok(())
    }

    pub fn tunnel_client(&self) -> TunnelClientConfig {
        TunnelClientConfig {
            binary: PathBuf::from(&self.tunnel.binary),
            args: self.tunnel.args.clone(),
            env: self.tunnel.env.clone(),
            detection_deadline: Duration::from_secs(self.tunnel.detection_deadline_secs),
            stop_grace: self.stop_grace(),
        }
    }

    pub fn verify_policy(&self) -> VerifyPolicy {
        VerifyPolicy {
            max_attempts: self.verify.max_attempts.max(1),
            backoff: Duration::from_millis(self.verify.backoff_ms),
            probe_timeout: Duration::from_millis(self.verify.probe_timeout_ms),
        }
    }

    pub fn readiness_policy(&self) -> ReadinessPolicy {
        ReadinessPolicy {
            max_wait: Duration::from_millis(self.readiness.max_wait_ms),
            poll_interval: Duration::from_millis(self.readiness.poll_interval_ms.max(1)),
            connect_timeout: Duration::from_millis(self.readiness.connect_timeout_ms),
        }
    }

    pub fn matcher(&self) -> anyhow::Result<PatternMatcher> {
        PatternMatcher::from_configs(&self.tunnel.rules)
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_millis(self.stop_grace_ms)
    }
}

/// Reads `launcher.yaml`; a missing or comment-only file yields defaults.
pub fn load_config(path: &Path) -> anyhow::Result<LauncherConfig> {
    if !path.exists() {
        return Ok(LauncherConfig::default());
    }
    let contents = std::fs::read_to_string(path)?;
    parse_config(&contents)
        .map_err(|err| anyhow::anyhow!("failed to parse {}: {err}", path.display()))
}

pub fn parse_config(contents: &str) -> anyhow::Result<LauncherConfig> {
    if contents
        .lines()
        .all(|line| line.trim().is_empty() || line.trim().starts_with('#'))
    {
        return Ok(LauncherConfig::default());
    }
    let config: LauncherConfig = serde_yaml_bw::from_str(contents)?;
    Ok(config)
}

pub fn parse_flag(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn default_true() -> bool {
    true
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_stop_grace_ms() -> u64 {
    2_000
}

fn default_tunnel_binary() -> String {
    "cloudflared".to_string()
}

fn default_tunnel_args() -> Vec<String> {
    vec![
        "tunnel".to_string(),
        "--no-autoupdate".to_string(),
        "--url".to_string(),
    ]
}

fn default_detection_deadline_secs() -> u64 {
    15
}

fn default_max_attempts() -> u32 {
    5
}

fn default_backoff_ms() -> u64 {
    2_000
}

fn default_probe_timeout_ms() -> u64 {
    5_000
}

fn default_max_wait_ms() -> u64 {
    15_000
}

fn default_poll_interval_ms() -> u64 {
    1_000
}

fn default_connect_timeout_ms() -> u64 {
    2_000
}

fn default_bind_host() -> String {
    "0.0.0.0".to_string()
}

fn default_host_env() -> String {
    ENV_HOST.to_string()
}

fn default_port_env() -> String {
    ENV_PORT.to_string()
}

fn default_info_bind() -> String {
    "127.0.0.1:3999".to_string()
}

fn default_api_id() -> String {
    "api".to_string()
}

fn default_preview_id() -> String {
    "preview".to_string()
}

pub fn default_api_port() -> u16 {
    3001
}

pub fn default_preview_port() -> u16 {
    4173
}

fn default_api_service() -> ServiceConfig {
    ServiceConfig {
        id: default_api_id(),
        argv: vec!["node".to_string(), "server/index.js".to_string()],
        cwd: None,
        host: default_bind_host(),
        port: default_api_port(),
        env: BTreeMap::new(),
        host_env: default_host_env(),
        port_env: default_port_env(),
    }
}
