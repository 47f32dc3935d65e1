use std::{
    env,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio::runtime::Runtime;

use crate::config::{self, LauncherConfig};
use crate::controller::{OrchestratorController, local_url};
use crate::info_server::InfoServer;
use crate::launcher_log::{self, Level};
use crate::network::{self, NetworkInfo, PortMap};
use crate::publisher::PublishedEndpoint;
use crate::runtime_state::{self, RuntimePaths};

#[derive(Parser)]
#[command(name = "tunnel-launcher")]
#[command(
    about = "Start the local API and publish a public tunnel endpoint for it",
    version
)]
pub struct Cli {
    /// Directory holding launcher.yaml, the recovery record and state/.
    #[arg(long, global = true)]
    work_dir: Option<PathBuf>,
    /// Config file (default: <work-dir>/launcher.yaml).
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    Up(UpArgs),
    Status(StatusArgs),
    Clear(ClearArgs),
}

#[derive(Parser)]
#[command(
    about = "Start services, detect the tunnel URL and publish an endpoint.",
    long_about = "Starts (or reuses) the API and preview services, launches the tunnel client, waits for its public URL, verifies it and publishes either the tunnel URL or the local fallback. Runs until Ctrl+C.",
    after_help = "Main options:\n  (none)\n\nOptional options:\n  --local-only\n  --tunnel-binary <PATH> (default: cloudflared)\n  --deadline-secs <N> (default: 15)\n  --info-addr <ADDR> (enables the info server)\n  --log-level <LEVEL> (default: info)"
)]
struct UpArgs {
    #[arg(long)]
    local_only: bool,
    #[arg(long)]
    tunnel_binary: Option<PathBuf>,
    #[arg(long)]
    deadline_secs: Option<u64>,
    #[arg(long)]
    info_addr: Option<String>,
    #[arg(long)]
    log_level: Option<String>,
}

#[derive(Parser)]
#[command(
    about = "Show the tunnel URL held in the recovery record.",
    after_help = "Optional options:\n  --json"
)]
struct StatusArgs {
    #[arg(long)]
    json: bool,
}

#[derive(Parser)]
#[command(about = "Delete the recovery record.")]
struct ClearArgs {}

impl Cli {
    pub fn run(self) -> anyhow::Result<()> {
        let work_dir = work_dir(self.work_dir)?;
        let paths = RuntimePaths::for_work_dir(&work_dir);
        let config_path = self.config.unwrap_or_else(|| paths.config_path());
        let mut config = config::load_config(&config_path)?;
        config.apply_env_overrides(|key| env::var(key).ok())?;
        match self.command {
            Command::Up(args) => args.run(config, &paths),
            Command::Status(args) => args.run(&config, &paths),
            Command::Clear(args) => args.run(&paths),
        }
    }
}

impl UpArgs {
    fn apply(&self, config: &mut LauncherConfig) {
        if self.local_only {
            config.tunnel.enabled = false;
        }
        if let Some(binary) = &self.tunnel_binary {
            config.tunnel.binary = binary.display().to_string();
        }
        if let Some(secs) = self.deadline_secs {
            config.tunnel.detection_deadline_secs = secs;
        }
        if let Some(addr) = &self.info_addr {
            config.info_server.enabled = true;
            config.info_server.bind = addr.clone();
        }
        if let Some(level) = &self.log_level {
            config.log_level = level.clone();
        }
    }

    fn run(self, mut config: LauncherConfig, paths: &RuntimePaths) -> anyhow::Result<()> {
        self.apply(&mut config);
        let level = Level::parse(&config.log_level).ok_or_else(|| {
            anyhow::anyhow!("unknown log level '{}'", config.log_level)
        })?;
        match launcher_log::init(&paths.logs_dir(), level) {
            Ok(path) => launcher_log::info(
                module_path!(),
                format!("launcher log at {}", path.display()),
            ),
            Err(err) => eprintln!("launcher log disabled: {err:#}"),
        }

        let runtime = Runtime::new().context("failed to create tokio runtime")?;
        runtime.block_on(async move {
            let info_bind = if config.info_server.enabled {
                Some(config.info_server.bind_addr()?)
            } else {
                None
            };
            launcher_log::info(
                module_path!(),
                format!("endpoint will be published within {:?}", publish_bound(&config)),
            );
            let mut controller = OrchestratorController::new(config, paths)?;

            let info_server = match info_bind {
                Some(addr) => match InfoServer::start(addr, controller.bridge()).await {
                    Ok(server) => Some(server),
                    Err(err) => {
                        launcher_log::error(module_path!(), format!("{err:#}"));
                        None
                    }
                },
                None => None,
            };

            let report = controller.run().await;
            let label = if report.endpoint.is_public {
                "public"
            } else {
                "local"
            };
            println!("{label} endpoint: {}", report.endpoint.url);
            println!("network address: {}", controller.network_ip());
            println!("press Ctrl+C to stop.");

            tokio::signal::ctrl_c()
                .await
                .context("failed to listen for Ctrl+C")?;
            println!("shutting down...");
            if let Some(server) = info_server {
                server.stop().await;
            }
            controller.shutdown().await;
            Ok::<(), anyhow::Error>(())
        })
    }
}

impl StatusArgs {
    fn run(self, config: &LauncherConfig, paths: &RuntimePaths) -> anyhow::Result<()> {
        let info = status_info(config, &paths.recovery_path(), network::local_address())?;
        if self.json {
            println!("{}", serde_json::to_string_pretty(&info)?);
            return Ok(());
        }
        match &info.tunnel_url {
            Some(url) => println!("tunnel url: {url}"),
            None => println!("no tunnel URL recorded"),
        }
        println!("local api: {}", info.local_api_url);
        println!("network api: {}", info.network_api_url);
        Ok(())
    }
}

impl ClearArgs {
    fn run(self, paths: &RuntimePaths) -> anyhow::Result<()> {
        let path = paths.recovery_path();
        if runtime_state::remove_if_exists(&path)? {
            println!("removed {}", path.display());
        } else {
            println!("nothing to remove at {}", path.display());
        }
        Ok(())
    }
}

fn recorded_url(config: &LauncherConfig, path: &Path) -> anyhow::Result<Option<String>> {
    let matcher = config.matcher()?;
    Ok(runtime_state::read_text(path)?.and_then(|contents| matcher.parse_recovery(&contents)))
}

fn status_info(
    config: &LauncherConfig,
    path: &Path,
    network_ip: String,
) -> anyhow::Result<NetworkInfo> {
    let endpoint = match recorded_url(config, path)? {
        Some(url) => PublishedEndpoint::tunnel(url),
        None => PublishedEndpoint::local(local_url(&config.services.api)),
    };
    let ports = PortMap {
        api: config.services.api.port,
        preview: config.services.preview.as_ref().map(|svc| svc.port),
    };
    Ok(NetworkInfo::from_endpoint(&endpoint, network_ip, ports))
}

fn work_dir(arg: Option<PathBuf>) -> anyhow::Result<PathBuf> {
    match arg {
        Some(dir) => Ok(dir),
        None => Ok(env::current_dir()?),
    }
}

/// Wall-clock bound a caller can expect `up` to spend before publishing.
pub fn publish_bound(config: &LauncherConfig) -> Duration {
    let verify = config.verify_policy();
    let readiness = config.readiness_policy();
    let attempts = verify.max_attempts.saturating_sub(1);
    readiness.max_wait
        + Duration::from_secs(config.tunnel.detection_deadline_secs)
        + verify.backoff * attempts
        + verify.probe_timeout * verify.max_attempts
}
