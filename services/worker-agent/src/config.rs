//! Command line and environment configuration.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use directories::BaseDirs;
use fleet_id::{QueueId, WorkerId};
use fleet_model::interval::parse_interval;

use crate::monitor::MonitorConfig;
use crate::package::{PackageSpec, VersionReq, DEFAULT_EXTRAS, DEFAULT_PACKAGE};
use crate::supervisor::{BackoffPolicy, RestartPolicy, SupervisorConfig};

/// fleet-worker - run and keep a queue worker up to date.
#[derive(Debug, Parser)]
#[command(name = "fleet-worker")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Start the worker under supervision.
    Run(Box<RunArgs>),

    /// Show the state of a running worker.
    Status(WorkerDirArgs),

    /// Stop a running worker.
    Stop(StopArgs),
}

/// Identifies a worker and its local directory.
#[derive(Debug, Clone, Args)]
pub struct WorkerDirArgs {
    /// Queue the worker serves.
    #[arg(long, env = "FLEET_QUEUE_ID")]
    pub queue_id: String,

    /// Directory holding the PID file, logs and environment.
    /// Defaults to ~/.fleet/workers/<queue-id>.
    #[arg(long, env = "FLEET_WORKER_DIR")]
    pub worker_dir: Option<PathBuf>,
}

impl WorkerDirArgs {
    pub fn queue_id(&self) -> Result<QueueId> {
        QueueId::new(self.queue_id.as_str()).context("invalid queue id")
    }

    pub fn resolve_worker_dir(&self) -> Result<PathBuf> {
        match &self.worker_dir {
            Some(dir) => Ok(dir.clone()),
            None => default_worker_dir(&self.queue_id()?),
        }
    }
}

/// How an applied update restarts the worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum RestartMode {
    /// Restart the supervised worker process in place.
    Supervisor,
    /// Terminate this agent and let its own supervisor restart it.
    Signal,
}

#[derive(Debug, Clone, Args)]
pub struct RunArgs {
    #[command(flatten)]
    pub dir: WorkerDirArgs,

    /// Control plane API key.
    #[arg(long, env = "FLEET_API_KEY", hide_env_values = true)]
    pub api_key: String,

    /// Control plane base URL.
    #[arg(long, env = "FLEET_CONTROL_PLANE_URL", default_value = "http://127.0.0.1:8080")]
    pub control_plane_url: String,

    /// Detach into the background.
    #[arg(short, long)]
    pub daemon: bool,

    /// Rotate the worker log at this size in bytes.
    #[arg(long, env = "FLEET_MAX_LOG_SIZE", default_value_t = 100 * 1024 * 1024)]
    pub max_log_size: u64,

    /// Rotated log files to keep.
    #[arg(long, env = "FLEET_MAX_LOG_BACKUPS", default_value_t = 5)]
    pub max_log_backups: usize,

    /// Crash restarts before giving up.
    #[arg(long, env = "FLEET_MAX_RESTART_ATTEMPTS", default_value_t = 5)]
    pub max_restart_attempts: u32,

    /// Time between SIGTERM and SIGKILL when stopping the worker.
    #[arg(long, env = "FLEET_STOP_GRACE", default_value = "30s", value_parser = parse_duration)]
    pub stop_grace: Duration,

    /// Poll the control plane for configuration and package updates.
    #[arg(long, env = "FLEET_WORKER_AUTOUPDATE")]
    pub auto_update: bool,

    /// Update poll interval, clamped to [1m, 1h].
    #[arg(long, env = "FLEET_WORKER_UPDATE_CHECK_INTERVAL", default_value = "5m", value_parser = parse_duration)]
    pub update_check_interval: Duration,

    /// How long to wait for the worker to report active after an update.
    #[arg(long, env = "FLEET_HEALTH_TIMEOUT", default_value = "2m", value_parser = parse_duration)]
    pub health_timeout: Duration,

    /// Virtual environment of the worker package. Defaults to <worker-dir>/venv.
    #[arg(long, env = "FLEET_WORKER_VENV")]
    pub venv: Option<PathBuf>,

    /// Worker package name.
    #[arg(long, env = "FLEET_WORKER_PACKAGE", default_value = DEFAULT_PACKAGE)]
    pub package: String,

    /// Package version installed on first start. Defaults to the latest.
    #[arg(long, env = "FLEET_WORKER_PACKAGE_VERSION")]
    pub package_version: Option<String>,

    /// Interpreter used to create the virtual environment.
    #[arg(long, env = "FLEET_PYTHON", default_value = "python3")]
    pub python: String,

    /// Launch without creating the environment or installing the package.
    #[arg(long, env = "FLEET_NO_PROVISION")]
    pub no_provision: bool,

    /// Allow updates to an older exact package version.
    #[arg(long, env = "FLEET_ALLOW_DOWNGRADE")]
    pub allow_downgrade: bool,

    #[arg(long, env = "FLEET_WORKER_RESTART_MODE", value_enum, default_value_t = RestartMode::Supervisor)]
    pub restart_mode: RestartMode,

    /// Program to supervise. Defaults to the package entry point in the venv.
    #[arg(long, env = "FLEET_WORKER_COMMAND")]
    pub worker_command: Option<String>,

    /// Log filter, e.g. `info` or `fleet_worker=debug`.
    #[arg(long, env = "FLEET_LOG_LEVEL")]
    pub log_level: Option<String>,

    /// Arguments passed to the worker program.
    #[arg(last = true)]
    pub worker_args: Vec<String>,
}

impl RunArgs {
    pub fn venv(&self, worker_dir: &std::path::Path) -> PathBuf {
        self.venv.clone().unwrap_or_else(|| worker_dir.join("venv"))
    }

    pub fn worker_program(&self, worker_dir: &std::path::Path) -> String {
        match &self.worker_command {
            Some(command) => command.clone(),
            None => {
                let bin = if cfg!(windows) { "Scripts" } else { "bin" };
                self.venv(worker_dir)
                    .join(bin)
                    .join(&self.package)
                    .display()
                    .to_string()
            }
        }
    }

    /// Whether the environment is provisioned before launch. A custom worker
    /// command brings its own environment.
    pub fn provisions(&self) -> bool {
        !self.no_provision && self.worker_command.is_none()
    }

    /// Package requested on first start.
    pub fn package_spec(&self) -> PackageSpec {
        PackageSpec::new(
            &self.package,
            Some(DEFAULT_EXTRAS.to_string()),
            VersionReq::parse(self.package_version.as_deref().unwrap_or_default()),
        )
    }

    pub fn supervisor_config(&self) -> SupervisorConfig {
        SupervisorConfig {
            max_log_size: self.max_log_size,
            max_log_backups: self.max_log_backups,
            restart: RestartPolicy {
                max_attempts: self.max_restart_attempts,
                backoff: BackoffPolicy::default(),
                ..RestartPolicy::default()
            },
            stop_grace: self.stop_grace,
        }
    }

    pub fn monitor_interval(&self) -> Duration {
        MonitorConfig::clamp_interval(self.update_check_interval)
    }

    /// Arguments for the detached child: everything but `--daemon`.
    /// Anything after `--` belongs to the worker and passes through as is.
    pub fn daemon_child_args(raw: impl IntoIterator<Item = String>) -> Vec<String> {
        let mut passthrough = false;
        raw.into_iter()
            .skip(1)
            .filter(|arg| {
                if passthrough {
                    return true;
                }
                if arg == "--" {
                    passthrough = true;
                    return true;
                }
                arg != "--daemon" && arg != "-d"
            })
            .collect()
    }
}

#[derive(Debug, Clone, Args)]
pub struct StopArgs {
    #[command(flatten)]
    pub dir: WorkerDirArgs,

    /// Send SIGKILL instead of SIGTERM.
    #[arg(long)]
    pub force: bool,

    /// Time to wait before escalating to SIGKILL.
    #[arg(long, default_value = "30s", value_parser = parse_duration)]
    pub grace: Duration,
}

fn parse_duration(value: &str) -> Result<Duration, String> {
    parse_interval(value).ok_or_else(|| format!("invalid duration `{value}`, expected e.g. 30s, 5m, 1h"))
}

/// `~/.fleet/workers/<queue-id>`.
pub fn default_worker_dir(queue_id: &QueueId) -> Result<PathBuf> {
    let dirs = BaseDirs::new().context("could not determine home directory")?;
    Ok(dirs
        .home_dir()
        .join(".fleet")
        .join("workers")
        .join(queue_id.as_str()))
}

/// Identity this host's worker registers under.
pub fn worker_id(queue_id: &QueueId) -> WorkerId {
    WorkerId::for_queue(queue_id, hostname().as_deref())
}

#[cfg(unix)]
fn hostname() -> Option<String> {
    nix::unistd::gethostname()
        .ok()
        .and_then(|name| name.into_string().ok())
}

#[cfg(not(unix))]
fn hostname() -> Option<String> {
    std::env::var("COMPUTERNAME").ok()
}

/// Whether the agent runs inside a cluster pod.
pub fn in_kubernetes() -> bool {
    std::env::var_os("KUBERNETES_SERVICE_HOST").is_some()
}
