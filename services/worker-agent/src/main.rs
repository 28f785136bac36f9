//! fleet-worker - supervised queue worker with coordinated self-updates.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use colored::Colorize;
use fleet_control_plane::{HttpConfig, HttpControlPlane};
use fleet_model::DeploymentType;
use fleet_worker::config::{self, Cli, Commands, RestartMode, RunArgs, StopArgs, WorkerDirArgs};
use fleet_worker::daemon::{self, DaemonRequest};
use fleet_worker::package::PackageManager;
use fleet_worker::restart::{RestartRequester, SignalSelf, SupervisorRestart};
use fleet_worker::status::{self, StopReport, WorkerStatusReport};
use fleet_worker::supervisor::{SharedLog, LOG_FILE_NAME, PID_FILE_NAME};
use fleet_worker::{
    logging, package, shutdown, CoordinatorConfig, LaunchSpec, MonitorConfig, ProcessSupervisor,
    RunOutcome, RunnerConfig, ShutdownTrigger, UpdateCoordinator, UpdateMonitor, WorkerRunner,
};
use tracing::{error, info};

/// Exit code of `status` when no worker is running.
const EXIT_NOT_RUNNING: i32 = 3;

/// Liveness line interval in daemon mode.
const LIVENESS_INTERVAL: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Run(args) => run(*args).await,
        Commands::Status(args) => show_status(&args),
        Commands::Stop(args) => stop(&args).await,
    };

    match result {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            eprintln!("{} {:#}", "Error:".red().bold(), e);
            std::process::exit(1);
        }
    }
}

async fn run(args: RunArgs) -> Result<i32> {
    let queue_id = args.dir.queue_id()?;
    let worker_dir = args.dir.resolve_worker_dir()?;
    std::fs::create_dir_all(&worker_dir)
        .with_context(|| format!("failed to create worker directory {}", worker_dir.display()))?;

    let daemon_child = daemon::is_daemon_child();
    if args.daemon && !daemon_child {
        logging::init_stderr(args.log_level.as_deref());
        return detach(&worker_dir).await;
    }

    let log = SharedLog::open(
        worker_dir.join(LOG_FILE_NAME),
        args.max_log_size,
        args.max_log_backups,
    )
    .with_context(|| format!("failed to open log in {}", worker_dir.display()))?;

    if daemon_child {
        logging::init_daemon(args.log_level.as_deref(), log.clone());
    } else {
        logging::init_stderr(args.log_level.as_deref());
    }

    let worker_id = config::worker_id(&queue_id);
    let deployment_type = if config::in_kubernetes() {
        DeploymentType::Kubernetes
    } else if daemon_child {
        DeploymentType::Daemon
    } else {
        DeploymentType::Foreground
    };

    let env = BTreeMap::from([
        ("FLEET_QUEUE_ID".to_string(), queue_id.to_string()),
        ("WORKER_ID".to_string(), worker_id.to_string()),
        ("FLEET_CONTROL_PLANE_URL".to_string(), args.control_plane_url.clone()),
        ("FLEET_API_KEY".to_string(), args.api_key.clone()),
    ]);
    let spec = LaunchSpec {
        queue_id: queue_id.clone(),
        program: args.worker_program(&worker_dir),
        args: args.worker_args.clone(),
        env,
        worker_dir: worker_dir.clone(),
        deployment_type,
    };

    let packages: Arc<dyn PackageManager> = Arc::from(package::detect());
    if args.provisions() {
        let report = package::provision(
            packages.as_ref(),
            &args.python,
            &args.venv(&worker_dir),
            &args.package_spec(),
            Path::new(&spec.program),
        )
        .await
        .context("failed to provision worker environment")?;
        info!(
            created_env = report.created_env,
            installed = report.installed,
            manager = packages.name(),
            "Worker environment ready"
        );
    }

    let supervisor = Arc::new(
        ProcessSupervisor::start_with_log(args.supervisor_config(), spec, log)
            .context("failed to start worker")?,
    );
    info!(
        queue_id = %queue_id,
        worker_id = %worker_id,
        worker_dir = %worker_dir.display(),
        auto_update = args.auto_update,
        "Worker agent started"
    );
    if !daemon_child {
        println!(
            "{} Worker started for queue {} (logs: {})",
            "✓".green(),
            queue_id.as_str().bold(),
            supervisor.info().log_file.display()
        );
    }

    let (trigger, signal) = ShutdownTrigger::new();
    let _signals = shutdown::listen_for_os_signals(trigger);

    let mut runner = WorkerRunner::new(
        supervisor.clone(),
        RunnerConfig {
            shutdown_grace: args.stop_grace,
            liveness_interval: daemon_child.then_some(LIVENESS_INTERVAL),
            health_timeout: args.health_timeout,
        },
    );

    if args.auto_update {
        let control_plane = Arc::new(
            HttpControlPlane::new(HttpConfig::new(
                args.control_plane_url.clone(),
                args.api_key.clone(),
            ))
            .context("failed to build control plane client")?,
        );

        let monitor = UpdateMonitor::new(
            control_plane.clone(),
            MonitorConfig {
                queue_id: queue_id.clone(),
                interval: args.monitor_interval(),
            },
        );

        let restarter: Arc<dyn RestartRequester> = match args.restart_mode {
            RestartMode::Supervisor => Arc::new(SupervisorRestart::new(supervisor.clone())),
            RestartMode::Signal => Arc::new(SignalSelf),
        };

        let mut coordinator_config =
            CoordinatorConfig::new(queue_id.clone(), worker_id.clone(), args.venv(&worker_dir));
        coordinator_config.package_name = args.package.clone();
        coordinator_config.allow_downgrade = args.allow_downgrade;

        let coordinator = UpdateCoordinator::new(
            coordinator_config,
            control_plane.clone(),
            control_plane,
            packages.clone(),
            restarter,
        );
        runner = runner.with_updates(monitor, Arc::new(coordinator));
    }

    match runner.run(signal).await {
        RunOutcome::Stopped => Ok(0),
        RunOutcome::CrashLoop { attempts } => {
            error!(attempts, "Worker crash loop, exiting");
            if !daemon_child {
                eprintln!(
                    "{} Worker crashed {} times; logs kept in {}",
                    "✗".red(),
                    attempts,
                    worker_dir.display()
                );
            }
            Ok(1)
        }
    }
}

async fn detach(worker_dir: &Path) -> Result<i32> {
    let request = DaemonRequest::current_exe(
        RunArgs::daemon_child_args(std::env::args()),
        worker_dir.join(PID_FILE_NAME),
        worker_dir.join(LOG_FILE_NAME),
    )?;
    let info = daemon::platform_daemonizer()
        .daemonize(&request)
        .await
        .context("failed to start worker in the background")?;

    println!("{} Worker started in background", "✓".green());
    println!("  PID:      {}", info.pid);
    println!("  Logs:     {}", info.log_file.display());
    println!("  PID file: {}", info.pid_file.display());
    Ok(0)
}

fn show_status(args: &WorkerDirArgs) -> Result<i32> {
    let worker_dir = args.resolve_worker_dir()?;
    match status::status(&worker_dir)? {
        WorkerStatusReport::NotRunning => {
            println!("{} Worker is not running", "●".dimmed());
            Ok(EXIT_NOT_RUNNING)
        }
        WorkerStatusReport::Stale { pid } => {
            println!(
                "{} Worker is not running (removed stale PID file for pid {})",
                "●".yellow(),
                pid
            );
            Ok(EXIT_NOT_RUNNING)
        }
        WorkerStatusReport::Running {
            info,
            uptime,
            log_size,
        } => {
            println!("{} Worker is running", "●".green());
            println!("  Queue:    {}", info.queue_id);
            println!("  PID:      {}", info.pid);
            println!("  Uptime:   {}", status::format_uptime(uptime));
            println!("  Mode:     {:?}", info.deployment_type);
            println!("  Logs:     {}", info.log_file.display());
            if let Some(size) = log_size {
                println!("  Log size: {}", status::format_size(size));
            }
            Ok(0)
        }
    }
}

async fn stop(args: &StopArgs) -> Result<i32> {
    let worker_dir = args.dir.resolve_worker_dir()?;
    match status::stop(&worker_dir, args.grace, args.force).await? {
        StopReport::NotRunning => println!("{} Worker is not running", "●".dimmed()),
        StopReport::Stale { pid } => println!(
            "{} Worker was not running (removed stale PID file for pid {})",
            "●".yellow(),
            pid
        ),
        StopReport::Stopped { pid, forced } => {
            let how = if forced { "killed" } else { "stopped" };
            println!("{} Worker {} (pid {})", "✓".green(), how, pid);
        }
    }
    Ok(0)
}
