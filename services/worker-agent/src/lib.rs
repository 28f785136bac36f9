//! fleet worker agent
//!
//! Runs one worker process for a queue and keeps it current.
//!
//! ## Architecture
//!
//! - **Supervisor**: spawns the worker in its own process group, restarts it
//!   with exponential backoff and writes its output to a rotating log
//! - **Monitor**: polls the queue configuration and emits update triggers
//! - **Coordinator**: takes the queue's update lock, applies the update,
//!   restarts the worker and checks it comes back healthy
//! - **Runner**: the single reactor multiplexing shutdown, supervisor
//!   outcome, update triggers and liveness ticks

pub mod config;
pub mod coordinator;
pub mod daemon;
pub mod error;
pub mod logging;
pub mod monitor;
pub mod package;
pub mod restart;
pub mod runner;
pub mod shutdown;
pub mod status;
pub mod supervisor;

pub use coordinator::{CoordinatorConfig, UpdateCoordinator, UpdateOutcome};
pub use error::{CoordinatorError, DaemonizeError, PackageError, RestartError, SupervisorError};
pub use monitor::{MonitorConfig, TriggerReceiver, UpdateMonitor};
pub use runner::{RunOutcome, RunnerConfig, WorkerRunner};
pub use shutdown::{ShutdownSignal, ShutdownState, ShutdownTrigger};
pub use supervisor::{LaunchSpec, ProcessSupervisor, SupervisorConfig, SupervisorOutcome, SupervisorState};
