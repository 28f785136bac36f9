//! The worker agent's main loop.
//!
//! One reactor multiplexes the shutdown request, the supervisor's terminal
//! outcome, update triggers from the monitor and an optional liveness tick.
//! Updates run in their own task; no new trigger is taken while one is in
//! flight, so a change observed meanwhile waits (merged) in the monitor's
//! slot.

use std::sync::Arc;
use std::time::Duration;

use fleet_model::UpdateTrigger;
use tokio::task::JoinHandle;
use tokio::time::{Interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::coordinator::{UpdateCoordinator, UpdateOutcome};
use crate::error::CoordinatorError;
use crate::monitor::{TriggerReceiver, UpdateMonitor};
use crate::shutdown::{ShutdownSignal, ShutdownState};
use crate::supervisor::{ProcessSupervisor, SupervisorOutcome};

#[derive(Debug, Clone)]
pub struct RunnerConfig {
    /// Upper bound on the whole shutdown sequence.
    pub shutdown_grace: Duration,
    /// Writes a liveness line into the worker log at this interval.
    pub liveness_interval: Option<Duration>,
    /// Post-update health check deadline.
    pub health_timeout: Duration,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            shutdown_grace: Duration::from_secs(30),
            liveness_interval: None,
            health_timeout: Duration::from_secs(120),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// Shut down on request.
    Stopped,
    /// The supervisor gave up on a crashing worker.
    CrashLoop { attempts: u32 },
}

type UpdateTask = JoinHandle<Result<UpdateOutcome, CoordinatorError>>;

pub struct WorkerRunner {
    supervisor: Arc<ProcessSupervisor>,
    monitor: Option<UpdateMonitor>,
    coordinator: Option<Arc<UpdateCoordinator>>,
    config: RunnerConfig,
}

impl WorkerRunner {
    pub fn new(supervisor: Arc<ProcessSupervisor>, config: RunnerConfig) -> Self {
        Self {
            supervisor,
            monitor: None,
            coordinator: None,
            config,
        }
    }

    /// Enables automatic updates.
    pub fn with_updates(mut self, monitor: UpdateMonitor, coordinator: Arc<UpdateCoordinator>) -> Self {
        self.monitor = Some(monitor);
        self.coordinator = Some(coordinator);
        self
    }

    pub async fn run(mut self, shutdown: ShutdownSignal) -> RunOutcome {
        let mut triggers = self.monitor.as_ref().map(UpdateMonitor::update_chan);
        if let Some(monitor) = &mut self.monitor {
            monitor.start(shutdown.clone());
        }

        let mut liveness = self.config.liveness_interval.map(|every| {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker
        });

        let mut in_flight: Option<UpdateTask> = None;
        let mut signal = shutdown.clone();

        let ended = loop {
            tokio::select! {
                state = signal.requested() => {
                    info!(?state, "Shutdown requested");
                    break None;
                }
                outcome = self.supervisor.wait() => break Some(outcome),
                trigger = next_trigger(&mut triggers), if in_flight.is_none() => match trigger {
                    Some(trigger) => in_flight = self.spawn_update(trigger, &shutdown),
                    None => {
                        debug!("Update monitor closed");
                        triggers = None;
                    }
                },
                result = join_update(&mut in_flight), if in_flight.is_some() => {
                    in_flight = None;
                    self.report_update(result, &shutdown);
                }
                _ = tick(&mut liveness) => self.report_liveness(),
            }
        };

        if let Some(monitor) = &mut self.monitor {
            monitor.stop().await;
        }

        match ended {
            Some(outcome) => {
                if let Some(task) = in_flight {
                    task.abort();
                }
                match outcome {
                    SupervisorOutcome::Stopped => RunOutcome::Stopped,
                    SupervisorOutcome::Failed { attempts } => RunOutcome::CrashLoop { attempts },
                }
            }
            None => {
                self.shut_down(in_flight, signal).await;
                RunOutcome::Stopped
            }
        }
    }

    fn spawn_update(&self, trigger: UpdateTrigger, shutdown: &ShutdownSignal) -> Option<UpdateTask> {
        let coordinator = self.coordinator.clone()?;
        let shutdown = shutdown.clone();
        info!(kind = %trigger.kind, "Applying update");
        Some(tokio::spawn(async move {
            coordinator.coordinate_update(&trigger, &shutdown).await
        }))
    }

    fn report_update(
        &self,
        result: Result<Result<UpdateOutcome, CoordinatorError>, tokio::task::JoinError>,
        shutdown: &ShutdownSignal,
    ) {
        match result {
            Ok(Ok(UpdateOutcome::Applied { kind, lock_id })) => {
                info!(%kind, %lock_id, "Update applied, checking worker health");
                self.spawn_health_check(shutdown);
            }
            Ok(Ok(UpdateOutcome::Deferred { attempts, holder })) => warn!(
                attempts,
                holder = holder.as_ref().map(|h| h.as_str()).unwrap_or("unknown"),
                "Update deferred. Worker will continue running with current version"
            ),
            Ok(Err(e)) => error!(
                error = %e,
                reason = e.reason_code(),
                "Update failed. Worker will continue running with current version"
            ),
            Err(e) => error!(error = %e, "Update task failed"),
        }
    }

    fn spawn_health_check(&self, shutdown: &ShutdownSignal) {
        let Some(coordinator) = self.coordinator.clone() else {
            return;
        };
        let shutdown = shutdown.clone();
        let timeout = self.config.health_timeout;
        tokio::spawn(async move {
            match coordinator.check_health(timeout, &shutdown).await {
                Ok(()) => {}
                Err(CoordinatorError::Cancelled) => {}
                Err(e) => warn!(error = %e, "Worker did not report healthy after update"),
            }
        });
    }

    fn report_liveness(&self) {
        let state = self.supervisor.state();
        let restarts = self.supervisor.restarts();
        debug!(?state, restarts, "Liveness check");
        self.supervisor.log().supervisor_line(&format!(
            "Health check: {state:?}, {restarts} restarts"
        ));
    }

    /// Waits for an in-flight update, then stops the worker, all within the
    /// shutdown grace. A forced request or an expired grace kills the group.
    async fn shut_down(&self, in_flight: Option<UpdateTask>, mut signal: ShutdownSignal) {
        let graceful = async {
            if let Some(task) = in_flight {
                let _ = task.await;
            }
            self.supervisor.stop().await
        };

        let force = tokio::select! {
            biased;
            _ = signal.forced() => {
                warn!("Forced shutdown, killing worker");
                true
            }
            result = tokio::time::timeout(self.config.shutdown_grace, graceful) => match result {
                Ok(Ok(())) => false,
                Ok(Err(e)) => {
                    warn!(error = %e, "Graceful stop failed");
                    true
                }
                Err(_) => {
                    warn!(
                        grace_secs = self.config.shutdown_grace.as_secs(),
                        "Shutdown grace elapsed, killing worker"
                    );
                    true
                }
            },
        };

        if force {
            if let Err(e) = self.supervisor.force_stop().await {
                error!(error = %e, "Failed to kill worker");
            }
        }
        info!(forced = force || signal.state() == ShutdownState::Forced, "Worker agent stopped");
    }
}

async fn next_trigger(triggers: &mut Option<TriggerReceiver>) -> Option<UpdateTrigger> {
    match triggers {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn join_update(
    task: &mut Option<UpdateTask>,
) -> Result<Result<UpdateOutcome, CoordinatorError>, tokio::task::JoinError> {
    match task {
        Some(task) => task.await,
        None => std::future::pending().await,
    }
}

async fn tick(liveness: &mut Option<Interval>) {
    match liveness {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending().await,
    }
}
