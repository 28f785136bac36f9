//! Update monitor.
//!
//! Polls the queue configuration and emits an [`UpdateTrigger`] whenever the
//! config version or the desired package version moves. Triggers go through
//! a single slot: an unconsumed trigger is merged with the next one, so the
//! consumer never sees more than one pending update.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use fleet_control_plane::DesiredStateSource;
use fleet_id::QueueId;
use fleet_model::{UpdateKind, UpdateTrigger, WorkerQueueConfig};
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::shutdown::ShutdownSignal;

#[derive(Debug, Clone)]
pub struct MonitorConfig {
    pub queue_id: QueueId,
    pub interval: Duration,
}

impl MonitorConfig {
    pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(5 * 60);
    pub const MIN_INTERVAL: Duration = Duration::from_secs(60);
    pub const MAX_INTERVAL: Duration = Duration::from_secs(60 * 60);

    pub fn new(queue_id: QueueId) -> Self {
        Self {
            queue_id,
            interval: Self::DEFAULT_INTERVAL,
        }
    }

    /// Bounds an operator-supplied interval to `[1m, 1h]`.
    pub fn clamp_interval(interval: Duration) -> Duration {
        interval.clamp(Self::MIN_INTERVAL, Self::MAX_INTERVAL)
    }
}

// =============================================================================
// Trigger slot
// =============================================================================

#[derive(Debug, Default)]
struct SlotState {
    pending: Option<UpdateTrigger>,
    closed: bool,
}

#[derive(Debug, Default)]
struct TriggerSlot {
    state: Mutex<SlotState>,
    notify: Notify,
}

impl TriggerSlot {
    fn lock(&self) -> MutexGuard<'_, SlotState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Stores `trigger`, merging it into any pending one. Refused once the
    /// slot is closed.
    fn emit(&self, trigger: UpdateTrigger) -> bool {
        let mut state = self.lock();
        if state.closed {
            return false;
        }
        state.pending = Some(match state.pending.take() {
            Some(pending) => pending.merge(trigger),
            None => trigger,
        });
        drop(state);
        self.notify.notify_one();
        true
    }

    fn close(&self) {
        self.lock().closed = true;
        self.notify.notify_one();
    }
}

/// Consumer side of the monitor's trigger slot.
#[derive(Debug, Clone)]
pub struct TriggerReceiver {
    slot: Arc<TriggerSlot>,
}

impl TriggerReceiver {
    /// Waits for the next trigger. Returns `None` once the monitor has
    /// stopped and the pending trigger (if any) has been taken.
    pub async fn recv(&mut self) -> Option<UpdateTrigger> {
        loop {
            {
                let mut state = self.slot.lock();
                if let Some(trigger) = state.pending.take() {
                    return Some(trigger);
                }
                if state.closed {
                    // Keep later `recv` calls from waiting on a spent permit.
                    drop(state);
                    self.slot.notify.notify_one();
                    return None;
                }
            }
            self.slot.notify.notified().await;
        }
    }

    pub fn try_recv(&mut self) -> Option<UpdateTrigger> {
        self.slot.lock().pending.take()
    }
}

// =============================================================================
// Monitor
// =============================================================================

pub struct UpdateMonitor {
    source: Arc<dyn DesiredStateSource>,
    config: MonitorConfig,
    slot: Arc<TriggerSlot>,
    stop: Option<watch::Sender<bool>>,
    task: Option<JoinHandle<()>>,
}

impl UpdateMonitor {
    pub fn new(source: Arc<dyn DesiredStateSource>, config: MonitorConfig) -> Self {
        Self {
            source,
            config,
            slot: Arc::new(TriggerSlot::default()),
            stop: None,
            task: None,
        }
    }

    pub fn update_chan(&self) -> TriggerReceiver {
        TriggerReceiver {
            slot: self.slot.clone(),
        }
    }

    /// Starts polling. The first successful poll only records the baseline.
    pub fn start(&mut self, shutdown: ShutdownSignal) {
        if self.task.is_some() {
            return;
        }
        info!(
            queue_id = %self.config.queue_id,
            interval_secs = self.config.interval.as_secs(),
            "Starting update monitor"
        );

        let (stop_tx, stop_rx) = watch::channel(false);
        let poller = Poller {
            source: self.source.clone(),
            queue_id: self.config.queue_id.clone(),
            slot: self.slot.clone(),
            baseline: None,
        };
        self.stop = Some(stop_tx);
        self.task = Some(tokio::spawn(poller.run(
            self.config.interval,
            shutdown,
            stop_rx,
        )));
    }

    /// Stops polling. No trigger is emitted after this returns.
    pub async fn stop(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(true);
        }
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                warn!(error = %e, "Update monitor task failed");
            }
        }
        self.slot.close();
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Baseline {
    config_version: String,
    package_version: Option<String>,
}

impl Baseline {
    fn of(config: &WorkerQueueConfig) -> Self {
        Self {
            config_version: config.config_version.clone(),
            package_version: config.desired_package_version().map(str::to_string),
        }
    }
}

struct Poller {
    source: Arc<dyn DesiredStateSource>,
    queue_id: QueueId,
    slot: Arc<TriggerSlot>,
    baseline: Option<Baseline>,
}

impl Poller {
    async fn run(
        mut self,
        interval: Duration,
        mut shutdown: ShutdownSignal,
        mut stop: watch::Receiver<bool>,
    ) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = shutdown.requested() => break,
                _ = stop.changed() => break,
                _ = ticker.tick() => self.poll().await,
            }
        }

        self.slot.close();
        debug!(queue_id = %self.queue_id, "Update monitor stopped");
    }

    async fn poll(&mut self) {
        let config = match self.source.get_queue_config(&self.queue_id).await {
            Ok(config) => config,
            Err(e) => {
                warn!(queue_id = %self.queue_id, error = %e, "Update check failed, retrying next interval");
                return;
            }
        };

        let Some(baseline) = &mut self.baseline else {
            let baseline = Baseline::of(&config);
            info!(
                queue_id = %self.queue_id,
                config_version = %baseline.config_version,
                package_version = baseline.package_version.as_deref().unwrap_or("-"),
                "Recorded update baseline"
            );
            self.baseline = Some(baseline);
            return;
        };

        let Some(trigger) = detect_change(baseline, &config) else {
            debug!(queue_id = %self.queue_id, "No updates");
            return;
        };

        info!(
            queue_id = %self.queue_id,
            kind = %trigger.kind,
            config_version = trigger.new_config_version.as_deref().unwrap_or("-"),
            package_version = trigger.new_package_version.as_deref().unwrap_or("-"),
            "Update detected"
        );
        if !self.slot.emit(trigger) {
            debug!(queue_id = %self.queue_id, "Trigger dropped, monitor stopping");
        }
    }
}

/// Compares `config` against the baseline and moves the baseline forward.
fn detect_change(baseline: &mut Baseline, config: &WorkerQueueConfig) -> Option<UpdateTrigger> {
    let config_changed = config.config_version != baseline.config_version;
    let desired_package = config.desired_package_version();
    let package_changed =
        desired_package.is_some_and(|v| baseline.package_version.as_deref() != Some(v));

    let kind = match (config_changed, package_changed) {
        (false, false) => return None,
        (true, false) => UpdateKind::Config,
        (false, true) => UpdateKind::Package,
        (true, true) => UpdateKind::Both,
    };

    baseline.config_version = config.config_version.clone();
    if let Some(version) = desired_package {
        baseline.package_version = Some(version.to_string());
    }

    let mut trigger = match kind {
        UpdateKind::Config => UpdateTrigger::config(&config.config_version),
        UpdateKind::Package | UpdateKind::Both => {
            UpdateTrigger::package(desired_package.unwrap_or_default())
        }
    };
    if kind == UpdateKind::Both {
        trigger.kind = UpdateKind::Both;
        trigger.new_config_version = Some(config.config_version.clone());
    }
    Some(trigger)
}
