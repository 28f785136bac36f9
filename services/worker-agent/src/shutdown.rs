//! Shutdown requests.
//!
//! A [`ShutdownTrigger`] moves the shared state forward, never back:
//! `Running -> Graceful -> Forced`. Any number of [`ShutdownSignal`]s
//! observe it. OS signals are one producer; tests and parent tasks trigger
//! directly.

use std::sync::Arc;

use tokio::sync::watch;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ShutdownState {
    Running,
    /// Stop work and let children exit within their grace period.
    Graceful,
    /// Stop immediately.
    Forced,
}

/// Producer side of a shutdown request.
#[derive(Debug, Clone)]
pub struct ShutdownTrigger {
    tx: Arc<watch::Sender<ShutdownState>>,
}

/// Observer side of a shutdown request.
#[derive(Debug, Clone)]
pub struct ShutdownSignal {
    rx: watch::Receiver<ShutdownState>,
    // Keeps a `never()` signal from observing a closed channel.
    _keepalive: Option<Arc<watch::Sender<ShutdownState>>>,
}

impl ShutdownTrigger {
    pub fn new() -> (Self, ShutdownSignal) {
        let (tx, rx) = watch::channel(ShutdownState::Running);
        let trigger = Self { tx: Arc::new(tx) };
        let signal = ShutdownSignal {
            rx,
            _keepalive: None,
        };
        (trigger, signal)
    }

    pub fn signal(&self) -> ShutdownSignal {
        ShutdownSignal {
            rx: self.tx.subscribe(),
            _keepalive: None,
        }
    }

    pub fn graceful(&self) {
        self.advance(ShutdownState::Graceful);
    }

    pub fn force(&self) {
        self.advance(ShutdownState::Forced);
    }

    pub fn state(&self) -> ShutdownState {
        *self.tx.borrow()
    }

    fn advance(&self, to: ShutdownState) {
        self.tx.send_if_modified(|state| {
            if *state < to {
                *state = to;
                true
            } else {
                false
            }
        });
    }
}

impl ShutdownSignal {
    /// A signal that never fires.
    pub fn never() -> Self {
        let (tx, rx) = watch::channel(ShutdownState::Running);
        Self {
            rx,
            _keepalive: Some(Arc::new(tx)),
        }
    }

    pub fn state(&self) -> ShutdownState {
        *self.rx.borrow()
    }

    pub fn is_requested(&self) -> bool {
        self.state() != ShutdownState::Running
    }

    /// Resolves once any shutdown has been requested.
    pub async fn requested(&mut self) -> ShutdownState {
        self.wait_until(ShutdownState::Graceful).await
    }

    /// Resolves once a forced shutdown has been requested.
    pub async fn forced(&mut self) {
        self.wait_until(ShutdownState::Forced).await;
    }

    async fn wait_until(&mut self, at_least: ShutdownState) -> ShutdownState {
        // Copy out of the watch guard before any further await.
        let reached = self
            .rx
            .wait_for(|state| *state >= at_least)
            .await
            .map(|state| *state);
        match reached {
            Ok(state) => state,
            // Every trigger is gone, so no request can arrive.
            Err(_) => std::future::pending().await,
        }
    }
}

/// Maps OS interrupts onto `trigger`: the first requests a graceful
/// shutdown, the second forces it.
pub fn listen_for_os_signals(trigger: ShutdownTrigger) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut signals = match OsSignals::install() {
            Ok(signals) => signals,
            Err(e) => {
                warn!(error = %e, "Failed to install shutdown signal handlers");
                return;
            }
        };

        signals.next().await;
        info!("Shutdown requested, stopping gracefully (interrupt again to force)");
        trigger.graceful();

        signals.next().await;
        warn!("Second interrupt received, forcing shutdown");
        trigger.force();
    })
}

#[cfg(unix)]
struct OsSignals {
    interrupt: tokio::signal::unix::Signal,
    terminate: tokio::signal::unix::Signal,
}

#[cfg(unix)]
impl OsSignals {
    fn install() -> std::io::Result<Self> {
        use tokio::signal::unix::{signal, SignalKind};
        Ok(Self {
            interrupt: signal(SignalKind::interrupt())?,
            terminate: signal(SignalKind::terminate())?,
        })
    }

    async fn next(&mut self) {
        tokio::select! {
            _ = self.interrupt.recv() => {}
            _ = self.terminate.recv() => {}
        }
    }
}

#[cfg(not(unix))]
struct OsSignals;

#[cfg(not(unix))]
impl OsSignals {
    fn install() -> std::io::Result<Self> {
        Ok(Self)
    }

    async fn next(&mut self) {
        if tokio::signal::ctrl_c().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_state_only_moves_forward() {
        let (trigger, signal) = ShutdownTrigger::new();
        assert_eq!(signal.state(), ShutdownState::Running);

        trigger.force();
        trigger.graceful();
        assert_eq!(signal.state(), ShutdownState::Forced);
    }

    #[tokio::test]
    async fn test_requested_resolves_on_graceful() {
        let (trigger, mut signal) = ShutdownTrigger::new();
        let waiter = tokio::spawn(async move { signal.requested().await });
        trigger.graceful();
        assert_eq!(waiter.await.unwrap(), ShutdownState::Graceful);
    }

    fn assert_send<T: Send>(_: &T) {}

    #[test]
    fn test_wait_futures_are_send() {
        let mut signal = ShutdownSignal::never();
        assert_send(&signal.requested());
        let mut signal = ShutdownSignal::never();
        assert_send(&signal.forced());
    }

    #[tokio::test]
    async fn test_spawned_waiter_on_dropped_trigger_stays_pending() {
        let (trigger, mut signal) = ShutdownTrigger::new();
        drop(trigger);
        let waiter = tokio::spawn(async move { signal.requested().await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());
        waiter.abort();
    }

    #[tokio::test]
    async fn test_forced_waits_for_escalation() {
        let (trigger, mut signal) = ShutdownTrigger::new();
        trigger.graceful();
        let pending = tokio::time::timeout(Duration::from_millis(20), signal.forced()).await;
        assert!(pending.is_err());

        trigger.force();
        tokio::time::timeout(Duration::from_secs(1), signal.forced())
            .await
            .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_never_stays_pending() {
        let mut signal = ShutdownSignal::never();
        let result = tokio::time::timeout(Duration::from_secs(3600), signal.requested()).await;
        assert!(result.is_err());
        assert!(!signal.is_requested());
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_trigger_never_fires() {
        let (trigger, mut signal) = ShutdownTrigger::new();
        drop(trigger);
        let result = tokio::time::timeout(Duration::from_secs(60), signal.requested()).await;
        assert!(result.is_err());
    }
}
