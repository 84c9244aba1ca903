use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::watch;
use tracing::{debug, info};

/// Why a run was told to stop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopCause {
    /// `aw cancel` or a `stop_requested` flag seen in the store.
    Cancelled,
    /// Ctrl-C on the running process.
    Interrupted,
    /// The orchestrator hit an unrecoverable error.
    Fatal(String),
}

impl std::fmt::Display for StopCause {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StopCause::Cancelled => f.write_str("cancelled"),
            StopCause::Interrupted => f.write_str("interrupted"),
            StopCause::Fatal(e) => write!(f, "fatal: {e}"),
        }
    }
}

/// Run-level stop signal.
///
/// Agents poll [`is_shutting_down`](Self::is_shutting_down) at step
/// boundaries; loops that sleep can `select!` on [`stopped`](Self::stopped)
/// instead. Only the first [`trigger`](Self::trigger) records its cause.
///
/// ```ignore
/// let stop = ShutdownSignal::new();
/// tokio::select! {
///     _ = stop.stopped() => { /* wind down */ }
///     _ = tick.tick() => {}
/// }
/// ```
#[derive(Debug, Clone)]
pub struct ShutdownSignal {
    flag: Arc<AtomicBool>,
    cause: Arc<watch::Sender<Option<StopCause>>>,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(None);
        Self {
            flag: Arc::new(AtomicBool::new(false)),
            cause: Arc::new(tx),
        }
    }

    /// Cheap, non-blocking.
    pub fn is_shutting_down(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }

    /// Returns `true` for the call that actually flipped the signal.
    pub fn trigger(&self, cause: StopCause) -> bool {
        if self
            .flag
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            info!(%cause, "stop signal triggered");
            self.cause.send_replace(Some(cause));
            true
        } else {
            debug!(%cause, "stop signal already triggered");
            false
        }
    }

    pub fn cause(&self) -> Option<StopCause> {
        self.cause.borrow().clone()
    }

    /// Resolves once the signal has been triggered.
    pub async fn stopped(&self) {
        let mut rx = self.cause.subscribe();
        // The sender lives in `self`, so `wait_for` cannot see a closed channel.
        let _ = rx.wait_for(|c| c.is_some()).await;
    }
}

impl Default for ShutdownSignal {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn first_trigger_wins() {
        let signal = ShutdownSignal::new();
        assert!(!signal.is_shutting_down());
        assert!(signal.trigger(StopCause::Cancelled));
        assert!(!signal.trigger(StopCause::Fatal("late".into())));
        assert!(signal.is_shutting_down());
        assert_eq!(signal.cause(), Some(StopCause::Cancelled));
    }

    #[test]
    fn clones_share_state() {
        let a = ShutdownSignal::new();
        let b = a.clone();
        b.trigger(StopCause::Interrupted);
        assert!(a.is_shutting_down());
    }

    #[tokio::test]
    async fn stopped_resolves_after_trigger() {
        let signal = ShutdownSignal::new();
        let waiter = {
            let s = signal.clone();
            tokio::spawn(async move { s.stopped().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!waiter.is_finished());
        signal.trigger(StopCause::Cancelled);
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn stopped_returns_immediately_when_already_triggered() {
        let signal = ShutdownSignal::new();
        signal.trigger(StopCause::Interrupted);
        tokio::time::timeout(Duration::from_millis(100), signal.stopped())
            .await
            .unwrap();
    }
}
