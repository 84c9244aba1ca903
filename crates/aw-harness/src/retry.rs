use std::future::Future;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use aw_telemetry::metrics::{global_metrics, TRANSIENT_RETRIES_TOTAL};
use tracing::warn;

use crate::provider::{ExecutorError, ValidatorError};

/// Errors that know whether repeating the same call could succeed.
pub trait Transient {
    fn is_transient(&self) -> bool;
}

impl Transient for ExecutorError {
    fn is_transient(&self) -> bool {
        ExecutorError::is_transient(self)
    }
}

impl Transient for ValidatorError {
    fn is_transient(&self) -> bool {
        ValidatorError::is_transient(self)
    }
}

// ---------------------------------------------------------------------------
// Backoff
// ---------------------------------------------------------------------------

/// Exponential backoff: `base * 2^n`, capped at `max`, with +/-20% jitter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    pub base: Duration,
    pub max: Duration,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self { base, max }
    }

    pub fn from_millis(base_ms: u64, max_ms: u64) -> Self {
        Self::new(Duration::from_millis(base_ms), Duration::from_millis(max_ms))
    }

    /// Un-jittered delay before retry number `attempt` (0-based).
    pub fn nominal(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.min(20));
        self.base.saturating_mul(factor).min(self.max)
    }

    /// Delay before retry number `attempt`, jittered.
    pub fn delay(&self, attempt: u32) -> Duration {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.subsec_nanos())
            .unwrap_or(0);
        self.jittered(attempt, nanos)
    }

    /// Jitter derived from `seed`, mapped onto [0.8, 1.2].
    fn jittered(&self, attempt: u32, seed: u32) -> Duration {
        let unit = f64::from(seed % 1_000_000) / 1_000_000.0;
        let scale = 0.8 + 0.4 * unit;
        self.nominal(attempt).mul_f64(scale).min(self.max)
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::from_millis(500, 30_000)
    }
}

/// Run `op`, retrying up to `max_retries` extra times while it fails with a
/// transient error. Permanent errors and the last transient error are
/// returned as-is.
pub async fn retry_transient<T, E, F, Fut>(
    backoff: Backoff,
    max_retries: u32,
    label: &str,
    mut op: F,
) -> Result<T, E>
where
    E: Transient + std::fmt::Display,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let mut retry = 0;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_transient() && retry < max_retries => {
                let delay = backoff.delay(retry);
                retry += 1;
                warn!(
                    op = label,
                    retry,
                    max_retries,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "transient failure, backing off"
                );
                global_metrics().increment_counter(TRANSIENT_RETRIES_TOTAL, &[]);
                tokio::time::sleep(delay).await;
            }
            Err(err) => return Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn nominal_doubles_and_caps() {
        let b = Backoff::from_millis(100, 1_000);
        assert_eq!(b.nominal(0), Duration::from_millis(100));
        assert_eq!(b.nominal(1), Duration::from_millis(200));
        assert_eq!(b.nominal(3), Duration::from_millis(800));
        assert_eq!(b.nominal(4), Duration::from_millis(1_000));
        assert_eq!(b.nominal(60), Duration::from_millis(1_000));
    }

    #[test]
    fn jitter_stays_within_twenty_percent() {
        let b = Backoff::from_millis(1_000, 60_000);
        for seed in [0, 1, 250_000, 500_000, 999_999, 123_456_789] {
            let d = b.jittered(0, seed);
            assert!(d >= Duration::from_millis(800), "{d:?}");
            assert!(d <= Duration::from_millis(1_200), "{d:?}");
        }
        // Jitter never exceeds the cap.
        assert!(b.jittered(10, 999_999) <= Duration::from_millis(60_000));
    }

    #[tokio::test]
    async fn retries_transient_until_success() {
        let calls = AtomicU32::new(0);
        let out: Result<u32, ExecutorError> =
            retry_transient(Backoff::from_millis(1, 2), 3, "test", || async {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                if n < 2 {
                    Err(ExecutorError::Transient("rate limit".into()))
                } else {
                    Ok(n)
                }
            })
            .await;
        assert_eq!(out.unwrap(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn permanent_errors_are_not_retried() {
        let calls = AtomicU32::new(0);
        let out: Result<(), ExecutorError> =
            retry_transient(Backoff::from_millis(1, 2), 5, "test", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(ExecutorError::Permanent("syntax error".into()))
            })
            .await;
        assert!(matches!(out, Err(ExecutorError::Permanent(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn gives_up_after_max_retries() {
        let calls = AtomicU32::new(0);
        let out: Result<(), ValidatorError> =
            retry_transient(Backoff::from_millis(1, 2), 2, "test", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(ValidatorError::Timeout(Duration::from_millis(5)))
            })
            .await;
        assert!(out.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
