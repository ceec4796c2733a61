//! Backoff schedules for transient errors and failed jobs.

use std::future::Future;
use std::time::Duration;

use backoff::{backoff::Backoff, ExponentialBackoff, ExponentialBackoffBuilder};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use state_types::RetrySettings;

use crate::error::IndexingError;

/// Exponential backoff parameters.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// First delay
    pub initial_interval: Duration,
    /// Upper bound on a single delay
    pub max_interval: Duration,
    /// Growth factor between delays
    pub multiplier: f64,
    /// Give up after this long; `None` retries forever
    pub max_elapsed: Option<Duration>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&RetrySettings::default())
    }
}

impl From<&RetrySettings> for RetryPolicy {
    fn from(settings: &RetrySettings) -> Self {
        Self {
            initial_interval: Duration::from_millis(settings.initial_interval_ms),
            max_interval: Duration::from_millis(settings.max_interval_ms),
            multiplier: settings.multiplier,
            max_elapsed: Some(Duration::from_secs(settings.max_elapsed_secs)),
        }
    }
}

impl RetryPolicy {
    /// Set the first delay.
    pub fn with_initial_interval(mut self, interval: Duration) -> Self {
        self.initial_interval = interval;
        self
    }

    /// Set the delay cap.
    pub fn with_max_interval(mut self, interval: Duration) -> Self {
        self.max_interval = interval;
        self
    }

    /// Set the growth factor.
    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier;
        self
    }

    /// Set the overall deadline.
    pub fn with_max_elapsed(mut self, max_elapsed: Option<Duration>) -> Self {
        self.max_elapsed = max_elapsed;
        self
    }

    /// Start a fresh backoff schedule.
    pub fn backoff(&self) -> ExponentialBackoff {
        ExponentialBackoffBuilder::new()
            .with_initial_interval(self.initial_interval)
            .with_max_interval(self.max_interval)
            .with_multiplier(self.multiplier)
            .with_max_elapsed_time(self.max_elapsed)
            .build()
    }
}

/// Run `op`, retrying it while it fails with a transient error.
///
/// Non-transient errors are returned at once. Cancellation is observed
/// before every attempt and while waiting between attempts.
pub async fn retry_transient<T, F, Fut>(
    policy: &RetryPolicy,
    operation: &str,
    cancel: &CancellationToken,
    mut op: F,
) -> Result<T, IndexingError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, IndexingError>>,
{
    let mut backoff = policy.backoff();
    let mut attempts = 0u32;

    loop {
        if cancel.is_cancelled() {
            return Err(IndexingError::Cancelled(format!("{} cancelled", operation)));
        }

        attempts += 1;
        match op().await {
            Ok(value) => {
                if attempts > 1 {
                    debug!(operation, attempts, "Recovered after transient errors");
                }
                return Ok(value);
            }
            Err(e) if !e.is_transient() => return Err(e),
            Err(e) => match backoff.next_backoff() {
                Some(duration) => {
                    warn!(
                        operation,
                        attempt = attempts,
                        error = %e,
                        retry_in_ms = duration.as_millis() as u64,
                        "Transient error, retrying"
                    );
                    tokio::select! {
                        _ = cancel.cancelled() => {
                            return Err(IndexingError::Cancelled(format!(
                                "{} cancelled during backoff",
                                operation
                            )));
                        }
                        _ = tokio::time::sleep(duration) => {}
                    }
                }
                None => {
                    error!(operation, attempts, error = %e, "Backoff exhausted");
                    return Err(e);
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_policy() -> RetryPolicy {
        RetryPolicy::default()
            .with_initial_interval(Duration::from_millis(1))
            .with_max_interval(Duration::from_millis(2))
            .with_max_elapsed(Some(Duration::from_secs(5)))
    }

    #[test]
    fn test_policy_from_settings() {
        let settings = RetrySettings {
            initial_interval_ms: 50,
            max_interval_ms: 400,
            multiplier: 3.0,
            max_elapsed_secs: 10,
        };
        let policy = RetryPolicy::from(&settings);
        assert_eq!(policy.initial_interval, Duration::from_millis(50));
        assert_eq!(policy.max_interval, Duration::from_millis(400));
        assert_eq!(policy.multiplier, 3.0);
        assert_eq!(policy.max_elapsed, Some(Duration::from_secs(10)));
    }

    #[tokio::test]
    async fn test_transient_errors_are_retried() {
        let calls = AtomicU32::new(0);
        let calls_ref = &calls;
        let cancel = CancellationToken::new();

        let result = retry_transient(&fast_policy(), "index", &cancel, move || async move {
            if calls_ref.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(IndexingError::TransientIo("connection reset".into()))
            } else {
                Ok(7)
            }
        })
        .await;

        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_permanent_errors_return_immediately() {
        let calls = AtomicU32::new(0);
        let calls_ref = &calls;
        let cancel = CancellationToken::new();

        let result: Result<(), _> =
            retry_transient(&fast_policy(), "prepare", &cancel, move || async move {
                calls_ref.fetch_add(1, Ordering::SeqCst);
                Err(IndexingError::Index("schema mismatch".into()))
            })
            .await;

        assert!(matches!(result, Err(IndexingError::Index(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_exhausted_backoff_returns_last_error() {
        let cancel = CancellationToken::new();
        let policy = fast_policy().with_max_elapsed(Some(Duration::from_millis(20)));

        let result: Result<(), _> = retry_transient(&policy, "index", &cancel, || async {
            Err(IndexingError::TransientIo("still down".into()))
        })
        .await;

        assert!(matches!(result, Err(IndexingError::TransientIo(_))));
    }

    #[tokio::test]
    async fn test_cancelled_before_first_attempt() {
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result: Result<(), _> =
            retry_transient(&fast_policy(), "complete", &cancel, || async { Ok(()) }).await;

        assert!(matches!(result, Err(IndexingError::Cancelled(_))));
    }
}
