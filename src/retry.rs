use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

/// Configuration for retry behavior
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of attempts (including the first one)
    pub max_attempts: u32,
    /// Initial delay before the first retry
    pub initial_delay: Duration,
    /// Maximum delay between retries
    pub max_delay: Duration,
    /// Multiplier for exponential backoff (e.g., 2.0 doubles the delay each time)
    pub backoff_multiplier: f64,
    /// Random extra delay as a fraction of the computed delay (0.0 disables jitter)
    pub jitter: f64,
}

impl RetryConfig {
    /// Create a new retry configuration
    pub fn new(max_attempts: u32, initial_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            initial_delay,
            max_delay: Duration::from_secs(60),
            backoff_multiplier: 2.0,
            jitter: 0.0,
        }
    }

    /// Set the maximum delay between retries
    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = max_delay;
        self
    }

    /// Set the backoff multiplier
    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    /// Set the jitter fraction (clamped to 0.0..=1.0)
    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    /// Preset: translation provider calls.
    ///
    /// `retries` counts retries, not attempts: `retries = 2` allows 3 calls.
    /// Delays: wait, 2*wait, 4*wait, ... capped at 60s, plus up to 25% jitter
    /// so many languages retrying at once do not hit the provider in lockstep.
    pub fn translation(retries: u32, wait: Duration) -> Self {
        Self::new(retries.saturating_add(1), wait)
            .with_max_delay(Duration::from_secs(60))
            .with_backoff_multiplier(2.0)
            .with_jitter(0.25)
    }

    /// Preset: fetching published dictionaries. 3 attempts, 500ms then 1s.
    pub fn remote_fetch() -> Self {
        Self::new(3, Duration::from_millis(500))
            .with_max_delay(Duration::from_secs(2))
            .with_backoff_multiplier(2.0)
    }

    /// Backoff before the 0-indexed `attempt`, jitter not applied
    fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let delay_ms = self.initial_delay.as_millis() as f64
            * self.backoff_multiplier.powi((attempt - 1) as i32);

        let delay = Duration::from_millis(delay_ms as u64);
        delay.min(self.max_delay)
    }

    /// Delay for an attempt with jitter applied, never above `max_delay`
    fn jittered_delay_for_attempt(&self, attempt: u32) -> Duration {
        let base = self.delay_for_attempt(attempt);
        if base.is_zero() || self.jitter <= 0.0 {
            return base;
        }

        let extra = rand::rng().random_range(0.0..=self.jitter);
        base.mul_f64(1.0 + extra).min(self.max_delay)
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::translation(10, Duration::from_secs(2))
    }
}

/// Run `operation` until it succeeds, `should_retry` rejects its error, or
/// `config.max_attempts` calls have been made.
///
/// Waits between attempts suspend only the calling task.
pub async fn with_retry_if<T, E, F, Fut, P>(
    config: &RetryConfig,
    operation_name: &str,
    mut operation: F,
    should_retry: P,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
    P: Fn(&E) -> bool,
{
    let max_attempts = config.max_attempts.max(1);
    let mut attempt = 0;

    loop {
        // Wait before retry (except for first attempt)
        let delay = config.jittered_delay_for_attempt(attempt);
        if !delay.is_zero() {
            debug!(
                "{}: Retry attempt {}/{} after {:?}",
                operation_name,
                attempt + 1,
                max_attempts,
                delay
            );
            sleep(delay).await;
        }

        match operation().await {
            Ok(result) => {
                if attempt > 0 {
                    debug!(
                        "{}: Succeeded on attempt {}/{}",
                        operation_name,
                        attempt + 1,
                        max_attempts
                    );
                }
                return Ok(result);
            }
            Err(e) => {
                if !should_retry(&e) {
                    debug!(
                        "{}: Error is not retryable, failing immediately: {}",
                        operation_name, e
                    );
                    return Err(e);
                }

                attempt += 1;
                let remaining = max_attempts.saturating_sub(attempt);
                if remaining == 0 {
                    warn!(
                        "{}: All {} attempts failed. Last error: {}",
                        operation_name, max_attempts, e
                    );
                    return Err(e);
                }

                warn!(
                    "{}: Attempt {}/{} failed ({}), {} retries remaining",
                    operation_name, attempt, max_attempts, e, remaining
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_retry_config_defaults() {
        let config = RetryConfig::default();
        assert_eq!(config.max_attempts, 11);
        assert_eq!(config.initial_delay, Duration::from_secs(2));
        assert_eq!(config.jitter, 0.25);
    }

    #[test]
    fn test_translation_preset_counts_retries_not_attempts() {
        let config = RetryConfig::translation(2, Duration::from_millis(10));
        assert_eq!(config.max_attempts, 3);
    }

    #[test]
    fn test_zero_attempts_clamped_to_one() {
        let config = RetryConfig::new(0, Duration::from_millis(10));
        assert_eq!(config.max_attempts, 1);
    }

    #[test]
    fn test_retry_config_remote_fetch() {
        let config = RetryConfig::remote_fetch();
        assert_eq!(config.max_attempts, 3);
        assert_eq!(config.initial_delay, Duration::from_millis(500));
    }

    #[test]
    fn test_delay_calculation() {
        let config = RetryConfig::new(4, Duration::from_secs(1)).with_backoff_multiplier(2.0);

        assert_eq!(config.delay_for_attempt(0), Duration::ZERO);
        assert_eq!(config.delay_for_attempt(1), Duration::from_secs(1));
        assert_eq!(config.delay_for_attempt(2), Duration::from_secs(2));
        assert_eq!(config.delay_for_attempt(3), Duration::from_secs(4));
    }

    #[test]
    fn test_delay_respects_max() {
        let config = RetryConfig::new(10, Duration::from_secs(1))
            .with_max_delay(Duration::from_secs(3))
            .with_backoff_multiplier(2.0);

        // Attempt 4 would be 8 seconds, but max is 3
        assert_eq!(config.delay_for_attempt(4), Duration::from_secs(3));
    }

    #[test]
    fn test_jitter_stays_within_bounds() {
        let config = RetryConfig::new(5, Duration::from_millis(100))
            .with_max_delay(Duration::from_secs(10))
            .with_jitter(0.5);

        for _ in 0..100 {
            let delay = config.jittered_delay_for_attempt(2);
            assert!(delay >= Duration::from_millis(200), "{:?}", delay);
            assert!(delay <= Duration::from_millis(300), "{:?}", delay);
        }
    }

    #[test]
    fn test_jitter_never_exceeds_max_delay() {
        let config = RetryConfig::new(5, Duration::from_secs(1))
            .with_max_delay(Duration::from_secs(1))
            .with_jitter(1.0);

        for _ in 0..50 {
            assert!(config.jittered_delay_for_attempt(3) <= Duration::from_secs(1));
        }
    }

    #[test]
    fn test_jitter_clamped() {
        let config = RetryConfig::new(2, Duration::from_millis(10)).with_jitter(7.0);
        assert_eq!(config.jitter, 1.0);
        let config = config.with_jitter(-1.0);
        assert_eq!(config.jitter, 0.0);
    }

    /// Run `with_retry_if` against an operation that fails `failures` times
    /// with `error`, returning the result and the number of calls made.
    async fn run_flaky(
        config: &RetryConfig,
        failures: u32,
        error: &'static str,
        retryable: fn(&&'static str) -> bool,
    ) -> (Result<u32, &'static str>, u32) {
        let calls = Arc::new(AtomicU32::new(0));
        let result = with_retry_if(
            config,
            "flaky",
            || {
                let calls = calls.clone();
                async move {
                    let call = calls.fetch_add(1, Ordering::SeqCst);
                    if call < failures {
                        Err(error)
                    } else {
                        Ok(call)
                    }
                }
            },
            retryable,
        )
        .await;
        (result, calls.load(Ordering::SeqCst))
    }

    #[tokio::test]
    async fn test_first_success_is_not_retried() {
        let config = RetryConfig::new(3, Duration::from_millis(5));
        let (result, calls) = run_flaky(&config, 0, "unused", |_| true).await;
        assert_eq!(result, Ok(0));
        assert_eq!(calls, 1);
    }

    #[tokio::test]
    async fn test_transient_failures_are_retried() {
        let config = RetryConfig::translation(2, Duration::from_millis(5));
        let (result, calls) = run_flaky(&config, 2, "503", |_| true).await;
        assert_eq!(result, Ok(2));
        assert_eq!(calls, 3);
    }

    #[tokio::test]
    async fn test_last_error_returned_when_attempts_run_out() {
        let config = RetryConfig::new(3, Duration::from_millis(5));
        let (result, calls) = run_flaky(&config, u32::MAX, "connection reset", |_| true).await;
        assert_eq!(result, Err("connection reset"));
        assert_eq!(calls, 3);
    }

    #[tokio::test]
    async fn test_non_retryable_error_fails_fast() {
        let config = RetryConfig::new(3, Duration::from_millis(5));
        let (result, calls) =
            run_flaky(&config, u32::MAX, "400 bad request", |e| !e.starts_with("4")).await;
        assert_eq!(result, Err("400 bad request"));
        assert_eq!(calls, 1);
    }

    #[tokio::test]
    async fn test_retry_wait_does_not_block_other_tasks() {
        let config = RetryConfig::new(2, Duration::from_millis(200));
        let ticks = Arc::new(AtomicU32::new(0));
        let ticks_clone = ticks.clone();

        // Runs on the same current-thread runtime while the retry is sleeping
        let ticker = tokio::spawn(async move {
            for _ in 0..5 {
                ticks_clone.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        });

        let result: Result<(), &str> =
            with_retry_if(&config, "test", || async { Err("down") }, |_| true).await;

        assert!(result.is_err());
        ticker.await.expect("ticker should finish");
        assert_eq!(ticks.load(Ordering::SeqCst), 5);
    }
}
