use std::future::Future;
use std::time::Duration;

/// Backoff policy for idempotent reads such as courier status lookups.
///
/// Anything with side effects on the remote end (creating a parcel) must not
/// go through here.
#[derive(Clone, Debug)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(5),
            multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    pub fn with_attempts(max_attempts: u32) -> Self {
        Self { max_attempts: max_attempts.max(1), ..Self::default() }
    }

    /// Delay to wait after the given failed attempt (1-based).
    fn delay_after(&self, attempt: u32) -> Duration {
        let factor = self.multiplier.powi(attempt.saturating_sub(1) as i32);
        let nanos = self.initial_delay.as_nanos() as f64 * factor;
        Duration::from_nanos(nanos.min(u64::MAX as f64) as u64).min(self.max_delay)
    }
}

/// Whether an error is worth another attempt.
pub trait IsTransient {
    fn is_transient(&self) -> bool;
}

/// Call `operation` until it succeeds, fails permanently, or the attempts
/// are used up. The closure receives the 1-based attempt number.
pub async fn retry_on_transient<F, Fut, T, E>(config: &RetryConfig, mut operation: F) -> Result<T, E>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display + IsTransient,
{
    let last = config.max_attempts.max(1);
    let mut attempt = 1;
    loop {
        let error = match operation(attempt).await {
            Ok(value) => return Ok(value),
            Err(error) => error,
        };

        if !error.is_transient() || attempt == last {
            tracing::debug!(attempt, transient = error.is_transient(), %error, "Giving up");
            return Err(error);
        }

        let pause = config.delay_after(attempt);
        tracing::warn!(attempt, %error, pause_ms = pause.as_millis() as u64, "Retrying");
        tokio::time::sleep(pause).await;
        attempt += 1;
    }
}
