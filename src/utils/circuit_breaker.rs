//! Fail-fast guard for the payment gateway and courier.
//!
//! After `failure_threshold` consecutive faults the circuit opens and calls
//! are refused until `timeout` has passed. The next call is then a probe:
//! `success_threshold` good results close the circuit again and one fault
//! reopens it. Errors the caller does not classify as faults (a declined
//! payment, a rejected parcel) leave the fault count untouched.

use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    /// Gauge encoding: 0 closed, 1 half-open, 2 open.
    pub fn as_gauge(&self) -> i64 {
        match self {
            CircuitState::Closed => 0,
            CircuitState::HalfOpen => 1,
            CircuitState::Open => 2,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive faults before opening
    pub failure_threshold: u32,
    /// How long the circuit stays open
    pub timeout: Duration,
    /// Successes needed to close from half-open
    pub success_threshold: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            timeout: Duration::from_secs(30),
            success_threshold: 2,
        }
    }
}

/// Where the breaker is, together with the bookkeeping that phase needs.
#[derive(Debug, Clone, Copy)]
enum Phase {
    Closed { faults: u32 },
    Open { since: Instant },
    HalfOpen { successes: u32 },
}

impl Phase {
    fn public(&self) -> CircuitState {
        match self {
            Phase::Closed { .. } => CircuitState::Closed,
            Phase::Open { .. } => CircuitState::Open,
            Phase::HalfOpen { .. } => CircuitState::HalfOpen,
        }
    }
}

/// Shared, cloneable breaker guarding one outbound dependency.
#[derive(Clone)]
pub struct CircuitBreaker {
    name: &'static str,
    phase: Arc<Mutex<Phase>>,
    config: CircuitBreakerConfig,
}

#[derive(Debug, thiserror::Error)]
pub enum CircuitBreakerError<E> {
    #[error("circuit for {0} is open")]
    CircuitOpen(&'static str),

    #[error(transparent)]
    OperationFailed(E),
}

impl CircuitBreaker {
    pub fn new(name: &'static str, config: CircuitBreakerConfig) -> Self {
        Self {
            name,
            phase: Arc::new(Mutex::new(Phase::Closed { faults: 0 })),
            config,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Run `operation` unless the circuit is open.
    ///
    /// `is_fault` decides whether an error counts against the dependency.
    /// The lock is released while the operation runs.
    pub async fn call<F, T, E>(
        &self,
        is_fault: impl Fn(&E) -> bool,
        operation: F,
    ) -> Result<T, CircuitBreakerError<E>>
    where
        F: std::future::Future<Output = Result<T, E>>,
    {
        self.admit().await?;

        let outcome = operation.await;
        let faulted = matches!(&outcome, Err(e) if is_fault(e));
        self.settle(faulted).await;
        outcome.map_err(CircuitBreakerError::OperationFailed)
    }

    async fn admit<E>(&self) -> Result<(), CircuitBreakerError<E>> {
        let mut phase = self.phase.lock().await;
        if let Phase::Open { since } = *phase {
            if since.elapsed() < self.config.timeout {
                return Err(CircuitBreakerError::CircuitOpen(self.name));
            }
            tracing::info!(dependency = self.name, "Circuit half-open, probing");
            *phase = Phase::HalfOpen { successes: 0 };
        }
        Ok(())
    }

    async fn settle(&self, faulted: bool) {
        let mut phase = self.phase.lock().await;
        let next = match (*phase, faulted) {
            (Phase::Closed { .. }, false) => Phase::Closed { faults: 0 },
            (Phase::Closed { faults }, true) if faults + 1 >= self.config.failure_threshold => {
                tracing::warn!(dependency = self.name, failures = faults + 1, "Circuit opened");
                Phase::Open { since: Instant::now() }
            }
            (Phase::Closed { faults }, true) => Phase::Closed { faults: faults + 1 },
            (Phase::HalfOpen { successes }, false) if successes + 1 >= self.config.success_threshold => {
                tracing::info!(dependency = self.name, "Circuit closed");
                Phase::Closed { faults: 0 }
            }
            (Phase::HalfOpen { successes }, false) => Phase::HalfOpen { successes: successes + 1 },
            (Phase::HalfOpen { .. }, true) => {
                tracing::warn!(dependency = self.name, "Probe failed, circuit reopened");
                Phase::Open { since: Instant::now() }
            }
            // a call admitted before another task opened the circuit
            (Phase::Open { .. }, true) => Phase::Open { since: Instant::now() },
            (open @ Phase::Open { .. }, false) => open,
        };
        *phase = next;
    }

    pub async fn state(&self) -> CircuitState {
        self.phase.lock().await.public()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker(failure_threshold: u32, timeout: Duration) -> CircuitBreaker {
        CircuitBreaker::new(
            "gateway",
            CircuitBreakerConfig { failure_threshold, timeout, success_threshold: 1 },
        )
    }

    #[tokio::test]
    async fn test_opens_after_consecutive_faults() {
        let cb = breaker(3, Duration::from_secs(1));

        for _ in 0..3 {
            let result = cb.call(|_| true, async { Err::<(), _>("timeout") }).await;
            assert!(result.is_err());
        }
        assert_eq!(cb.state().await, CircuitState::Open);

        let result = cb.call(|_: &&str| true, async { Ok::<_, &str>(()) }).await;
        assert!(matches!(result, Err(CircuitBreakerError::CircuitOpen("gateway"))));
    }

    #[tokio::test]
    async fn test_rejections_do_not_count_as_faults() {
        let cb = breaker(2, Duration::from_secs(1));

        for _ in 0..5 {
            let _ = cb.call(|_| false, async { Err::<(), _>("declined") }).await;
        }
        assert_eq!(cb.state().await, CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_half_open_probe_closes_circuit() {
        let cb = breaker(2, Duration::from_millis(50));
        for _ in 0..2 {
            let _ = cb.call(|_| true, async { Err::<(), _>("unreachable") }).await;
        }
        assert_eq!(cb.state().await, CircuitState::Open);

        tokio::time::sleep(Duration::from_millis(80)).await;

        let result = cb.call(|_: &&str| true, async { Ok::<_, &str>(()) }).await;
        assert!(result.is_ok());
        assert_eq!(cb.state().await, CircuitState::Closed);
    }
}
