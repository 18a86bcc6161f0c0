use std::future::Future;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use tracing::{info, warn};

use crate::config::CircuitBreakerConfig;
use crate::error::{Error, Result};

/// Three-state breaker guarding every Proxy Store call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

pub struct CircuitBreaker {
    state: Mutex<CircuitState>,
    failure_count: Mutex<u32>,
    opened_at: Mutex<Option<Instant>>,
    config: CircuitBreakerConfig,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        CircuitBreaker {
            state: Mutex::new(CircuitState::Closed),
            failure_count: Mutex::new(0),
            opened_at: Mutex::new(None),
            config,
        }
    }

    /// Admit the call unless the breaker is OPEN and the recovery timeout
    /// has not yet elapsed. Transitions OPEN -> HALF_OPEN once it has.
    fn admit(&self) -> bool {
        let mut state = self.state.lock().unwrap();
        match *state {
            CircuitState::Closed => true,
            CircuitState::HalfOpen => true,
            CircuitState::Open => {
                let opened_at = *self.opened_at.lock().unwrap();
                let elapsed = opened_at.map(|t| t.elapsed()).unwrap_or(Duration::ZERO);
                if elapsed >= self.config.recovery_timeout {
                    *state = CircuitState::HalfOpen;
                    info!("circuit breaker half-open, admitting trial call");
                    true
                } else {
                    false
                }
            }
        }
    }

    fn record_success(&self) {
        *self.failure_count.lock().unwrap() = 0;
        let mut state = self.state.lock().unwrap();
        if *state != CircuitState::Closed {
            info!("circuit breaker closed after successful call");
        }
        *state = CircuitState::Closed;
    }

    fn record_failure(&self) {
        let mut count = self.failure_count.lock().unwrap();
        *count += 1;

        if *count >= self.config.failure_threshold {
            let mut state = self.state.lock().unwrap();
            if *state != CircuitState::Open {
                warn!(failures = *count, "circuit breaker opened");
            }
            *state = CircuitState::Open;
            *self.opened_at.lock().unwrap() = Some(Instant::now());
        }
    }

    /// Invariant #5: while OPEN and within the recovery window, `f` is never
    /// invoked — the caller gets `StoreUnavailable` without touching I/O.
    pub async fn call<F, Fut, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        if !self.admit() {
            return Err(Error::StoreUnavailable);
        }

        match f().await {
            Ok(v) => {
                self.record_success();
                Ok(v)
            }
            Err(e) => {
                self.record_failure();
                Err(e)
            }
        }
    }

    /// Current state as a label, for health-endpoint reporting.
    pub fn state_label(&self) -> &'static str {
        match *self.state.lock().unwrap() {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }

    #[cfg(test)]
    fn is_open(&self) -> bool {
        matches!(*self.state.lock().unwrap(), CircuitState::Open)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker(threshold: u32, recovery: Duration) -> CircuitBreaker {
        CircuitBreaker::new(CircuitBreakerConfig {
            failure_threshold: threshold,
            recovery_timeout: recovery,
        })
    }

    #[tokio::test]
    async fn opens_after_consecutive_failures() {
        let cb = breaker(3, Duration::from_secs(60));
        for _ in 0..2 {
            let _ = cb
                .call(|| async { Err::<(), _>(Error::Internal("boom".into())) })
                .await;
        }
        assert!(!cb.is_open());

        let _ = cb
            .call(|| async { Err::<(), _>(Error::Internal("boom".into())) })
            .await;
        assert!(cb.is_open());
    }

    #[tokio::test]
    async fn open_breaker_short_circuits_without_calling_f() {
        let cb = breaker(1, Duration::from_secs(60));
        let _ = cb
            .call(|| async { Err::<(), _>(Error::Internal("boom".into())) })
            .await;
        assert!(cb.is_open());

        let mut called = false;
        let result = cb
            .call(|| {
                called = true;
                async { Ok::<(), Error>(()) }
            })
            .await;
        assert!(matches!(result, Err(Error::StoreUnavailable)));
        assert!(!called);
    }

    #[tokio::test]
    async fn success_resets_failure_counter_below_threshold() {
        let cb = breaker(3, Duration::from_secs(60));
        let _ = cb
            .call(|| async { Err::<(), _>(Error::Internal("boom".into())) })
            .await;
        let _ = cb.call(|| async { Ok::<(), Error>(()) }).await;
        assert!(!cb.is_open());

        for _ in 0..2 {
            let _ = cb
                .call(|| async { Err::<(), _>(Error::Internal("boom".into())) })
                .await;
        }
        assert!(!cb.is_open());
    }

    #[tokio::test]
    async fn half_open_after_recovery_timeout_then_closes_on_success() {
        let cb = breaker(1, Duration::from_millis(10));
        let _ = cb
            .call(|| async { Err::<(), _>(Error::Internal("boom".into())) })
            .await;
        assert!(cb.is_open());

        tokio::time::sleep(Duration::from_millis(20)).await;

        let result = cb.call(|| async { Ok::<_, Error>(42) }).await;
        assert_eq!(result.unwrap(), 42);
        assert!(!cb.is_open());
    }
}
