//! Retrying proxy for calls into the remote and local services
//!
//! The proxy never loops on its own. Each call attempt sleeps for the current
//! retry delay (if an episode of transient failures is in progress), runs the
//! call, and then classifies the outcome. Looping is left to the call sites,
//! which simply call again on the next cycle.

use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use crate::error::ServiceError;
use crate::timing::{Clock, add_duration};

/// Backoff settings for one proxied service
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryConfig {
    pub min_retry_delay: Duration,
    pub max_retry_delay: Duration,
    pub retry_time_max: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            min_retry_delay: Duration::from_secs(60),
            max_retry_delay: Duration::from_secs(3600),
            retry_time_max: Duration::from_secs(14400),
        }
    }
}

#[derive(Debug, Default)]
struct RetryState {
    retry_delay: Option<Duration>,
    retry_deadline: Option<DateTime<Utc>>,
}

/// Wraps one service instance and owns its retry state
pub struct RetryingProxy<S: ?Sized> {
    name: String,
    service: Arc<S>,
    config: RetryConfig,
    clock: Arc<dyn Clock>,
    state: Mutex<RetryState>,
}

impl<S: ?Sized + Send + Sync> RetryingProxy<S> {
    pub fn new(name: impl Into<String>, service: Arc<S>, config: RetryConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            name: name.into(),
            service,
            config,
            clock,
            state: Mutex::new(RetryState::default()),
        }
    }

    pub fn service(&self) -> &Arc<S> {
        &self.service
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Current delay applied before the next attempt
    pub fn retry_delay(&self) -> Option<Duration> {
        self.lock_state().retry_delay
    }

    fn lock_state(&self) -> MutexGuard<'_, RetryState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Run one attempt of `op` against the service
    pub async fn call<T, F, Fut>(&self, op: F) -> Result<T, ServiceError>
    where
        F: FnOnce(Arc<S>) -> Fut,
        Fut: Future<Output = Result<T, ServiceError>>,
    {
        let delay = self.lock_state().retry_delay;
        if let Some(delay) = delay {
            debug!(proxy = %self.name, secs = delay.as_secs(), "RetryingProxy::call: sleeping before retry");
            self.clock.sleep(delay).await;
        }

        let result = op(Arc::clone(&self.service)).await;
        self.classify(result)
    }

    fn classify<T>(&self, result: Result<T, ServiceError>) -> Result<T, ServiceError> {
        match result {
            Ok(value) => {
                let mut state = self.lock_state();
                if state.retry_delay.is_some() {
                    debug!(proxy = %self.name, "RetryingProxy::classify: success, clearing retry state");
                }
                *state = RetryState::default();
                Ok(value)
            }
            Err(err) if err.is_transient() => Err(self.update_retry(err)),
            Err(err) => Err(err),
        }
    }

    fn update_retry(&self, err: ServiceError) -> ServiceError {
        let now = self.clock.now();
        let mut state = self.lock_state();
        match (state.retry_delay, state.retry_deadline) {
            (Some(delay), Some(deadline)) => {
                if now > deadline {
                    warn!(proxy = %self.name, error = %err, "RetryingProxy::update_retry: retry time exhausted");
                    *state = RetryState::default();
                    return ServiceError::Timeout(format!("{}: {}", self.name, err));
                }
                let next = delay.saturating_mul(2).min(self.config.max_retry_delay);
                debug!(proxy = %self.name, secs = next.as_secs(), "RetryingProxy::update_retry: backing off");
                state.retry_delay = Some(next);
            }
            _ => {
                let deadline = add_duration(now, self.config.retry_time_max);
                debug!(proxy = %self.name, %deadline, "RetryingProxy::update_retry: starting retry episode");
                state.retry_delay = Some(self.config.min_retry_delay);
                state.retry_deadline = Some(deadline);
            }
        }
        match err {
            ServiceError::Temporary(msg) => ServiceError::Temporary(msg),
            other => ServiceError::Temporary(format!("{}: {}", self.name, other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::timing::mock::ManualClock;
    use chrono::TimeZone;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Flaky {
        calls: AtomicUsize,
    }

    impl Flaky {
        fn new() -> Self {
            Self {
                calls: AtomicUsize::new(0),
            }
        }

        async fn fetch(&self, fail: bool) -> Result<u32, ServiceError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if fail {
                Err(ServiceError::Connection("connection refused".to_string()))
            } else {
                Ok(7)
            }
        }
    }

    fn config() -> RetryConfig {
        RetryConfig {
            min_retry_delay: Duration::from_secs(1),
            max_retry_delay: Duration::from_secs(30),
            retry_time_max: Duration::from_secs(90),
        }
    }

    fn setup() -> (Arc<ManualClock>, RetryingProxy<Flaky>) {
        let clock = Arc::new(ManualClock::frozen(Utc.timestamp_opt(1_700_000_000, 0).unwrap()));
        let proxy = RetryingProxy::new("flaky", Arc::new(Flaky::new()), config(), clock.clone());
        (clock, proxy)
    }

    async fn attempt(proxy: &RetryingProxy<Flaky>, fail: bool) -> Result<u32, ServiceError> {
        proxy.call(|svc| async move { svc.fetch(fail).await }).await
    }

    #[tokio::test]
    async fn test_backoff_sequence_then_timeout() {
        let (clock, proxy) = setup();

        for _ in 0..7 {
            let err = attempt(&proxy, true).await.unwrap_err();
            assert!(matches!(err, ServiceError::Temporary(_)));
        }
        assert_eq!(clock.sleeps(), vec![1, 2, 4, 8, 16, 30]);

        clock.advance(Duration::from_secs(91));
        let err = attempt(&proxy, true).await.unwrap_err();
        assert!(err.is_timeout());
        assert!(proxy.retry_delay().is_none());
    }

    #[tokio::test]
    async fn test_success_resets_sequence() {
        let (clock, proxy) = setup();

        attempt(&proxy, true).await.unwrap_err();
        attempt(&proxy, true).await.unwrap_err();
        assert_eq!(proxy.retry_delay(), Some(Duration::from_secs(2)));

        assert_eq!(attempt(&proxy, false).await.unwrap(), 7);
        assert!(proxy.retry_delay().is_none());

        attempt(&proxy, true).await.unwrap_err();
        attempt(&proxy, true).await.unwrap_err();
        assert_eq!(clock.sleeps(), vec![1, 2, 1]);
    }

    #[tokio::test]
    async fn test_non_transient_passes_through() {
        let (clock, proxy) = setup();
        let err = proxy
            .call(|_svc| async { Err::<u32, _>(ServiceError::RequestFailed("no such user".to_string())) })
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::RequestFailed(_)));
        assert!(proxy.retry_delay().is_none());
        assert!(clock.sleeps().is_empty());
    }

    #[tokio::test]
    async fn test_first_failure_does_not_sleep() {
        let (clock, proxy) = setup();
        attempt(&proxy, true).await.unwrap_err();
        assert!(clock.sleeps().is_empty());
        assert_eq!(proxy.service().calls.load(Ordering::SeqCst), 1);
    }
}
