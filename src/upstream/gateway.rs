//! Cache-first, budget-gated calls with retry.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tracing::{info_span, Instrument};

use super::{RetryConfig, Upstream, UpstreamError, UpstreamErrorKind};
use crate::budget::{Admission, BudgetTracker, DenialReason};
use crate::cache::Cache;

/// Why a gateway fetch produced no value.
#[derive(Debug, Clone, Error)]
pub enum FetchError {
    #[error("call not admitted: {0}")]
    Denied(#[from] DenialReason),

    #[error(transparent)]
    Upstream(#[from] UpstreamError),
}

impl FetchError {
    pub fn upstream_kind(&self) -> Option<UpstreamErrorKind> {
        match self {
            Self::Denied(_) => None,
            Self::Upstream(e) => Some(e.kind),
        }
    }

    /// Load or budget conditions the caller should absorb with a fallback.
    pub fn is_degradable(&self) -> bool {
        match self {
            Self::Denied(_) => true,
            Self::Upstream(e) => matches!(
                e.kind,
                UpstreamErrorKind::RateLimited
                    | UpstreamErrorKind::QuotaExceeded
                    | UpstreamErrorKind::Transient
            ),
        }
    }
}

/// A fetched value and where it came from.
#[derive(Debug, Clone)]
pub struct Fetched<T> {
    pub value: T,
    pub from_cache: bool,
}

/// Shared cache/budget/retry policy for every [`Upstream`].
pub struct Gateway {
    cache: Arc<Cache>,
    budget: Arc<BudgetTracker>,
    retry: RetryConfig,
    call_timeout: Duration,
}

impl Gateway {
    pub fn new(
        cache: Arc<Cache>,
        budget: Arc<BudgetTracker>,
        retry: RetryConfig,
        call_timeout: Duration,
    ) -> Self {
        Self {
            cache,
            budget,
            retry,
            call_timeout,
        }
    }

    pub fn cache(&self) -> &Arc<Cache> {
        &self.cache
    }

    pub fn budget(&self) -> &Arc<BudgetTracker> {
        &self.budget
    }

    /// Serve from cache, else admit against the budget and call upstream.
    ///
    /// Successful results are cached and recorded. Failed calls release
    /// their reservation; `Malformed` failures are remembered briefly so the
    /// same bad input does not hit the provider again.
    pub async fn fetch<S>(&self, upstream: &S, params: &S::Params) -> Result<Fetched<S::Output>, FetchError>
    where
        S: Upstream + ?Sized,
    {
        let key = upstream.cache_key(params);
        let service = upstream.service();

        if let Some(value) = self.cache.get::<S::Output>(&key) {
            return Ok(Fetched {
                value,
                from_cache: true,
            });
        }

        if let Some(message) = self.cache.get_negative(&key) {
            tracing::debug!(%service, key = %key, "Serving cached permanent failure");
            return Err(UpstreamError::malformed(format!("cached failure: {}", message)).into());
        }

        let reservation = match self.budget.admit(service, self.budget.cost_per_call(service)) {
            Admission::Admitted(reservation) => reservation,
            Admission::Denied(reason) => return Err(reason.into()),
        };

        let span = info_span!("upstream_call", %service, key = %key);
        match self.call_with_retry(upstream, params).instrument(span).await {
            Ok(value) => {
                self.budget.record(reservation, upstream.actual_cost(&value));
                self.cache.put(&key, &value, upstream.output_class(&value));
                Ok(Fetched {
                    value,
                    from_cache: false,
                })
            }
            Err(err) => {
                self.budget.release(reservation);
                if err.kind == UpstreamErrorKind::Malformed {
                    self.cache.put_negative(&key, &err.message);
                }
                if err.kind.is_operator_error() {
                    tracing::error!(%service, error = %err, "Upstream rejected request");
                } else {
                    tracing::warn!(%service, error = %err, "Upstream call failed");
                }
                Err(err.into())
            }
        }
    }

    async fn call_with_retry<S>(&self, upstream: &S, params: &S::Params) -> Result<S::Output, UpstreamError>
    where
        S: Upstream + ?Sized,
    {
        let mut attempt = 1;
        loop {
            let result = match tokio::time::timeout(self.call_timeout, upstream.call(params)).await {
                Ok(result) => result,
                Err(_) => Err(UpstreamError::transient(format!(
                    "no response within {}s",
                    self.call_timeout.as_secs_f64()
                ))),
            };

            match result {
                Ok(value) => return Ok(value),
                Err(err) if err.kind.is_retryable() && attempt < self.retry.max_attempts => {
                    let delay = self.retry.backoff_for(attempt);
                    tracing::warn!(
                        attempt,
                        max_attempts = self.retry.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "Transient upstream failure, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::budget::{BudgetLimits, MemoryUsageStore, Service, UsageStore};
    use crate::cache::{CacheKey, KeyClass, MemoryCache, TtlPolicy};
    use crate::clock::{Clock, ManualClock};
    use async_trait::async_trait;
    use chrono::{TimeZone, Utc};
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Replays scripted results and counts calls.
    struct Scripted {
        results: Mutex<VecDeque<Result<String, UpstreamError>>>,
        calls: AtomicUsize,
        delay: Option<Duration>,
    }

    impl Scripted {
        fn new(results: Vec<Result<String, UpstreamError>>) -> Self {
            Self {
                results: Mutex::new(results.into()),
                calls: AtomicUsize::new(0),
                delay: None,
            }
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Upstream for Scripted {
        type Params = String;
        type Output = String;

        fn service(&self) -> Service {
            Service::Completion
        }

        fn key_class(&self) -> KeyClass {
            KeyClass::Completion
        }

        fn cache_key(&self, params: &String) -> CacheKey {
            CacheKey::from_raw(format!("test:{}", params))
        }

        async fn call(&self, _params: &String) -> Result<String, UpstreamError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            self.results
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok("default".to_string()))
        }
    }

    fn gateway(limits: BudgetLimits) -> (Gateway, Arc<MemoryUsageStore>) {
        let clock: Arc<dyn Clock> = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2024, 2, 1, 10, 0, 0).unwrap(),
        ));
        let usage = Arc::new(MemoryUsageStore::new());
        let cache = Arc::new(Cache::new(
            Arc::new(MemoryCache::new()),
            clock.clone(),
            TtlPolicy::default(),
        ));
        let budget = Arc::new(BudgetTracker::new(usage.clone(), clock, limits));
        let retry = RetryConfig {
            initial_backoff: Duration::from_millis(1),
            jitter: 0.0,
            ..RetryConfig::default()
        };
        (
            Gateway::new(cache, budget, retry, Duration::from_secs(5)),
            usage,
        )
    }

    #[tokio::test]
    async fn test_second_fetch_hits_cache() {
        let (gw, usage) = gateway(BudgetLimits::default());
        let upstream = Scripted::new(vec![Ok("plan".to_string())]);

        let first = gw.fetch(&upstream, &"paris".to_string()).await.unwrap();
        assert!(!first.from_cache);
        let second = gw.fetch(&upstream, &"paris".to_string()).await.unwrap();
        assert!(second.from_cache);
        assert_eq!(second.value, "plan");
        assert_eq!(upstream.calls(), 1);

        let counter = usage
            .counter(Service::Completion, Utc.with_ymd_and_hms(2024, 2, 1, 0, 0, 0).unwrap().date_naive())
            .unwrap();
        assert_eq!(counter.call_count, 1);
    }

    #[tokio::test]
    async fn test_transient_retried_then_succeeds() {
        let (gw, _) = gateway(BudgetLimits::default());
        let upstream = Scripted::new(vec![
            Err(UpstreamError::transient("reset")),
            Err(UpstreamError::from_http(503, "unavailable")),
            Ok("ok".to_string()),
        ]);
        let fetched = gw.fetch(&upstream, &"x".to_string()).await.unwrap();
        assert_eq!(fetched.value, "ok");
        assert_eq!(upstream.calls(), 3);
    }

    #[tokio::test]
    async fn test_transient_exhausts_attempts() {
        let (gw, _) = gateway(BudgetLimits::default());
        let upstream = Scripted::new(vec![
            Err(UpstreamError::transient("1")),
            Err(UpstreamError::transient("2")),
            Err(UpstreamError::transient("3")),
            Ok("late".to_string()),
        ]);
        let err = gw.fetch(&upstream, &"x".to_string()).await.unwrap_err();
        assert_eq!(err.upstream_kind(), Some(UpstreamErrorKind::Transient));
        assert!(err.is_degradable());
        assert_eq!(upstream.calls(), 3);
    }

    #[tokio::test]
    async fn test_quota_not_retried_nor_cached() {
        let (gw, usage) = gateway(BudgetLimits::default());
        let upstream = Scripted::new(vec![
            Err(UpstreamError::quota_exceeded("insufficient_quota")),
            Ok("later".to_string()),
        ]);
        let err = gw.fetch(&upstream, &"x".to_string()).await.unwrap_err();
        assert_eq!(err.upstream_kind(), Some(UpstreamErrorKind::QuotaExceeded));
        assert_eq!(upstream.calls(), 1);

        let counter = usage
            .counter(Service::Completion, Utc.with_ymd_and_hms(2024, 2, 1, 0, 0, 0).unwrap().date_naive())
            .unwrap();
        assert_eq!(counter.call_count, 0);
        assert_eq!(counter.inflight_calls, 0);

        let ok = gw.fetch(&upstream, &"x".to_string()).await.unwrap();
        assert_eq!(ok.value, "later");
    }

    #[tokio::test]
    async fn test_malformed_is_negatively_cached() {
        let (gw, _) = gateway(BudgetLimits::default());
        let upstream = Scripted::new(vec![Err(UpstreamError::malformed("bad input"))]);
        let first = gw.fetch(&upstream, &"x".to_string()).await.unwrap_err();
        assert!(!first.is_degradable());
        let second = gw.fetch(&upstream, &"x".to_string()).await.unwrap_err();
        assert_eq!(second.upstream_kind(), Some(UpstreamErrorKind::Malformed));
        assert_eq!(upstream.calls(), 1);
    }

    #[tokio::test]
    async fn test_denied_makes_no_call() {
        let mut limits = BudgetLimits::default();
        limits.completion.max_calls = 0;
        let (gw, _) = gateway(limits);
        let upstream = Scripted::new(vec![]);
        let err = gw.fetch(&upstream, &"x".to_string()).await.unwrap_err();
        assert!(matches!(err, FetchError::Denied(DenialReason::CallCeiling { .. })));
        assert_eq!(upstream.calls(), 0);
    }

    #[tokio::test]
    async fn test_cancelled_fetch_returns_its_reservation() {
        let mut limits = BudgetLimits::default();
        limits.completion.max_calls = 1;
        let (gw, usage) = gateway(limits);
        let mut slow = Scripted::new(vec![Ok("late".to_string())]);
        slow.delay = Some(Duration::from_millis(500));

        let abandoned =
            tokio::time::timeout(Duration::from_millis(20), gw.fetch(&slow, &"x".to_string())).await;
        assert!(abandoned.is_err());
        assert_eq!(slow.calls(), 1);

        let counter = usage
            .counter(Service::Completion, Utc.with_ymd_and_hms(2024, 2, 1, 0, 0, 0).unwrap().date_naive())
            .unwrap();
        assert_eq!((counter.call_count, counter.inflight_calls), (0, 0));

        let fast = Scripted::new(vec![Ok("now".to_string())]);
        let fetched = gw.fetch(&fast, &"y".to_string()).await.unwrap();
        assert_eq!(fetched.value, "now");
    }

    #[tokio::test]
    async fn test_timeout_is_transient() {
        let (gw, _) = gateway(BudgetLimits::default());
        let gw = Gateway {
            call_timeout: Duration::from_millis(10),
            retry: RetryConfig {
                max_attempts: 1,
                ..RetryConfig::default()
            },
            ..gw
        };
        let mut upstream = Scripted::new(vec![]);
        upstream.delay = Some(Duration::from_millis(200));
        let err = gw.fetch(&upstream, &"slow".to_string()).await.unwrap_err();
        assert_eq!(err.upstream_kind(), Some(UpstreamErrorKind::Transient));
    }
}
