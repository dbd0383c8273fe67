use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use shared::types::Device;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::Discoverer;
use crate::error::{Error, Result};
use crate::metrics::{self, Metrics};

/// Stand-in for a frequency too large to add to the clock
const NEVER: Duration = Duration::from_secs(60 * 60 * 24 * 365 * 30);

struct Snapshot {
    /// No refresh is attempted before this instant
    earliest: Instant,
    /// Last successfully fetched devices, `None` until the first success
    last: Option<Vec<Device>>,
}

/// Wraps a [`Discoverer`] so it is called no more often than once per
/// `frequency`, serving cached devices in between.
///
/// When a refresh fails after at least one success, the previous devices are
/// returned inside [`Error::Stale`] and the next call retries immediately.
/// Concurrent callers which all observe an expired snapshot each refresh.
pub struct RateLimited<D> {
    wrapped: D,
    frequency: Duration,
    metrics: Arc<dyn Metrics>,
    state: RwLock<Snapshot>,
}

impl<D: Discoverer> RateLimited<D> {
    pub fn new(wrapped: D, frequency: Duration) -> Self {
        Self {
            wrapped,
            frequency,
            metrics: metrics::noop(),
            state: RwLock::new(Snapshot {
                earliest: Instant::now(),
                last: None,
            }),
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<dyn Metrics>) -> Self {
        self.metrics = metrics;
        self
    }

    async fn refresh(
        &self,
        ctx: &CancellationToken,
        previous: Option<Vec<Device>>,
    ) -> Result<Vec<Device>> {
        self.metrics.rate_limited_refresh();

        let devices = match self.wrapped.devices(ctx).await {
            Ok(devices) => devices,
            Err(err) => {
                let Some(devices) = previous else {
                    return Err(err);
                };
                self.metrics.rate_limited_stale();
                return Err(Error::Stale {
                    devices,
                    source: Box::new(err),
                });
            }
        };

        let mut state = self.state.write();
        state.last = Some(devices.clone());
        let now = Instant::now();
        state.earliest = now
            .checked_add(self.frequency)
            .unwrap_or_else(|| now + NEVER);

        Ok(devices)
    }
}

#[async_trait]
impl<D: Discoverer> Discoverer for RateLimited<D> {
    async fn devices(&self, ctx: &CancellationToken) -> Result<Vec<Device>> {
        self.metrics.rate_limited_request();

        let (expired, last) = {
            let state = self.state.read();
            (Instant::now() >= state.earliest, state.last.clone())
        };

        if expired {
            return self.refresh(ctx, last).await;
        }

        Ok(last.unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::testing::{device, Scripted};
    use crate::metrics::Registry;

    const FREQ: Duration = Duration::from_secs(60);

    #[tokio::test(start_paused = true)]
    async fn test_back_to_back_calls_hit_upstream_once() {
        let upstream = Arc::new(Scripted::ok(vec![device("a")]));
        let cache = RateLimited::new(upstream.clone(), FREQ);
        let ctx = CancellationToken::new();

        let first = cache.devices(&ctx).await.unwrap();
        let second = cache.devices(&ctx).await.unwrap();

        assert_eq!(upstream.calls(), 1);
        assert_eq!(first, second);
        assert_eq!(second, vec![device("a")]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_snapshot_refreshes_once_per_call() {
        let upstream = Arc::new(Scripted::new(vec![
            Ok(vec![device("a")]),
            Ok(vec![device("b")]),
        ]));
        let cache = RateLimited::new(upstream.clone(), FREQ);
        let ctx = CancellationToken::new();

        cache.devices(&ctx).await.unwrap();
        tokio::time::advance(FREQ / 2).await;
        assert_eq!(cache.devices(&ctx).await.unwrap(), vec![device("a")]);
        assert_eq!(upstream.calls(), 1);

        tokio::time::advance(FREQ).await;
        assert_eq!(cache.devices(&ctx).await.unwrap(), vec![device("b")]);
        assert_eq!(upstream.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_refresh_serves_stale_snapshot() {
        let upstream = Arc::new(Scripted::new(vec![Ok(vec![device("a")]), Err(503)]));
        let registry = Arc::new(Registry::new());
        let cache = RateLimited::new(upstream.clone(), FREQ).with_metrics(registry.clone());
        let ctx = CancellationToken::new();

        cache.devices(&ctx).await.unwrap();
        tokio::time::advance(FREQ).await;

        let err = cache.devices(&ctx).await.unwrap_err();
        assert!(err.is_stale());
        assert_eq!(err.into_devices(), vec![device("a")]);

        // earliest was not moved forward, so the upstream is retried at once
        let err = cache.devices(&ctx).await.unwrap_err();
        assert!(err.is_stale());
        assert_eq!(upstream.calls(), 3);

        let rendered = registry.render();
        assert!(rendered.contains("tailscalesd_tailscale_rate_limited_requests 3\n"));
        assert!(rendered.contains("tailscalesd_tailscale_rate_limited_refreshes 3\n"));
        assert!(rendered.contains("tailscalesd_tailscale_rate_limited_stale 2\n"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_callers_all_see_refresh() {
        let upstream = Arc::new(
            Scripted::new(vec![Ok(vec![device("a")]), Ok(vec![device("b")])])
                .with_delay(Duration::from_secs(1)),
        );
        let cache = RateLimited::new(upstream.clone(), FREQ);
        let ctx = CancellationToken::new();

        cache.devices(&ctx).await.unwrap();
        tokio::time::advance(FREQ).await;

        let (r1, r2, r3, r4) = tokio::join!(
            cache.devices(&ctx),
            cache.devices(&ctx),
            cache.devices(&ctx),
            cache.devices(&ctx),
        );
        for result in [r1, r2, r3, r4] {
            assert_eq!(result.unwrap(), vec![device("b")]);
        }
        assert!(upstream.calls() >= 2);

        // the refreshed snapshot is served from cache afterwards
        let calls = upstream.calls();
        assert_eq!(cache.devices(&ctx).await.unwrap(), vec![device("b")]);
        assert_eq!(upstream.calls(), calls);
    }

    #[tokio::test(start_paused = true)]
    async fn test_huge_frequency_does_not_overflow() {
        let upstream = Arc::new(Scripted::ok(vec![device("a")]));
        let cache = RateLimited::new(upstream.clone(), Duration::MAX);
        let ctx = CancellationToken::new();

        cache.devices(&ctx).await.unwrap();
        cache.devices(&ctx).await.unwrap();
        assert_eq!(upstream.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_without_snapshot_propagates() {
        let upstream = Arc::new(Scripted::failing(500));
        let cache = RateLimited::new(upstream.clone(), FREQ);

        let err = cache.devices(&CancellationToken::new()).await.unwrap_err();
        assert!(!err.is_stale());
        assert!(err.is_request_failure());
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovers_after_failure() {
        let upstream = Arc::new(Scripted::new(vec![
            Ok(vec![device("a")]),
            Err(503),
            Ok(vec![device("b")]),
        ]));
        let cache = RateLimited::new(upstream.clone(), FREQ);
        let ctx = CancellationToken::new();

        cache.devices(&ctx).await.unwrap();
        tokio::time::advance(FREQ).await;
        assert!(cache.devices(&ctx).await.unwrap_err().is_stale());
        assert_eq!(cache.devices(&ctx).await.unwrap(), vec![device("b")]);
        assert_eq!(cache.devices(&ctx).await.unwrap(), vec![device("b")]);
        assert_eq!(upstream.calls(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_returned_devices_are_independent_copies() {
        let upstream = Arc::new(Scripted::ok(vec![device("a")]));
        let cache = RateLimited::new(upstream, FREQ);
        let ctx = CancellationToken::new();

        let mut first = cache.devices(&ctx).await.unwrap();
        first[0].hostname = "mutated".to_string();
        first.push(device("b"));

        assert_eq!(cache.devices(&ctx).await.unwrap(), vec![device("a")]);
    }
}
