use std::sync::Arc;

use async_trait::async_trait;
use futures::future::join_all;
use shared::types::Device;
use tokio_util::sync::CancellationToken;

use super::Discoverer;
use crate::error::{Error, Result};
use crate::metrics::{self, Metrics};

/// Aggregates the devices of several discoverers.
///
/// Every wrapped discoverer is queried concurrently. Devices are merged in
/// registration order. A failing source does not hide the others: all
/// devices found, including stale ones, are returned inside
/// [`Error::Aggregate`] together with every error encountered.
///
/// The aggregate only counts as stale when every error in it is stale. The
/// discovery route answers 500 for any other aggregate, so one source which
/// has never succeeded (a bad token, say) blanks the targets of healthy
/// sources too. Drop such a source from the configuration instead of relying
/// on the others to cover for it.
pub struct MultiDiscoverer {
    discoverers: Vec<Arc<dyn Discoverer>>,
    metrics: Arc<dyn Metrics>,
}

impl MultiDiscoverer {
    pub fn new(discoverers: Vec<Arc<dyn Discoverer>>) -> Self {
        Self {
            discoverers,
            metrics: metrics::noop(),
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<dyn Metrics>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn push(&mut self, discoverer: Arc<dyn Discoverer>) {
        self.discoverers.push(discoverer);
    }

    pub fn len(&self) -> usize {
        self.discoverers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.discoverers.is_empty()
    }
}

#[async_trait]
impl Discoverer for MultiDiscoverer {
    async fn devices(&self, ctx: &CancellationToken) -> Result<Vec<Device>> {
        self.metrics.multi_request();

        // sub-calls are cancelled when this future is dropped
        let ctx = ctx.child_token();
        let _guard = ctx.clone().drop_guard();

        let tasks = self.discoverers.iter().map(|discoverer| {
            let discoverer = Arc::clone(discoverer);
            let ctx = ctx.clone();
            tokio::spawn(async move { discoverer.devices(&ctx).await })
        });
        // join_all keeps slot order regardless of completion order
        let results = join_all(tasks).await;

        let mut devices = Vec::new();
        let mut errors = Vec::new();
        for result in results {
            match result.map_err(Error::from).and_then(|found| found) {
                Ok(found) => devices.extend(found),
                Err(err) => {
                    self.metrics.multi_error();
                    devices.extend_from_slice(err.devices());
                    errors.push(err);
                }
            }
        }

        if errors.is_empty() {
            Ok(devices)
        } else {
            Err(Error::Aggregate { devices, errors })
        }
    }
}
