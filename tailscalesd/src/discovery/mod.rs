//! Discovery sources and the combinators layered over them.

use std::sync::Arc;

use async_trait::async_trait;
use shared::types::Device;
use tokio_util::sync::CancellationToken;

use crate::error::Result;

pub mod local;
pub mod multi;
pub mod public;
pub mod ratelimited;
mod unix;

pub use local::LocalApi;
pub use multi::MultiDiscoverer;
pub use public::{Credentials, PublicApi};
pub use ratelimited::RateLimited;

/// A source of tailnet devices.
#[async_trait]
pub trait Discoverer: Send + Sync {
    /// Every device visible to this source at call time, in no particular
    /// order. Implementations must give up with [`crate::Error::Canceled`]
    /// once `ctx` is cancelled.
    async fn devices(&self, ctx: &CancellationToken) -> Result<Vec<Device>>;
}

#[async_trait]
impl<T: Discoverer + ?Sized> Discoverer for Arc<T> {
    async fn devices(&self, ctx: &CancellationToken) -> Result<Vec<Device>> {
        (**self).devices(ctx).await
    }
}

#[async_trait]
impl<T: Discoverer + ?Sized> Discoverer for Box<T> {
    async fn devices(&self, ctx: &CancellationToken) -> Result<Vec<Device>> {
        (**self).devices(ctx).await
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use parking_lot::Mutex;

    use super::*;
    use crate::error::Error;

    pub fn device(id: &str) -> Device {
        Device {
            addresses: vec!["100.64.0.1".to_string()],
            api: "test".to_string(),
            authorized: true,
            hostname: id.to_string(),
            id: id.to_string(),
            name: id.to_string(),
            online: true,
            os: "linux".to_string(),
            ..Default::default()
        }
    }

    /// Replays scripted outcomes and counts calls. Once the script runs out
    /// the last outcome repeats.
    pub struct Scripted {
        outcomes: Mutex<VecDeque<std::result::Result<Vec<Device>, u16>>>,
        delay: Duration,
        calls: AtomicUsize,
        canceled: AtomicUsize,
    }

    impl Scripted {
        pub fn new(outcomes: Vec<std::result::Result<Vec<Device>, u16>>) -> Self {
            Self {
                outcomes: Mutex::new(outcomes.into()),
                delay: Duration::ZERO,
                calls: AtomicUsize::new(0),
                canceled: AtomicUsize::new(0),
            }
        }

        pub fn ok(devices: Vec<Device>) -> Self {
            Self::new(vec![Ok(devices)])
        }

        pub fn failing(status: u16) -> Self {
            Self::new(vec![Err(status)])
        }

        pub fn with_delay(mut self, delay: Duration) -> Self {
            self.delay = delay;
            self
        }

        pub fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }

        /// Calls which observed cancellation while delayed
        pub fn canceled(&self) -> usize {
            self.canceled.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Discoverer for Scripted {
        async fn devices(&self, ctx: &CancellationToken) -> Result<Vec<Device>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let outcome = {
                let mut outcomes = self.outcomes.lock();
                if outcomes.len() > 1 {
                    outcomes.pop_front()
                } else {
                    outcomes.front().cloned()
                }
            };

            if !self.delay.is_zero() {
                tokio::select! {
                    _ = tokio::time::sleep(self.delay) => {}
                    _ = ctx.cancelled() => {
                        self.canceled.fetch_add(1, Ordering::SeqCst);
                        return Err(Error::Canceled);
                    }
                }
            }

            match outcome {
                Some(Ok(devices)) => Ok(devices),
                Some(Err(status)) => Err(Error::UnexpectedStatus {
                    api: "test".to_string(),
                    status,
                }),
                None => Ok(Vec::new()),
            }
        }
    }
}
