//! Client for the local API served by tailscaled on a unix domain socket.

use std::collections::BTreeMap;
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use http_body_util::{BodyExt, Empty};
use hyper::{Method, Request};
use hyper_util::rt::TokioExecutor;
use serde::Deserialize;
use shared::protocol::{LOCAL_API_AUTHORITY, LOCAL_API_HOST, LOCAL_API_STATUS_PATH};
use shared::types::Device;
use tokio_util::sync::CancellationToken;

use super::unix::UnixConnector;
use super::Discoverer;
use crate::error::{Error, Result};
use crate::metrics::{self, Metrics};

const API: &str = "local";
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

type Client = hyper_util::client::legacy::Client<UnixConnector, Empty<Bytes>>;

/// The subset of the local API status this crate cares about.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Status {
    /// Addresses of the local node
    #[serde(rename = "TailscaleIPs", default)]
    pub tailscale_ips: Option<Vec<IpAddr>>,

    #[serde(rename = "Self", default)]
    pub self_status: Option<PeerStatus>,

    /// Peers keyed by node key
    #[serde(rename = "Peer", default)]
    pub peer: Option<BTreeMap<String, PeerStatus>>,

    #[serde(rename = "CurrentTailnet", default)]
    pub current_tailnet: Option<TailnetStatus>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PeerStatus {
    #[serde(rename = "ID", default)]
    pub id: String,

    #[serde(rename = "HostName", default)]
    pub host_name: String,

    #[serde(rename = "DNSName", default)]
    pub dns_name: String,

    #[serde(rename = "OS", default)]
    pub os: String,

    #[serde(rename = "TailscaleIPs", default)]
    pub tailscale_ips: Option<Vec<IpAddr>>,

    #[serde(rename = "Tags", default)]
    pub tags: Option<Vec<String>>,

    #[serde(rename = "Online", default)]
    pub online: Option<bool>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TailnetStatus {
    #[serde(rename = "Name", default)]
    pub name: String,
}

impl PeerStatus {
    /// The local API only reports peers this node may talk to, so they are
    /// considered authorized. It reports neither name nor client version.
    fn to_device(&self, tailnet: &str) -> Device {
        Device {
            addresses: self
                .tailscale_ips
                .iter()
                .flatten()
                .map(|ip| ip.to_string())
                .collect(),
            api: LOCAL_API_HOST.to_string(),
            authorized: true,
            client_version: String::new(),
            hostname: self.host_name.clone(),
            id: self.id.clone(),
            name: String::new(),
            online: self.online.unwrap_or(true),
            os: self.os.clone(),
            tags: self.tags.iter().flatten().cloned().collect(),
            tailnet: tailnet.to_string(),
        }
    }
}

impl Status {
    /// Peers as devices, ordered by node key.
    pub fn devices(&self) -> Vec<Device> {
        let tailnet = self
            .current_tailnet
            .as_ref()
            .map(|t| t.name.as_str())
            .unwrap_or_default();

        self.peer
            .iter()
            .flatten()
            .map(|(_, peer)| peer.to_device(tailnet))
            .collect()
    }
}

/// Discovers the peers of the local node through tailscaled.
pub struct LocalApi {
    client: Client,
    metrics: Arc<dyn Metrics>,
}

impl LocalApi {
    pub fn new(socket: impl Into<PathBuf>) -> Self {
        let connector = UnixConnector::new(socket.into(), CONNECT_TIMEOUT);
        let client = hyper_util::client::legacy::Client::builder(TokioExecutor::new())
            .build::<_, Empty<Bytes>>(connector);

        Self {
            client,
            metrics: metrics::noop(),
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<dyn Metrics>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Fetch the node status.
    pub async fn status(&self, ctx: &CancellationToken) -> Result<Status> {
        let start = Instant::now();

        let result = tokio::select! {
            biased;

            _ = ctx.cancelled() => Err(Error::Canceled),
            result = tokio::time::timeout(REQUEST_TIMEOUT, self.fetch_status()) => {
                result.unwrap_or_else(|_| {
                    self.metrics.api_error(API, LOCAL_API_HOST);
                    Err(Error::request(LOCAL_API_HOST, "request timed out"))
                })
            }
        };

        self.metrics
            .api_latency(API, LOCAL_API_HOST, start.elapsed());

        result
    }

    async fn fetch_status(&self) -> Result<Status> {
        let req = Request::builder()
            .method(Method::GET)
            .uri(format!(
                "http://{}{}",
                LOCAL_API_AUTHORITY, LOCAL_API_STATUS_PATH
            ))
            .body(Empty::<Bytes>::new())
            .map_err(|err| Error::request(LOCAL_API_HOST, err))?;

        self.metrics.api_request(API, LOCAL_API_HOST);
        let resp = self.client.request(req).await.map_err(|err| {
            self.metrics.api_error(API, LOCAL_API_HOST);
            Error::request(LOCAL_API_HOST, err)
        })?;

        let (parts, incoming) = resp.into_parts();
        if !parts.status.is_success() {
            self.metrics.api_error(API, LOCAL_API_HOST);
            return Err(Error::UnexpectedStatus {
                api: LOCAL_API_HOST.to_string(),
                status: parts.status.as_u16(),
            });
        }

        let body = incoming
            .collect()
            .await
            .map_err(|err| {
                self.metrics.api_error(API, LOCAL_API_HOST);
                Error::request(LOCAL_API_HOST, err)
            })?
            .to_bytes();

        serde_json::from_slice(&body).map_err(|source| {
            self.metrics.api_payload_error(API, LOCAL_API_HOST);
            Error::Payload {
                api: LOCAL_API_HOST.to_string(),
                source,
            }
        })
    }
}

#[async_trait]
impl Discoverer for LocalApi {
    async fn devices(&self, ctx: &CancellationToken) -> Result<Vec<Device>> {
        let status = self.status(ctx).await.inspect_err(|err| {
            tracing::warn!("Local API status request failed: {}", err);
        })?;

        let devices = status.devices();
        tracing::debug!("Local API reported {} peers", devices.len());
        Ok(devices)
    }
}
