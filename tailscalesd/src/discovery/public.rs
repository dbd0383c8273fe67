//! Client for the public Tailscale v2 API.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::header::ACCEPT;
use reqwest::RequestBuilder;
use serde::Deserialize;
use shared::protocol::{devices_path, OAUTH_DEVICES_SCOPE, OAUTH_TOKEN_PATH, PUBLIC_API_HOST};
use shared::types::Device;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use super::Discoverer;
use crate::error::{Error, Result};
use crate::metrics::{self, Metrics};

const API: &str = "public";
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
/// Access tokens are renewed this long before they expire.
const TOKEN_EXPIRY_MARGIN: Duration = Duration::from_secs(60);

/// How requests to the public API are authenticated.
#[derive(Clone)]
pub enum Credentials {
    /// API access token
    Token(String),
    /// OAuth client, exchanged for short lived access tokens
    OAuth {
        client_id: String,
        client_secret: String,
    },
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Credentials::Token(_) => f.write_str("Token(..)"),
            Credentials::OAuth { client_id, .. } => f
                .debug_struct("OAuth")
                .field("client_id", client_id)
                .finish_non_exhaustive(),
        }
    }
}

#[derive(Deserialize)]
struct DevicesResponse {
    #[serde(default)]
    devices: Vec<Device>,
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: u64,
}

struct AccessToken {
    value: String,
    expires: Instant,
}

/// Discovers the devices of one tailnet through the public API.
pub struct PublicApi {
    client: reqwest::Client,
    base_url: String,
    host: String,
    tailnet: String,
    credentials: Credentials,
    token: Mutex<Option<AccessToken>>,
    metrics: Arc<dyn Metrics>,
}

impl PublicApi {
    pub fn new(tailnet: impl Into<String>, credentials: Credentials) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|err| Error::request(PUBLIC_API_HOST, err))?;

        Ok(Self {
            client,
            base_url: format!("https://{}", PUBLIC_API_HOST),
            host: PUBLIC_API_HOST.to_string(),
            tailnet: tailnet.into(),
            credentials,
            token: Mutex::new(None),
            metrics: metrics::noop(),
        })
    }

    /// Use another API server. Accepts a bare host, which is reached over
    /// https, or a full base URL such as `http://127.0.0.1:8080`.
    pub fn with_api_base(mut self, base: &str) -> Self {
        let base = base.trim_end_matches('/');
        match base.split_once("://") {
            Some((_, host)) => {
                self.base_url = base.to_string();
                self.host = host.to_string();
            }
            None => {
                self.base_url = format!("https://{}", base);
                self.host = base.to_string();
            }
        }
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<dyn Metrics>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn tailnet(&self) -> &str {
        &self.tailnet
    }

    async fn authorize(&self, req: RequestBuilder) -> Result<RequestBuilder> {
        match &self.credentials {
            Credentials::Token(token) => Ok(req.basic_auth(token, None::<&str>)),
            Credentials::OAuth {
                client_id,
                client_secret,
            } => {
                let token = self.access_token(client_id, client_secret).await?;
                Ok(req.bearer_auth(token))
            }
        }
    }

    async fn access_token(&self, client_id: &str, client_secret: &str) -> Result<String> {
        let mut cached = self.token.lock().await;
        if let Some(token) = cached.as_ref() {
            if token.expires > Instant::now() {
                return Ok(token.value.clone());
            }
        }

        self.metrics.api_request(API, &self.host);
        let resp = self
            .client
            .post(format!("{}{}", self.base_url, OAUTH_TOKEN_PATH))
            .form(&[
                ("client_id", client_id),
                ("client_secret", client_secret),
                ("grant_type", "client_credentials"),
                ("scope", OAUTH_DEVICES_SCOPE),
            ])
            .send()
            .await
            .map_err(|err| {
                self.metrics.api_error(API, &self.host);
                Error::request(&self.host, err)
            })?;

        let status = resp.status();
        if !status.is_success() {
            self.metrics.api_error(API, &self.host);
            return Err(Error::UnexpectedStatus {
                api: self.host.clone(),
                status: status.as_u16(),
            });
        }

        let body = resp.bytes().await.map_err(|err| {
            self.metrics.api_error(API, &self.host);
            Error::request(&self.host, err)
        })?;
        let token: TokenResponse = serde_json::from_slice(&body).map_err(|source| {
            self.metrics.api_payload_error(API, &self.host);
            Error::Payload {
                api: self.host.clone(),
                source,
            }
        })?;

        let lifetime = Duration::from_secs(token.expires_in).saturating_sub(TOKEN_EXPIRY_MARGIN);
        // an expiry past what Instant can represent is not cached
        *cached = Instant::now()
            .checked_add(lifetime)
            .map(|expires| AccessToken {
                value: token.access_token.clone(),
                expires,
            });
        tracing::debug!(
            "Obtained OAuth access token valid for {:?}, cached: {}",
            lifetime,
            cached.is_some()
        );

        Ok(token.access_token)
    }

    async fn fetch_devices(&self) -> Result<Vec<Device>> {
        let url = format!("{}{}", self.base_url, devices_path(&self.tailnet));
        let req = self
            .authorize(self.client.get(url).header(ACCEPT, "application/json"))
            .await?;

        self.metrics.api_request(API, &self.host);
        let resp = req.send().await.map_err(|err| {
            self.metrics.api_error(API, &self.host);
            Error::request(&self.host, err)
        })?;

        let status = resp.status();
        if !status.is_success() {
            self.metrics.api_error(API, &self.host);
            return Err(Error::UnexpectedStatus {
                api: self.host.clone(),
                status: status.as_u16(),
            });
        }

        let body = resp.bytes().await.map_err(|err| {
            self.metrics.api_error(API, &self.host);
            Error::request(&self.host, err)
        })?;

        let DevicesResponse { mut devices } =
            serde_json::from_slice(&body).map_err(|source| {
                self.metrics.api_payload_error(API, &self.host);
                Error::Payload {
                    api: self.host.clone(),
                    source,
                }
            })?;

        for device in &mut devices {
            device.api = self.host.clone();
            device.tailnet = self.tailnet.clone();
        }

        Ok(devices)
    }
}

#[async_trait]
impl Discoverer for PublicApi {
    async fn devices(&self, ctx: &CancellationToken) -> Result<Vec<Device>> {
        let start = Instant::now();

        let result = tokio::select! {
            biased;

            _ = ctx.cancelled() => Err(Error::Canceled),
            result = self.fetch_devices() => result,
        };

        self.metrics.api_latency(API, &self.host, start.elapsed());

        match &result {
            Ok(devices) => {
                self.metrics.devices_found(&self.tailnet, devices.len());
                tracing::debug!(
                    "Public API reported {} devices in tailnet {}",
                    devices.len(),
                    self.tailnet
                );
            }
            Err(err) => tracing::warn!("Public API devices request failed: {}", err),
        }

        result
    }
}
