use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Parser;
use serde::Deserialize;
use shared::protocol::{DEFAULT_LISTEN, LOCAL_API_SOCKET, PUBLIC_API_HOST};

use crate::discovery::Credentials;

/// Prometheus HTTP service discovery for Tailscale.
#[derive(Debug, Default, Parser)]
#[command(name = "tailscalesd", version)]
pub struct Cli {
    /// TOML configuration file. Flags override values read from it.
    #[arg(long, env = "TAILSCALESD_CONFIG")]
    pub config: Option<PathBuf>,

    /// Address on which to serve Tailscale SD
    #[arg(long, env = "LISTEN")]
    pub address: Option<String>,

    /// Max frequency with which to poll the Tailscale API. Cached results are
    /// served between intervals.
    #[arg(long, env = "TAILSCALE_API_POLL_LIMIT", value_parser = humantime::parse_duration)]
    pub poll: Option<Duration>,

    /// Include IPv6 target addresses
    #[arg(long, env = "EXPOSE_IPV6")]
    pub ipv6: bool,

    /// Use the Tailscale local API exported by the local node's tailscaled
    #[arg(long, env = "TAILSCALE_USE_LOCAL_API")]
    pub localapi: bool,

    /// Unix domain socket on which the local tailscaled API listens
    #[arg(long = "localapi-socket", env = "TAILSCALE_LOCAL_API_SOCKET")]
    pub localapi_socket: Option<PathBuf>,

    /// Tailnet name
    #[arg(long, env = "TAILNET")]
    pub tailnet: Option<String>,

    /// Tailscale API token
    #[arg(long, env = "TAILSCALE_API_TOKEN", hide_env_values = true)]
    pub token: Option<String>,

    /// Tailscale OAuth client ID
    #[arg(long = "client-id", env = "TAILSCALE_CLIENT_ID")]
    pub client_id: Option<String>,

    /// Tailscale OAuth client secret
    #[arg(long = "client-secret", env = "TAILSCALE_CLIENT_SECRET", hide_env_values = true)]
    pub client_secret: Option<String>,

    /// Host of the public Tailscale API
    #[arg(long = "api-host", env = "TAILSCALE_API_HOST")]
    pub api_host: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub discovery: DiscoveryConfig,
    #[serde(default)]
    pub tailscale: TailscaleConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_listen")]
    pub listen: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DiscoveryConfig {
    /// Minimum interval between two requests to the same upstream API
    #[serde(default = "default_poll_limit", with = "humantime_serde")]
    pub poll_limit: Duration,
    #[serde(default)]
    pub include_ipv6: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TailscaleConfig {
    #[serde(default)]
    pub local_api: bool,
    #[serde(default = "default_local_api_socket")]
    pub local_api_socket: PathBuf,
    #[serde(default = "default_tailnet")]
    pub tailnet: String,
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default)]
    pub client_id: Option<String>,
    #[serde(default)]
    pub client_secret: Option<String>,
    #[serde(default = "default_api_host")]
    pub api_host: String,
}

fn default_listen() -> String {
    DEFAULT_LISTEN.to_string()
}

fn default_poll_limit() -> Duration {
    Duration::from_secs(5 * 60)
}

fn default_local_api_socket() -> PathBuf {
    PathBuf::from(LOCAL_API_SOCKET)
}

/// The default tailnet of the credential in use
fn default_tailnet() -> String {
    "-".to_string()
}

fn default_api_host() -> String {
    PUBLIC_API_HOST.to_string()
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
        }
    }
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            poll_limit: default_poll_limit(),
            include_ipv6: false,
        }
    }
}

impl Default for TailscaleConfig {
    fn default() -> Self {
        Self {
            local_api: false,
            local_api_socket: default_local_api_socket(),
            tailnet: default_tailnet(),
            token: None,
            client_id: None,
            client_secret: None,
            api_host: default_api_host(),
        }
    }
}

/// Which upstream sources to query, in registration order.
#[derive(Debug, Clone)]
pub enum Source {
    Local { socket: PathBuf },
    Public { tailnet: String, api_host: String, credentials: Credentials },
}

impl Config {
    /// Load configuration from a TOML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        Ok(config)
    }

    /// Read the config file named on the command line, if any, and apply the
    /// flags on top of it.
    pub fn from_cli(cli: Cli) -> Result<Self> {
        let mut config = match &cli.config {
            Some(path) => Self::load(path)?,
            None => Self::default(),
        };

        if let Some(address) = cli.address {
            config.api.listen = address;
        }
        if let Some(poll) = cli.poll {
            config.discovery.poll_limit = poll;
        }
        config.discovery.include_ipv6 |= cli.ipv6;

        let tailscale = &mut config.tailscale;
        tailscale.local_api |= cli.localapi;
        if let Some(socket) = cli.localapi_socket {
            tailscale.local_api_socket = socket;
        }
        if let Some(tailnet) = cli.tailnet {
            tailscale.tailnet = tailnet;
        }
        if let Some(api_host) = cli.api_host {
            tailscale.api_host = api_host;
        }
        tailscale.token = cli.token.or(tailscale.token.take());
        tailscale.client_id = cli.client_id.or(tailscale.client_id.take());
        tailscale.client_secret = cli.client_secret.or(tailscale.client_secret.take());

        Ok(config)
    }

    /// Sources to query: local API first, then the public API with a token,
    /// then with an OAuth client. Fails when none is configured.
    pub fn sources(&self) -> Result<Vec<Source>> {
        let ts = &self.tailscale;
        let mut sources = Vec::new();

        if ts.local_api {
            sources.push(Source::Local {
                socket: ts.local_api_socket.clone(),
            });
        }

        if let Some(token) = ts.token.as_ref().filter(|t| !t.is_empty()) {
            sources.push(Source::Public {
                tailnet: ts.tailnet.clone(),
                api_host: ts.api_host.clone(),
                credentials: Credentials::Token(token.clone()),
            });
        }

        let client_id = ts.client_id.as_deref().unwrap_or_default();
        let client_secret = ts.client_secret.as_deref().unwrap_or_default();
        if !client_id.is_empty() && !client_secret.is_empty() {
            sources.push(Source::Public {
                tailnet: ts.tailnet.clone(),
                api_host: ts.api_host.clone(),
                credentials: Credentials::OAuth {
                    client_id: client_id.to_string(),
                    client_secret: client_secret.to_string(),
                },
            });
        }

        if sources.is_empty() {
            bail!(
                "Either --localapi, --token and --tailnet, or --client-id and --client-secret are required"
            );
        }

        Ok(sources)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.api.listen, "0.0.0.0:9242");
        assert_eq!(config.discovery.poll_limit, Duration::from_secs(300));
        assert!(!config.discovery.include_ipv6);
        assert_eq!(
            config.tailscale.local_api_socket,
            PathBuf::from("/run/tailscale/tailscaled.sock")
        );
        assert!(config.sources().is_err());
    }

    #[test]
    fn test_parse_toml() {
        let config: Config = toml::from_str(
            r#"
            [api]
            listen = "127.0.0.1:9000"

            [discovery]
            poll_limit = "30s"
            include_ipv6 = true

            [tailscale]
            local_api = true
            tailnet = "example.com"
            token = "tskey-api-xyz"
            "#,
        )
        .unwrap();

        assert_eq!(config.api.listen, "127.0.0.1:9000");
        assert_eq!(config.discovery.poll_limit, Duration::from_secs(30));
        assert!(config.discovery.include_ipv6);
        assert_eq!(config.tailscale.api_host, "api.tailscale.com");

        let sources = config.sources().unwrap();
        assert_eq!(sources.len(), 2);
        assert!(matches!(sources[0], Source::Local { .. }));
        assert!(matches!(
            &sources[1],
            Source::Public { tailnet, credentials: Credentials::Token(_), .. } if tailnet == "example.com"
        ));
    }

    #[test]
    fn test_flags_override_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tailscalesd.toml");
        std::fs::write(
            &path,
            "[discovery]\npoll_limit = \"1m\"\n[tailscale]\ntoken = \"from-file\"\n",
        )
        .unwrap();

        let cli = Cli::try_parse_from([
            "tailscalesd",
            "--config",
            path.to_str().unwrap(),
            "--poll",
            "10s",
            "--client-id",
            "id",
            "--client-secret",
            "secret",
            "--ipv6",
        ])
        .unwrap();
        let config = Config::from_cli(cli).unwrap();

        assert_eq!(config.discovery.poll_limit, Duration::from_secs(10));
        assert!(config.discovery.include_ipv6);
        assert_eq!(config.tailscale.token.as_deref(), Some("from-file"));

        let sources = config.sources().unwrap();
        assert_eq!(sources.len(), 2);
        assert!(matches!(
            &sources[1],
            Source::Public { credentials: Credentials::OAuth { .. }, .. }
        ));
    }

    #[test]
    fn test_oauth_needs_both_halves() {
        let mut config = Config::default();
        config.tailscale.client_id = Some("id".to_string());
        assert!(config.sources().is_err());
    }

    #[test]
    fn test_missing_config_file() {
        let err = Config::load("/nonexistent/tailscalesd.toml").unwrap_err();
        assert!(err.to_string().contains("Failed to read config file"));
    }
}
