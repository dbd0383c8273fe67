use shared::types::Device;

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Errors produced while discovering devices.
///
/// `Stale` and `Aggregate` carry the devices which are still usable, so a
/// caller can decide to serve them anyway. See [`Error::into_devices`].
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The request to an upstream API could not be completed.
    #[error("failed request to {api}: {source}")]
    Request {
        api: String,
        #[source]
        source: BoxError,
    },

    /// The upstream API answered with a non-success status.
    #[error("failed request to {api}: unexpected status {status}")]
    UnexpectedStatus { api: String, status: u16 },

    /// The upstream API answered with a body which could not be decoded.
    #[error("unparseable response from {api}: {source}")]
    Payload {
        api: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("discovery canceled")]
    Canceled,

    /// A fan-out task did not finish normally.
    #[error("discovery task failed: {0}")]
    Join(#[from] tokio::task::JoinError),

    /// Refresh failed, the last good snapshot is served instead.
    #[error("stale discovery results: {source}")]
    Stale {
        devices: Vec<Device>,
        #[source]
        source: Box<Error>,
    },

    /// One or more sources of a multi-source discovery failed.
    #[error("{}", joined(.errors))]
    Aggregate {
        devices: Vec<Device>,
        errors: Vec<Error>,
    },
}

fn joined(errors: &[Error]) -> String {
    errors
        .iter()
        .map(|err| err.to_string())
        .collect::<Vec<_>>()
        .join("\n")
}

impl Error {
    /// True when every failure behind this error was masked by serving cached
    /// results.
    pub fn is_stale(&self) -> bool {
        match self {
            Error::Stale { .. } => true,
            Error::Aggregate { errors, .. } => {
                !errors.is_empty() && errors.iter().all(Error::is_stale)
            }
            _ => false,
        }
    }

    pub fn is_request_failure(&self) -> bool {
        matches!(self, Error::Request { .. } | Error::UnexpectedStatus { .. })
    }

    pub fn is_payload_failure(&self) -> bool {
        matches!(self, Error::Payload { .. })
    }

    /// Devices carried by this error, empty for errors which carry none.
    pub fn devices(&self) -> &[Device] {
        match self {
            Error::Stale { devices, .. } | Error::Aggregate { devices, .. } => devices,
            _ => &[],
        }
    }

    pub fn into_devices(self) -> Vec<Device> {
        match self {
            Error::Stale { devices, .. } | Error::Aggregate { devices, .. } => devices,
            _ => Vec::new(),
        }
    }

    pub(crate) fn request(api: impl Into<String>, source: impl Into<BoxError>) -> Self {
        Error::Request {
            api: api.into(),
            source: source.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn device(id: &str) -> Device {
        Device {
            id: id.to_string(),
            ..Default::default()
        }
    }

    fn stale(id: &str) -> Error {
        Error::Stale {
            devices: vec![device(id)],
            source: Box::new(Error::UnexpectedStatus {
                api: "api.example.com".to_string(),
                status: 503,
            }),
        }
    }

    #[test]
    fn test_stale_predicate() {
        assert!(stale("a").is_stale());
        assert!(!Error::Canceled.is_stale());
        assert!(Error::UnexpectedStatus {
            api: "x".to_string(),
            status: 500
        }
        .is_request_failure());
    }

    #[test]
    fn test_aggregate_stale_only_when_all_stale() {
        let all_stale = Error::Aggregate {
            devices: vec![],
            errors: vec![stale("a"), stale("b")],
        };
        assert!(all_stale.is_stale());

        let mixed = Error::Aggregate {
            devices: vec![],
            errors: vec![stale("a"), Error::Canceled],
        };
        assert!(!mixed.is_stale());

        let empty = Error::Aggregate {
            devices: vec![],
            errors: vec![],
        };
        assert!(!empty.is_stale());
    }

    #[test]
    fn test_aggregate_display_joins_errors() {
        let err = Error::Aggregate {
            devices: vec![],
            errors: vec![stale("a"), Error::Canceled],
        };
        assert_eq!(
            err.to_string(),
            "stale discovery results: failed request to api.example.com: unexpected status 503\ndiscovery canceled"
        );
    }

    #[test]
    fn test_into_devices() {
        assert_eq!(stale("a").into_devices(), vec![device("a")]);
        assert!(Error::Canceled.into_devices().is_empty());
    }
}
