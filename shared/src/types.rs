use std::collections::{BTreeMap, BTreeSet};
use serde::{Deserialize, Deserializer, Serialize};

/// A member of a tailnet, as reported by one of the Tailscale APIs.
/// This is the canonical record produced by every discovery source.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Device {
    /// Tailscale addresses, in the order reported upstream
    #[serde(default, deserialize_with = "null_as_default")]
    pub addresses: Vec<String>,

    /// Host of the API which reported this device
    #[serde(default, deserialize_with = "null_as_default")]
    pub api: String,

    #[serde(default, deserialize_with = "null_as_default")]
    pub authorized: bool,

    /// Empty when not reported
    #[serde(
        default,
        deserialize_with = "null_as_default",
        skip_serializing_if = "String::is_empty"
    )]
    pub client_version: String,

    #[serde(default, deserialize_with = "null_as_default")]
    pub hostname: String,

    /// Opaque identifier, unique within one source. Never parsed.
    #[serde(default, deserialize_with = "null_as_default")]
    pub id: String,

    #[serde(default, deserialize_with = "null_as_default")]
    pub name: String,

    #[serde(
        default,
        alias = "connectedToControl",
        deserialize_with = "null_as_default"
    )]
    pub online: bool,

    #[serde(default, deserialize_with = "null_as_default")]
    pub os: String,

    /// ACL tags, kept sorted so label expansion is reproducible
    #[serde(default, deserialize_with = "null_as_default")]
    pub tags: BTreeSet<String>,

    #[serde(default, deserialize_with = "null_as_default")]
    pub tailnet: String,
}

/// Upstream APIs send `null` for fields they have no value for.
fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

/// A group of targets sharing one label set, in the shape Prometheus HTTP
/// service discovery expects.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetDescriptor {
    pub targets: Vec<String>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
}
