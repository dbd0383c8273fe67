//! Translation of devices into Prometheus HTTP SD target descriptors.

use std::collections::BTreeMap;
use std::net::IpAddr;

use shared::protocol::{
    EMPTY_TAG, LABEL_META_API, LABEL_META_DEVICE_AUTHORIZED, LABEL_META_DEVICE_CLIENT_VERSION,
    LABEL_META_DEVICE_HOSTNAME, LABEL_META_DEVICE_ID, LABEL_META_DEVICE_NAME,
    LABEL_META_DEVICE_ONLINE, LABEL_META_DEVICE_OS, LABEL_META_DEVICE_TAG_PREFIX,
    LABEL_META_TAILNET, TAG_LABEL_VALUE,
};
use shared::types::{Device, TargetDescriptor};

/// Transforms a descriptor before it is served. Filters are plain functions,
/// so they cannot carry state between descriptors.
pub type TargetFilter = fn(TargetDescriptor) -> TargetDescriptor;

/// Label key for a device tag: `tag:Prod-1234` becomes
/// `__meta_tailscale_device_tag_prod_1234`.
pub fn tag_to_label_key(tag: &str) -> String {
    let name = tag.strip_prefix("tag:").unwrap_or(tag);
    let mut name = name.to_lowercase().replace([':', '-'], "_");
    if name.is_empty() {
        name = EMPTY_TAG.to_string();
    }

    format!("{}{}", LABEL_META_DEVICE_TAG_PREFIX, name)
}

/// Drop every label with an empty key or value.
pub fn filter_empty_labels(mut td: TargetDescriptor) -> TargetDescriptor {
    td.labels.retain(|k, v| !k.is_empty() && !v.is_empty());
    td
}

/// Keep only IPv4 targets. IPv4-mapped IPv6 addresses are rewritten to their
/// IPv4 form. Targets which are not IP addresses at all are left alone.
pub fn filter_ipv6_addresses(mut td: TargetDescriptor) -> TargetDescriptor {
    td.targets = td
        .targets
        .into_iter()
        .filter_map(|target| match target.parse::<IpAddr>() {
            Err(_) => Some(target),
            Ok(IpAddr::V4(v4)) => Some(v4.to_string()),
            Ok(IpAddr::V6(v6)) => v6.to_ipv4_mapped().map(|v4| v4.to_string()),
        })
        .collect();
    td
}

fn labels(device: &Device) -> BTreeMap<String, String> {
    let mut labels = BTreeMap::from([
        (LABEL_META_API.to_string(), device.api.clone()),
        (
            LABEL_META_DEVICE_AUTHORIZED.to_string(),
            device.authorized.to_string(),
        ),
        (
            LABEL_META_DEVICE_CLIENT_VERSION.to_string(),
            device.client_version.clone(),
        ),
        (LABEL_META_DEVICE_HOSTNAME.to_string(), device.hostname.clone()),
        (LABEL_META_DEVICE_ID.to_string(), device.id.clone()),
        (LABEL_META_DEVICE_NAME.to_string(), device.name.clone()),
        (LABEL_META_DEVICE_ONLINE.to_string(), device.online.to_string()),
        (LABEL_META_DEVICE_OS.to_string(), device.os.clone()),
        (LABEL_META_TAILNET.to_string(), device.tailnet.clone()),
    ]);

    for tag in &device.tags {
        labels.insert(tag_to_label_key(tag), TAG_LABEL_VALUE.to_string());
    }

    labels
}

/// One descriptor per device, in device order, with `filters` applied in
/// order to each. No devices yields an empty list.
pub fn translate(devices: &[Device], filters: &[TargetFilter]) -> Vec<TargetDescriptor> {
    devices
        .iter()
        .map(|device| {
            let td = TargetDescriptor {
                targets: device.addresses.clone(),
                labels: labels(device),
            };
            filters.iter().fold(td, |td, filter| filter(td))
        })
        .collect()
}
