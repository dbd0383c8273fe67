/// Host of the public Tailscale API
pub const PUBLIC_API_HOST: &str = "api.tailscale.com";

/// Value of `Device::api` for devices reported by the local API
pub const LOCAL_API_HOST: &str = "localhost";

/// Unix domain socket on which tailscaled serves the local API
pub const LOCAL_API_SOCKET: &str = "/run/tailscale/tailscaled.sock";

/// Host header tailscaled expects on local API requests
pub const LOCAL_API_AUTHORITY: &str = "local-tailscaled.sock";

/// Local API status path
pub const LOCAL_API_STATUS_PATH: &str = "/localapi/v0/status";

/// Public API OAuth token exchange path
pub const OAUTH_TOKEN_PATH: &str = "/api/v2/oauth/token";

/// OAuth scope needed to list devices
pub const OAUTH_DEVICES_SCOPE: &str = "devices:core:read";

/// Default HTTP service discovery listen address
pub const DEFAULT_LISTEN: &str = "0.0.0.0:9242";

/// Public API devices path for a tailnet
pub fn devices_path(tailnet: &str) -> String {
    format!("/api/v2/tailnet/{}/devices", tailnet)
}

/// Host which provided the details about this device. "localhost" for the
/// local API.
pub const LABEL_META_API: &str = "__meta_tailscale_api";

/// Whether the target is currently authorized on the tailnet. Always true
/// when using the local API.
pub const LABEL_META_DEVICE_AUTHORIZED: &str = "__meta_tailscale_device_authorized";

/// Tailscale client version in use on the target. Not reported by the local
/// API.
pub const LABEL_META_DEVICE_CLIENT_VERSION: &str = "__meta_tailscale_device_client_version";

/// Short hostname of the device
pub const LABEL_META_DEVICE_HOSTNAME: &str = "__meta_tailscale_device_hostname";

/// Opaque device ID. The public API reports a large integer, the local API an
/// encoded string.
pub const LABEL_META_DEVICE_ID: &str = "__meta_tailscale_device_id";

/// Device name as reported by the API. Not reported by the local API.
pub const LABEL_META_DEVICE_NAME: &str = "__meta_tailscale_device_name";

/// Whether the control plane believes the device is connected
pub const LABEL_META_DEVICE_ONLINE: &str = "__meta_tailscale_device_online";

/// OS of the target
pub const LABEL_META_DEVICE_OS: &str = "__meta_tailscale_device_os";

/// Tailnet from which the target was retrieved
pub const LABEL_META_TAILNET: &str = "__meta_tailscale_tailnet";

/// Prefix of every label derived from a device tag. The normalized tag name
/// is appended.
pub const LABEL_META_DEVICE_TAG_PREFIX: &str = "__meta_tailscale_device_tag_";

/// Tag label value
pub const TAG_LABEL_VALUE: &str = "1";

/// Tag label suffix used when a tag normalizes to nothing
pub const EMPTY_TAG: &str = "EMPTY";
