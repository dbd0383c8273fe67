//! Counters and timers recorded by the discovery core.
//!
//! Components receive an `Arc<dyn Metrics>`; every method defaults to a
//! no-op so tests can pass [`NoopMetrics`]. [`Registry`] records through a
//! Prometheus recorder and renders the text exposition format for `/metrics`.

use std::sync::Arc;
use std::time::Duration;

use metrics::{counter, describe_counter, describe_histogram, histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle, PrometheusRecorder};

const API_REQUESTS: &str = "tailscalesd_tailscale_api_requests";
const API_ERRORS: &str = "tailscalesd_tailscale_api_errors";
const API_PAYLOAD_ERRORS: &str = "tailscalesd_tailscale_api_payload_errors";
const API_LATENCY: &str = "tailscalesd_tailscale_api_request_latency_ms";
const MULTI_REQUESTS: &str = "tailscalesd_tailscale_multi_requests";
const MULTI_ERRORS: &str = "tailscalesd_tailscale_multi_errors";
const RATE_LIMITED_REQUESTS: &str = "tailscalesd_tailscale_rate_limited_requests";
const RATE_LIMITED_REFRESHES: &str = "tailscalesd_tailscale_rate_limited_refreshes";
const RATE_LIMITED_STALE: &str = "tailscalesd_tailscale_rate_limited_stale";
const DEVICES_FOUND: &str = "tailscalesd_public_api_devices_found";

/// Geometric buckets, in milliseconds.
const LATENCY_BUCKETS: [f64; 10] = [
    1.0, 2.75, 7.5625, 20.7969, 57.1914, 157.2764, 432.51, 1189.4025, 3270.8569, 8994.8566,
];

fn help(name: &str) -> &'static str {
    match name {
        API_REQUESTS => "Counter of requests made to Tailscale APIs. Labeled with the API host to which requests are made.",
        API_ERRORS => "Counter of errors during requests to Tailscale APIs. Denominated by tailscalesd_tailscale_api_requests.",
        API_PAYLOAD_ERRORS => "Counter of bad payload responses from Tailscale APIs. Denominated by tailscalesd_tailscale_api_requests.",
        API_LATENCY => "Histogram of API request latency measured in milliseconds. Bucketted geometrically.",
        MULTI_REQUESTS => "Counter of all requests to a multi-discoverer.",
        MULTI_ERRORS => "Counter of errors during requests to all multi-discoverer. Denominated by tailscalesd_tailscale_multi_requests.",
        RATE_LIMITED_REQUESTS => "Counter of all requests to a rate limited discoverer.",
        RATE_LIMITED_REFRESHES => "Counter of requests to a rate limited discoverer which result in a data refresh.",
        RATE_LIMITED_STALE => "Counter of requests to a rate limited discoverer which result a return of stale results.",
        DEVICES_FOUND => "Counter of devices found using the public API, labeled with tailnet name.",
        _ => "",
    }
}

pub trait Metrics: Send + Sync {
    fn api_request(&self, _api: &str, _host: &str) {}

    fn api_error(&self, _api: &str, _host: &str) {}

    fn api_payload_error(&self, _api: &str, _host: &str) {}

    fn api_latency(&self, _api: &str, _host: &str, _elapsed: Duration) {}

    fn multi_request(&self) {}

    fn multi_error(&self) {}

    fn rate_limited_request(&self) {}

    fn rate_limited_refresh(&self) {}

    fn rate_limited_stale(&self) {}

    fn devices_found(&self, _tailnet: &str, _count: usize) {}
}

#[derive(Clone, Copy, Debug, Default)]
pub struct NoopMetrics;

impl Metrics for NoopMetrics {}

pub fn noop() -> Arc<dyn Metrics> {
    Arc::new(NoopMetrics)
}

/// Prometheus-backed recorder. Each registry owns its recorder, so series
/// never leak between instances.
pub struct Registry {
    recorder: PrometheusRecorder,
    handle: PrometheusHandle,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl Registry {
    pub fn new() -> Self {
        let recorder = match PrometheusBuilder::new()
            .set_buckets_for_metric(Matcher::Full(API_LATENCY.to_string()), &LATENCY_BUCKETS)
        {
            Ok(builder) => builder.build_recorder(),
            Err(err) => {
                tracing::warn!("Falling back to latency summaries: {}", err);
                PrometheusBuilder::new().build_recorder()
            }
        };
        let handle = recorder.handle();

        let registry = Self { recorder, handle };
        registry.record(|| {
            for name in [
                API_REQUESTS,
                API_ERRORS,
                API_PAYLOAD_ERRORS,
                MULTI_REQUESTS,
                MULTI_ERRORS,
                RATE_LIMITED_REQUESTS,
                RATE_LIMITED_REFRESHES,
                RATE_LIMITED_STALE,
                DEVICES_FOUND,
            ] {
                describe_counter!(name, help(name));
            }
            describe_histogram!(API_LATENCY, help(API_LATENCY));
        });

        registry
    }

    fn record<T>(&self, f: impl FnOnce() -> T) -> T {
        metrics::with_local_recorder(&self.recorder, f)
    }

    /// Render every recorded series in the Prometheus text format.
    pub fn render(&self) -> String {
        self.handle.render()
    }
}

impl Metrics for Registry {
    fn api_request(&self, api: &str, host: &str) {
        self.record(|| {
            counter!(API_REQUESTS, "api" => api.to_string(), "host" => host.to_string())
                .increment(1)
        });
    }

    fn api_error(&self, api: &str, host: &str) {
        self.record(|| {
            counter!(API_ERRORS, "api" => api.to_string(), "host" => host.to_string())
                .increment(1)
        });
    }

    fn api_payload_error(&self, api: &str, host: &str) {
        self.record(|| {
            counter!(API_PAYLOAD_ERRORS, "api" => api.to_string(), "host" => host.to_string())
                .increment(1)
        });
    }

    fn api_latency(&self, api: &str, host: &str, elapsed: Duration) {
        self.record(|| {
            histogram!(API_LATENCY, "api" => api.to_string(), "host" => host.to_string())
                .record(elapsed.as_secs_f64() * 1000.0)
        });
    }

    fn multi_request(&self) {
        self.record(|| counter!(MULTI_REQUESTS).increment(1));
    }

    fn multi_error(&self) {
        self.record(|| counter!(MULTI_ERRORS).increment(1));
    }

    fn rate_limited_request(&self) {
        self.record(|| counter!(RATE_LIMITED_REQUESTS).increment(1));
    }

    fn rate_limited_refresh(&self) {
        self.record(|| counter!(RATE_LIMITED_REFRESHES).increment(1));
    }

    fn rate_limited_stale(&self) {
        self.record(|| counter!(RATE_LIMITED_STALE).increment(1));
    }

    fn devices_found(&self, tailnet: &str, count: usize) {
        self.record(|| {
            counter!(DEVICES_FOUND, "tailnet" => tailnet.to_string()).increment(count as u64)
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_render() {
        let registry = Registry::new();
        registry.multi_request();
        registry.multi_request();
        registry.api_request("public", "api.tailscale.com");
        registry.devices_found("example.com", 3);

        let out = registry.render();
        assert!(out.contains("# TYPE tailscalesd_tailscale_multi_requests counter\n"));
        assert!(out.contains("tailscalesd_tailscale_multi_requests 2\n"));
        assert!(out.contains(
            "tailscalesd_tailscale_api_requests{api=\"public\",host=\"api.tailscale.com\"} 1\n"
        ));
        assert!(out.contains("tailscalesd_public_api_devices_found{tailnet=\"example.com\"} 3\n"));
    }

    #[test]
    fn test_latency_is_a_histogram() {
        let registry = Registry::new();
        registry.api_latency("local", "localhost", Duration::from_millis(2));
        registry.api_latency("local", "localhost", Duration::from_millis(50));
        registry.api_latency("local", "localhost", Duration::from_secs(20));

        let out = registry.render();
        let prefix = "tailscalesd_tailscale_api_request_latency_ms";
        assert!(out.contains(&format!("# TYPE {prefix} histogram\n")));
        assert!(out.contains(&format!(
            "{prefix}_bucket{{api=\"local\",host=\"localhost\",le=\"+Inf\"}} 3\n"
        )));
        assert!(out.contains(&format!(
            "{prefix}_count{{api=\"local\",host=\"localhost\"}} 3\n"
        )));
    }

    #[test]
    fn test_registries_are_independent() {
        let first = Registry::new();
        let second = Registry::new();
        first.rate_limited_stale();

        assert!(first
            .render()
            .contains("tailscalesd_tailscale_rate_limited_stale 1\n"));
        assert!(!second
            .render()
            .contains("tailscalesd_tailscale_rate_limited_stale 1"));
    }
}
