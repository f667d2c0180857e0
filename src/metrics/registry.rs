use metrics::{describe_counter, describe_gauge, describe_histogram, Unit};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

/// Histogram bucket boundaries for latency metrics (seconds).
const LATENCY_BUCKETS: &[f64] = &[
    0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
];

/// Thin handle around the global metrics recorder.
///
/// After `Metrics::install()` the `metrics` crate macros (`counter!`,
/// `gauge!`, `histogram!`) can be used anywhere in the codebase. The
/// `PrometheusHandle` is retained solely for rendering the `/metrics`
/// endpoint. A second install (as happens across test binaries) leaves the
/// handle empty and the macros as no-ops.
#[derive(Clone)]
pub struct Metrics {
    handle: Option<PrometheusHandle>,
}

impl Metrics {
    /// Install the global Prometheus recorder and register metric
    /// descriptions. Call once at startup, before any macro use.
    pub fn install() -> Self {
        let handle = PrometheusBuilder::new()
            .set_buckets_for_metric(
                metrics_exporter_prometheus::Matcher::Suffix("_duration_seconds".to_string()),
                LATENCY_BUCKETS,
            )
            .expect("valid matcher")
            .install_recorder();

        let handle = match handle {
            Ok(h) => Some(h),
            Err(e) => {
                tracing::warn!("metrics: recorder already installed, rendering disabled: {}", e);
                None
            }
        };

        describe_counter!(
            "gateway_http_requests_total",
            Unit::Count,
            "Total HTTP requests processed"
        );
        describe_histogram!(
            "gateway_http_request_duration_seconds",
            Unit::Seconds,
            "Total request duration from client perspective"
        );
        describe_counter!(
            "gateway_door_requests_total",
            Unit::Count,
            "Requests dispatched into a tenant door"
        );
        describe_histogram!(
            "gateway_upstream_request_duration_seconds",
            Unit::Seconds,
            "Upstream capability call duration"
        );
        describe_counter!(
            "gateway_rate_limit_rejected_total",
            Unit::Count,
            "Requests rejected by a tenant rate limiter"
        );
        describe_counter!(
            "gateway_admin_rate_limit_rejected_total",
            Unit::Count,
            "Admin or registration requests rejected by the per-IP window"
        );
        describe_counter!(
            "gateway_registrations_total",
            Unit::Count,
            "Registration attempts by result"
        );
        describe_gauge!(
            "gateway_tenants",
            Unit::Count,
            "Number of live tenant doors"
        );
        describe_gauge!(
            "gateway_connections_active",
            Unit::Count,
            "Number of active downstream connections"
        );
        describe_counter!(
            "gateway_connections_total",
            Unit::Count,
            "Total connections accepted"
        );

        Self { handle }
    }

    /// Render all metrics in Prometheus text exposition format.
    pub fn render(&self) -> String {
        self.handle.as_ref().map(|h| h.render()).unwrap_or_default()
    }
}
