//! Process-wide Prometheus registry for the load generator.

use std::sync::Arc;

use once_cell::sync::Lazy;
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounterVec, IntGauge, Opts, Registry, TextEncoder,
};
use tracing::debug;

#[derive(Clone)]
pub struct MetricsRegistry {
    registry: Arc<Registry>,
    pub requests_total: IntCounterVec,
    pub requests_total_sum: prometheus::IntCounter,
    pub request_duration_seconds: HistogramVec,
    pub active_users: IntGauge,
    pub websocket_connections: IntGauge,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        let registry = Registry::new();

        let requests_total = IntCounterVec::new(
            Opts::new(
                "loadgen_requests_total",
                "Total outbound requests by service, method and status",
            ),
            &["service", "method", "status"],
        )
        .expect("failed to create requests_total metric");

        // Labelless aggregate so the control plane's regex scraper always
        // reads a single deterministic value regardless of label cardinality.
        let requests_total_sum = prometheus::IntCounter::new(
            "loadgen_requests_total_sum",
            "Total outbound requests across all services/methods/statuses",
        )
        .expect("failed to create requests_total_sum metric");

        let request_duration_seconds = HistogramVec::new(
            HistogramOpts::new(
                "loadgen_request_duration_seconds",
                "Outbound request duration in seconds",
            )
            .buckets(vec![
                0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
            ]),
            &["service", "method"],
        )
        .expect("failed to create request_duration_seconds metric");

        let active_users = IntGauge::new(
            "loadgen_active_users",
            "Number of virtual users currently running",
        )
        .expect("failed to create active_users metric");

        let websocket_connections = IntGauge::new(
            "loadgen_websocket_connections",
            "Number of live chat WebSocket connections",
        )
        .expect("failed to create websocket_connections metric");

        registry
            .register(Box::new(requests_total.clone()))
            .expect("failed to register requests_total");
        registry
            .register(Box::new(requests_total_sum.clone()))
            .expect("failed to register requests_total_sum");
        registry
            .register(Box::new(request_duration_seconds.clone()))
            .expect("failed to register request_duration_seconds");
        registry
            .register(Box::new(active_users.clone()))
            .expect("failed to register active_users");
        registry
            .register(Box::new(websocket_connections.clone()))
            .expect("failed to register websocket_connections");

        debug!("initialized loadgen metrics registry");

        Self {
            registry: Arc::new(registry),
            requests_total,
            requests_total_sum,
            request_duration_seconds,
            active_users,
            websocket_connections,
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn record_request(&self, service: &str, method: &str, status: &str, duration_secs: f64) {
        self.requests_total
            .with_label_values(&[service, method, status])
            .inc();
        self.requests_total_sum.inc();
        self.request_duration_seconds
            .with_label_values(&[service, method])
            .observe(duration_secs);
    }

    pub fn user_started(&self) {
        self.active_users.inc();
    }

    pub fn user_stopped(&self) {
        self.active_users.dec();
    }

    pub fn websocket_opened(&self) {
        self.websocket_connections.inc();
    }

    pub fn websocket_closed(&self) {
        self.websocket_connections.dec();
    }

    /// Renders the registry in Prometheus text exposition format.
    pub fn render(&self) -> String {
        let encoder = TextEncoder::new();
        let families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder
            .encode(&families, &mut buffer)
            .expect("encoding a gathered metric family is infallible");
        String::from_utf8(buffer).expect("prometheus text output is always valid utf-8")
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

static GLOBAL_REGISTRY: Lazy<MetricsRegistry> = Lazy::new(MetricsRegistry::new);

pub fn global() -> &'static MetricsRegistry {
    &GLOBAL_REGISTRY
}

static ACTIVE_USERS_RE: Lazy<regex::Regex> =
    Lazy::new(|| regex::Regex::new(r"loadgen_active_users\s+(\d+)").unwrap());
static WEBSOCKET_RE: Lazy<regex::Regex> =
    Lazy::new(|| regex::Regex::new(r"loadgen_websocket_connections\s+(\d+)").unwrap());
static REQUESTS_TOTAL_RE: Lazy<regex::Regex> =
    Lazy::new(|| regex::Regex::new(r"loadgen_requests_total(?:.*?)\s+(\d+)").unwrap());

/// Parses the well-known subset of a Prometheus text exposition body using
/// the same regexes the control plane's `/api/overview` handler applies
/// (spec.md §6's "bit-level scraping contract"). Missing keys are absent
/// from the map, never defaulted to zero. For `requests_total`, where the
/// pattern can match multiple label-bearing series, the final match wins.
pub fn scrape_well_known(text: &str) -> std::collections::HashMap<String, u64> {
    let mut out = std::collections::HashMap::new();
    if let Some(caps) = ACTIVE_USERS_RE.captures(text) {
        if let Ok(v) = caps[1].parse() {
            out.insert("active_users".to_string(), v);
        }
    }
    if let Some(caps) = WEBSOCKET_RE.captures(text) {
        if let Ok(v) = caps[1].parse() {
            out.insert("websocket_connections".to_string(), v);
        }
    }
    if let Some(caps) = REQUESTS_TOTAL_RE.captures_iter(text).last() {
        if let Ok(v) = caps[1].parse() {
            out.insert("total_requests".to_string(), v);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_request_increments_both_counters() {
        let registry = MetricsRegistry::new();
        registry.record_request("posts", "create-post", "201", 0.05);
        assert_eq!(registry.requests_total_sum.get(), 1);
    }

    #[test]
    fn active_users_gauge_tracks_lifecycle() {
        let registry = MetricsRegistry::new();
        registry.user_started();
        registry.user_started();
        assert_eq!(registry.active_users.get(), 2);
        registry.user_stopped();
        assert_eq!(registry.active_users.get(), 1);
    }

    #[test]
    fn websocket_gauge_tracks_open_close() {
        let registry = MetricsRegistry::new();
        registry.websocket_opened();
        assert_eq!(registry.websocket_connections.get(), 1);
        registry.websocket_closed();
        assert_eq!(registry.websocket_connections.get(), 0);
    }

    #[test]
    fn render_contains_well_known_series() {
        let registry = MetricsRegistry::new();
        registry.user_started();
        let text = registry.render();
        assert!(text.contains("loadgen_active_users"));
        assert!(text.contains("loadgen_requests_total_sum"));
    }

    #[test]
    fn render_is_scrapeable_by_the_overview_regexes() {
        let registry = MetricsRegistry::new();
        registry.user_started();
        registry.websocket_opened();
        let text = registry.render();
        let active = regex::Regex::new(r"loadgen_active_users\s+(\d+)").unwrap();
        let ws = regex::Regex::new(r"loadgen_websocket_connections\s+(\d+)").unwrap();
        assert_eq!(
            active.captures(&text).unwrap()[1].parse::<u64>().unwrap(),
            1
        );
        assert_eq!(ws.captures(&text).unwrap()[1].parse::<u64>().unwrap(), 1);
    }

    #[test]
    fn scrape_well_known_extracts_the_three_series() {
        let registry = MetricsRegistry::new();
        registry.user_started();
        registry.websocket_opened();
        registry.record_request("posts", "create-post", "201", 0.01);
        let snapshot = scrape_well_known(&registry.render());
        assert_eq!(snapshot.get("active_users"), Some(&1));
        assert_eq!(snapshot.get("websocket_connections"), Some(&1));
        assert_eq!(snapshot.get("total_requests"), Some(&1));
    }

    #[test]
    fn scrape_well_known_omits_missing_keys() {
        let snapshot = scrape_well_known("# no metrics here\n");
        assert!(!snapshot.contains_key("active_users"));
    }
}
