//! Prometheus metrics for the onecall server.
//!
//! Exposed in text format by the HTTP front end at `/metrics`.

use prometheus::{
    Counter, CounterVec, Encoder, Gauge, Histogram, HistogramOpts, Opts, Registry, TextEncoder,
};

/// Session duration histogram buckets (in seconds).
const DURATION_BUCKETS: &[f64] = &[0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 5.0];

/// Prometheus metrics for the onecall server.
#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    /// Total sessions opened.
    pub sessions_total: Counter,
    /// Sessions currently registered.
    pub sessions_active: Gauge,
    /// Total requests by method.
    pub requests_total: CounterVec,
    /// Total requests interrupted.
    pub interrupts_total: Counter,
    /// Batches that failed to decode.
    pub decode_defects_total: Counter,
    /// Time from session open to teardown.
    pub session_duration: Histogram,
}

impl Metrics {
    /// Creates a new Metrics instance with all metrics registered.
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        // Sessions
        let sessions_total = Counter::with_opts(Opts::new(
            "onecall_sessions_total",
            "Total number of sessions opened",
        ))?;
        registry.register(Box::new(sessions_total.clone()))?;

        let sessions_active = Gauge::with_opts(Opts::new(
            "onecall_sessions_active",
            "Number of currently registered sessions",
        ))?;
        registry.register(Box::new(sessions_active.clone()))?;

        // Requests
        let requests_total = CounterVec::new(
            Opts::new("onecall_requests_total", "Total requests by method"),
            &["method"],
        )?;
        registry.register(Box::new(requests_total.clone()))?;

        let interrupts_total = Counter::with_opts(Opts::new(
            "onecall_interrupts_total",
            "Total requests interrupted before exiting",
        ))?;
        registry.register(Box::new(interrupts_total.clone()))?;

        let decode_defects_total = Counter::with_opts(Opts::new(
            "onecall_decode_defects_total",
            "Total batches answered with a decode defect",
        ))?;
        registry.register(Box::new(decode_defects_total.clone()))?;

        let session_duration = Histogram::with_opts(
            HistogramOpts::new(
                "onecall_session_duration_seconds",
                "Session lifetime in seconds",
            )
            .buckets(DURATION_BUCKETS.to_vec()),
        )?;
        registry.register(Box::new(session_duration.clone()))?;

        Ok(Self {
            registry,
            sessions_total,
            sessions_active,
            requests_total,
            interrupts_total,
            decode_defects_total,
            session_duration,
        })
    }

    /// Encodes all metrics in Prometheus text format.
    pub fn encode(&self) -> Result<Vec<u8>, prometheus::Error> {
        let mut buffer = Vec::new();
        let encoder = TextEncoder::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        Ok(buffer)
    }

    /// Returns a reference to the registry.
    pub fn registry(&self) -> &Registry {
        &self.registry
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_creation() {
        let metrics = Metrics::new().unwrap();

        metrics.sessions_total.inc();
        metrics.sessions_active.inc();
        metrics.requests_total.with_label_values(&["Echo"]).inc();
        metrics.interrupts_total.inc();
        metrics.decode_defects_total.inc();
        metrics.session_duration.observe(0.002);

        let encoded = String::from_utf8(metrics.encode().unwrap()).unwrap();
        assert!(encoded.contains("onecall_sessions_total 1"));
        assert!(encoded.contains("onecall_sessions_active 1"));
        assert!(encoded.contains(r#"onecall_requests_total{method="Echo"} 1"#));
        assert!(encoded.contains("onecall_interrupts_total 1"));
        assert!(encoded.contains("onecall_decode_defects_total 1"));
        assert!(encoded.contains("onecall_session_duration_seconds"));
    }

    #[test]
    fn test_gauge_returns_to_zero() {
        let metrics = Metrics::new().unwrap();
        metrics.sessions_active.inc();
        metrics.sessions_active.dec();
        assert_eq!(metrics.sessions_active.get(), 0.0);
    }
}
