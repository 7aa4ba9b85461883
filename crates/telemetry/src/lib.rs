//! Logging setup and metrics sinks for the relay controller.
//!
//! [`RelayMetrics`] is an in-process sink the stats endpoint reads back;
//! with the `otel` feature, [`metrics::OtelMetricsSink`] exports the same
//! signals over OTLP. [`FanoutSink`] feeds several sinks from one monitor.

#![deny(unsafe_code)]

use relay_core::{CostMetrics, MetricsSink};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tracing_subscriber::{fmt, layer::SubscriberExt, EnvFilter, Registry};

#[derive(Debug, Error)]
pub enum TelemetryError {
    #[error("otel setup failed: {0}")]
    Otel(String),
}

/// Initialize structured logging (JSON) with env filter.
/// Set RUST_LOG, e.g., "info,controller=debug".
pub fn init_json_logging() {
    init_json_logging_with("info");
}

/// Same as [`init_json_logging`] with a caller-chosen fallback filter when RUST_LOG is unset.
pub fn init_json_logging_with(default_filter: &str) {
    let fmt_layer = fmt::layer().json().with_current_span(true).with_span_list(true);
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    let subscriber = Registry::default().with(filter).with(fmt_layer);
    tracing::subscriber::set_global_default(subscriber).ok();
}

/// Initialize OpenTelemetry tracer (optional; behind `otel` feature). No tracing subscriber hookup.
#[cfg(feature = "otel")]
pub fn init_otel(service_name: &str) -> Result<(), TelemetryError> {
    use opentelemetry::KeyValue;
    use opentelemetry_sdk::trace as sdktrace;
    use opentelemetry_sdk::{runtime, Resource};

    let resource = Resource::new(vec![KeyValue::new("service.name", service_name.to_owned())]);
    let _tracer_provider = opentelemetry_otlp::new_pipeline()
        .tracing()
        .with_exporter(opentelemetry_otlp::new_exporter().http())
        .with_trace_config(sdktrace::config().with_resource(resource))
        .install_batch(runtime::Tokio)
        .map_err(|e| TelemetryError::Otel(e.to_string()))?;
    Ok(())
}

#[cfg(feature = "otel")]
pub mod metrics {
    //! OTLP export of cost and session signals.
    use super::TelemetryError;
    use once_cell::sync::OnceCell;
    use opentelemetry::global;
    use opentelemetry::metrics::{Counter, Histogram, Meter, Unit};
    use relay_core::{CostMetrics, MetricsSink};

    static METRICS_INIT: OnceCell<()> = OnceCell::new();

    fn init_metrics_from_env() -> Result<(), TelemetryError> {
        // Exporter endpoint and headers come from OTEL_EXPORTER_*.
        let provider = opentelemetry_otlp::new_pipeline()
            .metrics(opentelemetry_sdk::runtime::Tokio)
            .with_exporter(opentelemetry_otlp::new_exporter().http())
            .build()
            .map_err(|e| TelemetryError::Otel(e.to_string()))?;
        global::set_meter_provider(provider);
        Ok(())
    }

    fn ensure_metrics_provider() {
        let _ = METRICS_INIT.get_or_init(|| {
            if let Err(e) = init_metrics_from_env() {
                tracing::warn!(error = %e, "otlp metrics pipeline unavailable");
            }
        });
    }

    /// Sink that records every signal into OTel instruments.
    #[derive(Clone)]
    pub struct OtelMetricsSink {
        cost_ratio: Histogram<f64>,
        spend: Histogram<f64>,
        samples: Counter<u64>,
        source_failures: Counter<u64>,
        active_sessions: Histogram<u64>,
    }

    impl OtelMetricsSink {
        pub fn init() -> Self {
            ensure_metrics_provider();
            let meter: Meter = global::meter("relay.guard");
            Self {
                cost_ratio: meter
                    .f64_histogram("relay.cost.ratio")
                    .with_description("Current spend over budget limit")
                    .with_unit(Unit::new("1"))
                    .init(),
                spend: meter
                    .f64_histogram("relay.cost.current_spend")
                    .with_description("Spend so far in the billing period")
                    .init(),
                samples: meter
                    .u64_counter("relay.cost.samples")
                    .with_description("Good cost samples recorded")
                    .init(),
                source_failures: meter
                    .u64_counter("relay.cost.source_failures")
                    .with_description("Failed cost source polls")
                    .init(),
                active_sessions: meter
                    .u64_histogram("relay.sessions.active")
                    .with_description("Active relay sessions per poll cycle")
                    .init(),
            }
        }
    }

    impl MetricsSink for OtelMetricsSink {
        fn record_cost(&self, m: &CostMetrics) {
            self.cost_ratio.record(m.cost_ratio, &[]);
            self.spend.record(m.current_spend, &[]);
            self.samples.add(1, &[]);
        }

        fn record_source_failure(&self) {
            self.source_failures.add(1, &[]);
        }

        fn record_active_sessions(&self, count: usize) {
            self.active_sessions.record(count as u64, &[]);
        }
    }
}

/// Point-in-time copy of [`RelayMetrics`].
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct MetricsSnapshot {
    pub cost_ratio: f64,
    pub current_spend: f64,
    pub projected_monthly_spend: f64,
    pub samples: u64,
    pub source_failures: u64,
    pub active_sessions: u64,
}

/// Lock-free in-process sink. Clones share state.
#[derive(Clone, Default)]
pub struct RelayMetrics {
    cost_ratio_bits: Arc<AtomicU64>,
    spend_bits: Arc<AtomicU64>,
    projected_bits: Arc<AtomicU64>,
    samples: Arc<AtomicU64>,
    source_failures: Arc<AtomicU64>,
    active_sessions: Arc<AtomicU64>,
}

impl RelayMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            cost_ratio: f64::from_bits(self.cost_ratio_bits.load(Ordering::Relaxed)),
            current_spend: f64::from_bits(self.spend_bits.load(Ordering::Relaxed)),
            projected_monthly_spend: f64::from_bits(self.projected_bits.load(Ordering::Relaxed)),
            samples: self.samples.load(Ordering::Relaxed),
            source_failures: self.source_failures.load(Ordering::Relaxed),
            active_sessions: self.active_sessions.load(Ordering::Relaxed),
        }
    }
}

impl MetricsSink for RelayMetrics {
    fn record_cost(&self, m: &CostMetrics) {
        self.cost_ratio_bits.store(m.cost_ratio.to_bits(), Ordering::Relaxed);
        self.spend_bits.store(m.current_spend.to_bits(), Ordering::Relaxed);
        self.projected_bits.store(m.projected_monthly_spend.to_bits(), Ordering::Relaxed);
        let _ = self.samples.fetch_add(1, Ordering::Relaxed);
    }

    fn record_source_failure(&self) {
        let _ = self.source_failures.fetch_add(1, Ordering::Relaxed);
    }

    fn record_active_sessions(&self, count: usize) {
        self.active_sessions.store(count as u64, Ordering::Relaxed);
    }
}

/// Forwards each signal to every inner sink, in order.
#[derive(Clone, Default)]
pub struct FanoutSink {
    sinks: Vec<Arc<dyn MetricsSink>>,
}

impl FanoutSink {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with(mut self, sink: Arc<dyn MetricsSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }
}

impl MetricsSink for FanoutSink {
    fn record_cost(&self, m: &CostMetrics) {
        for s in &self.sinks {
            s.record_cost(m);
        }
    }

    fn record_source_failure(&self) {
        for s in &self.sinks {
            s.record_source_failure();
        }
    }

    fn record_active_sessions(&self, count: usize) {
        for s in &self.sinks {
            s.record_active_sessions(count);
        }
    }
}
