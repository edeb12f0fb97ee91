//! Delivery metrics.
//!
//! The engine reports through the [`Metrics`] trait. Production uses
//! [`OtelMetrics`], which records into OpenTelemetry instruments and is pushed
//! over OTLP when an endpoint is configured. Tracked series:
//! - `emails_sent_total{template}`
//! - `emails_failed_total{template, reason, error}` (`reason`: `permanent`, `exhausted`, `panic`)
//! - `emails_retried_total{template, error}`
//! - `delivery_duration_seconds{template}` (histogram)
//! - `queue_depth{status}` (gauge, refreshed by idle workers)

use opentelemetry::KeyValue;
use opentelemetry::metrics::{Counter, Gauge, Histogram, Meter};
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::metrics::{PeriodicReader, SdkMeterProvider};

use crate::error::MetricsError;

pub const EMAILS_SENT_TOTAL: &str = "emails_sent_total";
pub const EMAILS_FAILED_TOTAL: &str = "emails_failed_total";
pub const EMAILS_RETRIED_TOTAL: &str = "emails_retried_total";
pub const DELIVERY_DURATION_SECONDS: &str = "delivery_duration_seconds";
pub const QUEUE_DEPTH: &str = "queue_depth";

/// Instrumentation scope for every delivery instrument.
pub const METER_NAME: &str = "mail-relay.delivery";

/// Histogram buckets for send duration, in seconds.
const DURATION_BUCKETS: [f64; 7] = [0.1, 0.5, 1.0, 2.0, 5.0, 10.0, 30.0];

/// Label pairs attached to a sample.
pub type Labels<'a> = &'a [(&'a str, &'a str)];

/// Sink for counters, histograms and gauges.
pub trait Metrics: Send + Sync {
    fn inc(&self, name: &str, labels: Labels<'_>);
    fn observe(&self, name: &str, value: f64, labels: Labels<'_>);
    fn gauge(&self, name: &str, value: f64, labels: Labels<'_>);
}

/// OpenTelemetry-backed delivery metrics.
#[derive(Debug, Clone)]
pub struct OtelMetrics {
    sent: Counter<u64>,
    failed: Counter<u64>,
    retried: Counter<u64>,
    duration: Histogram<f64>,
    queue_depth: Gauge<f64>,
}

impl OtelMetrics {
    pub fn new(meter: &Meter) -> Self {
        let sent = meter
            .u64_counter(EMAILS_SENT_TOTAL)
            .with_description("Total emails sent successfully")
            .build();

        let failed = meter
            .u64_counter(EMAILS_FAILED_TOTAL)
            .with_description("Total emails failed permanently")
            .build();

        let retried = meter
            .u64_counter(EMAILS_RETRIED_TOTAL)
            .with_description("Total email delivery retries")
            .build();

        let duration = meter
            .f64_histogram(DELIVERY_DURATION_SECONDS)
            .with_description("Email delivery duration in seconds")
            .with_unit("s")
            .with_boundaries(DURATION_BUCKETS.to_vec())
            .build();

        let queue_depth = meter
            .f64_gauge(QUEUE_DEPTH)
            .with_description("Current queue depth by status")
            .build();

        Self {
            sent,
            failed,
            retried,
            duration,
            queue_depth,
        }
    }

    /// Instruments on the globally installed meter provider.
    pub fn from_global() -> Self {
        Self::new(&opentelemetry::global::meter(METER_NAME))
    }

    fn counter(&self, name: &str) -> Option<&Counter<u64>> {
        match name {
            EMAILS_SENT_TOTAL => Some(&self.sent),
            EMAILS_FAILED_TOTAL => Some(&self.failed),
            EMAILS_RETRIED_TOTAL => Some(&self.retried),
            _ => None,
        }
    }
}

impl Metrics for OtelMetrics {
    fn inc(&self, name: &str, labels: Labels<'_>) {
        match self.counter(name) {
            Some(counter) => counter.add(1, &attributes(labels)),
            None => tracing::debug!(metric = name, "Unknown counter"),
        }
    }

    fn observe(&self, name: &str, value: f64, labels: Labels<'_>) {
        match name {
            DELIVERY_DURATION_SECONDS => self.duration.record(value, &attributes(labels)),
            _ => tracing::debug!(metric = name, "Unknown histogram"),
        }
    }

    fn gauge(&self, name: &str, value: f64, labels: Labels<'_>) {
        match name {
            QUEUE_DEPTH => self.queue_depth.record(value, &attributes(labels)),
            _ => tracing::debug!(metric = name, "Unknown gauge"),
        }
    }
}

fn attributes(labels: Labels<'_>) -> Vec<KeyValue> {
    labels
        .iter()
        .map(|(k, v)| KeyValue::new(k.to_string(), v.to_string()))
        .collect()
}

/// Build a meter provider that pushes to an OTLP/HTTP collector.
pub fn init_otlp_exporter(endpoint: &str) -> Result<SdkMeterProvider, MetricsError> {
    let exporter = opentelemetry_otlp::MetricExporter::builder()
        .with_http()
        .with_endpoint(endpoint)
        .build()
        .map_err(|e| MetricsError::OpenTelemetry(e.to_string()))?;

    let reader = PeriodicReader::builder(exporter).build();

    Ok(SdkMeterProvider::builder().with_reader(reader).build())
}

#[cfg(test)]
pub(crate) use recording::InMemoryMetrics;
