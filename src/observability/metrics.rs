//! OTLP metrics for flow-controlled calls.
//!
//! Key metrics:
//! - backflow_credit_requests_total: Counter of credits granted to peers
//! - backflow_messages_received_total: Counter of messages delivered by transports
//! - backflow_messages_sent_total: Counter of messages written to transports
//! - backflow_late_deliveries_total: Counter of messages dropped after close
//! - backflow_calls_cancelled_total: Counter of cancelled calls by origin
//! - backflow_inflight_messages: Gauge of delivered values not yet enqueued

use opentelemetry::metrics::{Counter, Gauge, Meter};
use opentelemetry::{global, KeyValue};
use opentelemetry_sdk::metrics::{ManualReader, SdkMeterProvider};
use std::sync::OnceLock;

/// Global metrics instance.
static METRICS: OnceLock<Metrics> = OnceLock::new();

/// Backflow metrics registry.
#[derive(Debug)]
pub struct Metrics {
    /// Total credits requested from transports.
    pub credit_requests_total: Counter<u64>,
    /// Total messages delivered by transports.
    pub messages_received_total: Counter<u64>,
    /// Total messages written to transports.
    pub messages_sent_total: Counter<u64>,
    /// Total messages dropped because their queue was closed.
    pub late_deliveries_total: Counter<u64>,
    /// Total cancelled calls.
    pub calls_cancelled_total: Counter<u64>,
    /// Delivered values waiting for queue capacity.
    pub inflight_messages: Gauge<i64>,
}

impl Metrics {
    /// Create a new metrics registry from a meter.
    fn new(meter: &Meter) -> Self {
        Self {
            credit_requests_total: meter
                .u64_counter("backflow_credit_requests_total")
                .with_description("Credits requested from the transport")
                .with_unit("1")
                .init(),
            messages_received_total: meter
                .u64_counter("backflow_messages_received_total")
                .with_description("Messages delivered by the transport")
                .with_unit("1")
                .init(),
            messages_sent_total: meter
                .u64_counter("backflow_messages_sent_total")
                .with_description("Messages written to the transport")
                .with_unit("1")
                .init(),
            late_deliveries_total: meter
                .u64_counter("backflow_late_deliveries_total")
                .with_description("Messages dropped because their queue had closed")
                .with_unit("1")
                .init(),
            calls_cancelled_total: meter
                .u64_counter("backflow_calls_cancelled_total")
                .with_description("Calls cancelled, by origin")
                .with_unit("1")
                .init(),
            inflight_messages: meter
                .i64_gauge("backflow_inflight_messages")
                .with_description("Delivered values not yet in the inbound queue")
                .with_unit("1")
                .init(),
        }
    }
}

/// Initialize the metrics system.
///
/// This should be called once at startup. Subsequent calls are ignored.
///
/// # Arguments
///
/// * `otel_endpoint` - Optional OTLP endpoint for metrics export
pub fn init_metrics_with_endpoint(otel_endpoint: Option<&str>) {
    METRICS.get_or_init(|| {
        if let Some(endpoint) = otel_endpoint {
            use opentelemetry_otlp::{Protocol, WithExportConfig};

            let exporter = opentelemetry_otlp::new_exporter()
                .tonic()
                .with_endpoint(endpoint)
                .with_protocol(Protocol::Grpc);

            match opentelemetry_otlp::new_pipeline()
                .metrics(opentelemetry_sdk::runtime::Tokio)
                .with_exporter(exporter)
                .with_period(std::time::Duration::from_secs(10))
                .build()
            {
                Ok(provider) => {
                    global::set_meter_provider(provider);
                    tracing::info!(endpoint, "OTLP metrics exporter configured");
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Failed to create OTLP exporter, metrics stay local");
                    install_manual_reader();
                }
            }
        } else {
            install_manual_reader();
        }

        let meter = global::meter("backflow");
        Metrics::new(&meter)
    });
}

/// Metrics are recorded but never exported.
fn install_manual_reader() {
    let reader = ManualReader::builder().build();
    let provider = SdkMeterProvider::builder().with_reader(reader).build();
    global::set_meter_provider(provider);
}

/// Initialize the metrics system without OTLP export.
pub fn init_metrics() {
    init_metrics_with_endpoint(None);
}

/// Get the global metrics instance, if initialized.
pub fn metrics() -> Option<&'static Metrics> {
    METRICS.get()
}

fn role_attrs(role: &str) -> [KeyValue; 1] {
    [KeyValue::new("role", role.to_string())]
}

/// Record credits requested from the transport.
pub fn record_credit_request(role: &str, count: u32) {
    if let Some(m) = METRICS.get() {
        m.credit_requests_total
            .add(u64::from(count), &role_attrs(role));
    }
}

/// Record a message delivered by the transport.
pub fn record_message_received(role: &str) {
    if let Some(m) = METRICS.get() {
        m.messages_received_total.add(1, &role_attrs(role));
    }
}

/// Record a message written to the transport.
pub fn record_message_sent(role: &str) {
    if let Some(m) = METRICS.get() {
        m.messages_sent_total.add(1, &role_attrs(role));
    }
}

/// Record a message dropped after its queue closed.
pub fn record_late_delivery(role: &str) {
    if let Some(m) = METRICS.get() {
        m.late_deliveries_total.add(1, &role_attrs(role));
    }
}

/// Record a cancelled call.
pub fn record_cancellation(role: &str, origin: &str) {
    if let Some(m) = METRICS.get() {
        let attrs = [
            KeyValue::new("role", role.to_string()),
            KeyValue::new("origin", origin.to_string()),
        ];
        m.calls_cancelled_total.add(1, &attrs);
    }
}

/// Record the current number of in-flight inbound values.
pub fn record_inflight(role: &str, count: usize) {
    if let Some(m) = METRICS.get() {
        m.inflight_messages
            .record(i64::try_from(count).unwrap_or(i64::MAX), &role_attrs(role));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_metrics_is_idempotent() {
        init_metrics();
        init_metrics();
        assert!(metrics().is_some());
    }

    #[test]
    fn test_record_helpers() {
        init_metrics();
        // Should not panic
        record_credit_request("client", 1);
        record_message_received("client");
        record_message_sent("server");
        record_late_delivery("server");
        record_cancellation("client", "peer");
        record_inflight("client", 3);
    }
}
