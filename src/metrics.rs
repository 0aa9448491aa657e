//! Prometheus metrics for mystatusd.
//!
//! Tracks event throughput, reconcile retry pressure, and outgoing transport
//! sends. Exposed in text format on the web front end's `/metrics` route.
//! Recording helpers are no-ops until [`init`] runs, so library tests need
//! no metrics setup.

use prometheus::{Encoder, IntCounter, IntCounterVec, Opts, Registry, TextEncoder};
use std::sync::OnceLock;

/// Global Prometheus registry for all metrics.
pub static REGISTRY: OnceLock<Registry> = OnceLock::new();

pub fn registry() -> &'static Registry {
    REGISTRY.get_or_init(Registry::new)
}

/// Inbound transport events by kind.
pub static EVENTS_RECEIVED: OnceLock<IntCounterVec> = OnceLock::new();

/// Reconcile insert races that looped back for another attempt.
pub static RECONCILE_RETRIES: OnceLock<IntCounter> = OnceLock::new();

/// Outgoing transport operations by kind.
pub static OUTGOING_SENT: OnceLock<IntCounterVec> = OnceLock::new();

/// Initialize the Prometheus metrics registry.
///
/// Must be called once at startup before any metrics are recorded.
pub fn init() {
    let r = registry();

    macro_rules! register {
        ($metric:ident, $init:expr) => {
            let m = $init.expect(concat!(stringify!($metric), " creation failed"));
            if let Err(e) = r.register(Box::new(m.clone())) {
                tracing::warn!(error = %e, concat!("Failed to register metric ", stringify!($metric)));
            }
            let _ = $metric.set(m);
        };
    }

    register!(
        EVENTS_RECEIVED,
        IntCounterVec::new(
            Opts::new("mystatus_events_total", "Inbound transport events by kind"),
            &["kind"]
        )
    );
    register!(
        RECONCILE_RETRIES,
        IntCounter::new(
            "mystatus_reconcile_retries_total",
            "Reconcile attempts restarted after losing an insert race"
        )
    );
    register!(
        OUTGOING_SENT,
        IntCounterVec::new(
            Opts::new(
                "mystatus_outgoing_total",
                "Outgoing transport operations by kind"
            ),
            &["op"]
        )
    );
}

/// Gather all metrics and encode them in Prometheus text format.
pub fn gather_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = registry().gather();
    let mut buffer = vec![];
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::error!(error = %e, "Failed to encode Prometheus metrics");
        return String::new();
    }
    match String::from_utf8(buffer) {
        Ok(s) => s,
        Err(e) => {
            tracing::error!(error = %e, "Prometheus metrics were not valid UTF-8");
            String::new()
        }
    }
}

/// Record one inbound event.
#[inline]
pub fn record_event(kind: &str) {
    if let Some(c) = EVENTS_RECEIVED.get() {
        c.with_label_values(&[kind]).inc();
    }
}

/// Record one reconcile retry.
#[inline]
pub fn record_reconcile_retry() {
    if let Some(c) = RECONCILE_RETRIES.get() {
        c.inc();
    }
}

/// Record one outgoing transport operation.
#[inline]
pub fn record_outgoing(op: &str) {
    if let Some(c) = OUTGOING_SENT.get() {
        c.with_label_values(&[op]).inc();
    }
}
