//! Request metrics.
//!
//! Every request is counted twice: once through the `metrics` crate facade,
//! exported in Prometheus text format at `/metrics` once [`init_metrics`] has
//! installed the recorder, and once in [`RequestMetrics`], an in-process
//! snapshot served at `/debug/vars`.
//!
//! Provided metrics:
//! * `cinedex_requests_total` (counter)
//! * `cinedex_responses_total` (counter, label `status`)
//! * `cinedex_request_duration_seconds` (histogram)
use std::{
    collections::BTreeMap,
    sync::{
        Mutex, PoisonError,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use eyre::WrapErr;
use metrics::{Unit, counter, describe_counter, describe_histogram, histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use once_cell::sync::OnceCell;
use serde::Serialize;

pub const CINEDEX_REQUESTS_TOTAL: &str = "cinedex_requests_total";
pub const CINEDEX_RESPONSES_TOTAL: &str = "cinedex_responses_total";
pub const CINEDEX_REQUEST_DURATION_SECONDS: &str = "cinedex_request_duration_seconds";

const DURATION_BUCKETS: &[f64] = &[
    0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
];

static EXPORTER: OnceCell<PrometheusHandle> = OnceCell::new();

/// Prometheus recorder settings shared by the installed exporter and tests.
pub fn prometheus_builder() -> eyre::Result<PrometheusBuilder> {
    PrometheusBuilder::new()
        .set_buckets_for_metric(
            Matcher::Full(CINEDEX_REQUEST_DURATION_SECONDS.to_string()),
            DURATION_BUCKETS,
        )
        .wrap_err("Invalid histogram buckets")
}

/// Install the process-wide Prometheus recorder and describe the request
/// metrics. Later calls return the handle of the recorder already installed.
pub fn init_metrics() -> eyre::Result<PrometheusHandle> {
    let handle = EXPORTER.get_or_try_init(|| -> eyre::Result<PrometheusHandle> {
        let handle = prometheus_builder()?
            .install_recorder()
            .wrap_err("Failed to install Prometheus recorder")?;
        describe_metrics();
        tracing::info!("Metrics initialized");
        Ok(handle)
    })?;
    Ok(handle.clone())
}

fn describe_metrics() {
    describe_counter!(
        CINEDEX_REQUESTS_TOTAL,
        Unit::Count,
        "Total number of HTTP requests received."
    );
    describe_counter!(
        CINEDEX_RESPONSES_TOTAL,
        Unit::Count,
        "Total number of HTTP responses sent, by status code."
    );
    describe_histogram!(
        CINEDEX_REQUEST_DURATION_SECONDS,
        Unit::Seconds,
        "Time from receiving a request to producing its response."
    );
}

/// Process-wide request counters.
#[derive(Debug, Default)]
pub struct RequestMetrics {
    requests_received: AtomicU64,
    responses_sent: AtomicU64,
    processing_time_us: AtomicU64,
    by_status: Mutex<BTreeMap<u16, u64>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub total_requests_received: u64,
    pub total_responses_sent: u64,
    #[serde(rename = "total_processing_time_µs")]
    pub total_processing_time_us: u64,
    pub total_responses_sent_by_status: BTreeMap<u16, u64>,
}

impl RequestMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_request(&self) {
        self.requests_received.fetch_add(1, Ordering::Relaxed);
        counter!(CINEDEX_REQUESTS_TOTAL).increment(1);
    }

    pub fn record_response(&self, status: u16, elapsed: Duration) {
        let micros = u64::try_from(elapsed.as_micros()).unwrap_or(u64::MAX);

        self.responses_sent.fetch_add(1, Ordering::Relaxed);
        self.processing_time_us.fetch_add(micros, Ordering::Relaxed);
        *self
            .by_status
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(status)
            .or_default() += 1;

        counter!(CINEDEX_RESPONSES_TOTAL, "status" => status.to_string()).increment(1);
        histogram!(CINEDEX_REQUEST_DURATION_SECONDS).record(elapsed.as_secs_f64());
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            total_requests_received: self.requests_received.load(Ordering::Relaxed),
            total_responses_sent: self.responses_sent.load(Ordering::Relaxed),
            total_processing_time_us: self.processing_time_us.load(Ordering::Relaxed),
            total_responses_sent_by_status: self
                .by_status
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone(),
        }
    }
}
