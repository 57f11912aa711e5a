//! Ingestion metrics
//!
//! Counters and histograms emitted through the `metrics` facade. Nothing is
//! exported unless the embedding process installs a recorder.

/// Metrics for the per-record ingestion phase
pub struct IngestMetrics;

impl IngestMetrics {
    pub fn record_accepted() {
        ::metrics::counter!("ecg_ingest_records_total", "outcome" => "accepted").increment(1);
    }

    pub fn record_unparsable() {
        ::metrics::counter!("ecg_ingest_records_total", "outcome" => "unparsable").increment(1);
    }

    pub fn record_duplicate() {
        ::metrics::counter!("ecg_ingest_records_total", "outcome" => "duplicate").increment(1);
    }

    pub fn record_new_patient() {
        ::metrics::counter!("ecg_ingest_new_puids_total").increment(1);
    }
}

/// Metrics for sub-batch flushes
pub struct FlushMetrics;

impl FlushMetrics {
    pub fn record_flush(records: usize, duration_secs: f64) {
        ::metrics::counter!("ecg_ingest_flushes_total").increment(1);
        ::metrics::histogram!("ecg_ingest_flush_records").record(records as f64);
        ::metrics::histogram!("ecg_ingest_flush_duration_seconds").record(duration_secs);
    }

    pub fn record_feature_failure() {
        ::metrics::counter!("ecg_ingest_feature_failures_total").increment(1);
    }

    pub fn record_sink_failure(records: usize) {
        ::metrics::counter!("ecg_ingest_sink_failures_total").increment(records as u64);
    }
}
