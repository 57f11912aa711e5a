//! Sub-batch buffering and flushing across the five stores.

use crate::error::Result;
use crate::features::FeatureExtractor;
use crate::metrics::FlushMetrics;
use crate::sink::{RecordSink, SinkRecord};
use crate::storage::{
    DecoderRow, FlushCounts, MeasurementRow, RowBatch, StatementRow, Stores, UnparsableRow,
};
use crate::waveform::SignalBuffer;
use std::time::Instant;
use tracing::{info, instrument, warn};

/// Everything an accepted encounter contributes to a flush.
#[derive(Debug, Clone)]
pub struct AcceptedRecord {
    pub decoder: DecoderRow,
    pub measurement: MeasurementRow,
    pub statement: StatementRow,
    pub signal: SignalBuffer,
    pub outbound: SinkRecord,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FlushReport {
    pub records: usize,
    pub inserted: FlushCounts,
    pub feature_failed: bool,
    pub sink_failed: bool,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct FlushTotals {
    pub flushes: usize,
    pub feature_failures: usize,
    pub sink_failures: usize,
}

pub struct BatchCoordinator {
    buid: String,
    sub_batch_size: usize,
    pending: RowBatch,
    /// Signal buffers of the buffered records, back to back in append order
    signals: Vec<f32>,
    euids: Vec<String>,
    outbound: Vec<SinkRecord>,
    extractor: FeatureExtractor,
    sink: Box<dyn RecordSink>,
    totals: FlushTotals,
}

impl BatchCoordinator {
    pub fn new(
        buid: String,
        sub_batch_size: usize,
        extractor: FeatureExtractor,
        sink: Box<dyn RecordSink>,
    ) -> Self {
        Self {
            buid,
            sub_batch_size: sub_batch_size.max(1),
            pending: RowBatch::default(),
            signals: Vec::new(),
            euids: Vec::new(),
            outbound: Vec::new(),
            extractor,
            sink,
            totals: FlushTotals::default(),
        }
    }

    pub fn append(&mut self, record: AcceptedRecord) {
        self.euids.push(record.decoder.euid.clone());
        self.signals.extend_from_slice(record.signal.as_slice());
        self.pending.decoder.push(record.decoder);
        self.pending.measurements.push(record.measurement);
        self.pending.statements.push(record.statement);
        self.outbound.push(record.outbound);
    }

    pub fn append_unparsable(&mut self, row: UnparsableRow) {
        self.pending.unparsable.push(row);
    }

    pub fn buffered_records(&self) -> usize {
        self.euids.len()
    }

    pub fn buffered_unparsable(&self) -> usize {
        self.pending.unparsable.len()
    }

    pub fn should_flush(&self) -> bool {
        self.buffered_records() >= self.sub_batch_size
    }

    pub fn should_flush_unparsable(&self) -> bool {
        self.buffered_unparsable() >= self.sub_batch_size
    }

    pub fn totals(&self) -> FlushTotals {
        self.totals
    }

    /// Write only the buffered unparsable rows.
    pub fn flush_unparsable(&mut self, stores: &mut Stores) -> Result<FlushReport> {
        let batch = RowBatch {
            unparsable: std::mem::take(&mut self.pending.unparsable),
            ..RowBatch::default()
        };
        let inserted = stores.flush(&batch)?;
        info!(rows = batch.unparsable.len(), inserted = inserted.unparsable, "Flushed unparsable rows");
        Ok(FlushReport {
            inserted,
            ..FlushReport::default()
        })
    }

    /// Compute features for the buffered records, write all buffered rows in one
    /// transaction, then hand the records to the sink.
    ///
    /// A feature failure drops this sub-batch's feature rows only. A store
    /// failure is returned; a sink failure is logged and counted.
    #[instrument(skip_all, fields(buid = %self.buid, records = self.euids.len()))]
    pub fn flush(&mut self, stores: &mut Stores) -> Result<FlushReport> {
        let started = Instant::now();
        let records = self.euids.len();
        let mut report = FlushReport {
            records,
            ..FlushReport::default()
        };

        let mut batch = std::mem::take(&mut self.pending);
        if records > 0 {
            match self.extractor.extract(&self.signals, &self.euids, &self.buid) {
                Ok(rows) => batch.features = rows,
                Err(e) => {
                    warn!(error = %e, kernel = self.extractor.kernel_name(), "Feature extraction failed; sub-batch written without feature rows");
                    FlushMetrics::record_feature_failure();
                    self.totals.feature_failures += 1;
                    report.feature_failed = true;
                }
            }
        }
        self.signals.clear();
        self.euids.clear();

        if !batch.is_empty() {
            report.inserted = stores.flush(&batch)?;
        }

        let outbound = std::mem::take(&mut self.outbound);
        if !outbound.is_empty() {
            if let Err(e) = self.sink.send(&outbound) {
                warn!(error = %e, sink = self.sink.name(), records = outbound.len(), "Downstream delivery failed");
                FlushMetrics::record_sink_failure(outbound.len());
                self.totals.sink_failures += outbound.len();
                report.sink_failed = true;
            }
        }

        self.totals.flushes += 1;
        let elapsed = started.elapsed().as_secs_f64();
        FlushMetrics::record_flush(records, elapsed);
        info!(
            records,
            decoder = report.inserted.decoder,
            features = report.inserted.features,
            unparsable = report.inserted.unparsable,
            elapsed_secs = elapsed,
            "Sub-batch flushed"
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StoresConfig;
    use crate::deid::ExtractedValue;
    use crate::error::{FeatureError, SinkError};
    use crate::features::{FeatureKernel, LeadMetrics, ReferenceKernel};
    use crate::record::{Measurements, Statements};
    use crate::storage::Store;
    use std::path::Path;
    use std::sync::{Arc, Mutex};
    use tempfile::tempdir;

    struct FailingKernel;

    impl FeatureKernel for FailingKernel {
        fn name(&self) -> &'static str {
            "failing"
        }

        fn lead_metrics(&self, _signals: &[f32]) -> std::result::Result<Vec<LeadMetrics>, FeatureError> {
            Err(FeatureError::NativeStatus(1))
        }
    }

    #[derive(Clone, Default)]
    struct RecordingSink {
        sent: Arc<Mutex<Vec<String>>>,
        fail: bool,
    }

    impl RecordSink for RecordingSink {
        fn name(&self) -> &'static str {
            "recording"
        }

        fn send(&mut self, records: &[SinkRecord]) -> std::result::Result<(), SinkError> {
            if self.fail {
                return Err(SinkError::Status(503));
            }
            let mut sent = self.sent.lock().unwrap();
            sent.extend(records.iter().map(|r| r.euid.clone()));
            Ok(())
        }
    }

    fn stores(dir: &Path) -> Stores {
        let config = StoresConfig {
            decoder: dir.join("decoder.db"),
            features: dir.join("features.db"),
            measurements: dir.join("measurements.db"),
            statements: dir.join("statements.db"),
            unparsable: dir.join("unparsable.db"),
        };
        Stores::open(&config, &["PatientLastName".to_string()], &[]).unwrap()
    }

    fn accepted(euid: &str) -> AcceptedRecord {
        let signal: Vec<f32> = (0..crate::constants::SIGNAL_LEN)
            .map(|k| ((k * 7) % 101) as f32)
            .collect();
        AcceptedRecord {
            decoder: DecoderRow {
                euid: euid.into(),
                puid: "p1".into(),
                buid: "c1".into(),
                acquisition_date: "03-15-2019".into(),
                acquisition_time: euid.into(),
                phi: vec![ExtractedValue::Text("DOE".into())],
            },
            measurement: MeasurementRow {
                euid: euid.into(),
                buid: "c1".into(),
                measurements: Measurements {
                    sample_base: 500,
                    sample_exponent: None,
                    high_pass_filter: None,
                    low_pass_filter: None,
                    ac_filter: None,
                    qrs: Vec::new(),
                    global_rr: None,
                    qt_rr_ratio: None,
                    resting: Vec::new(),
                },
            },
            statement: StatementRow {
                euid: euid.into(),
                buid: "c1".into(),
                statements: Statements {
                    diagnosis: "Normal ECG".into(),
                    original_diagnosis: String::new(),
                    extra_questions: None,
                    reason_for_test: None,
                },
            },
            signal: SignalBuffer::from_samples(signal).unwrap(),
            outbound: SinkRecord {
                euid: euid.into(),
                puid: "p1".into(),
                acquisition_date: "2019-03-15_12:02:32".into(),
                xml: "<RestingECG/>".into(),
            },
        }
    }

    #[test]
    fn test_flush_threshold_and_rows() {
        let dir = tempdir().unwrap();
        let mut stores = stores(dir.path());
        let sink = RecordingSink::default();
        let sent = sink.sent.clone();
        let mut coordinator = BatchCoordinator::new(
            "c1".into(),
            2,
            FeatureExtractor::new(Box::new(ReferenceKernel)),
            Box::new(sink),
        );

        coordinator.append(accepted("e1"));
        assert!(!coordinator.should_flush());
        coordinator.append(accepted("e2"));
        assert!(coordinator.should_flush());

        let report = coordinator.flush(&mut stores).unwrap();
        assert_eq!(report.records, 2);
        assert_eq!(report.inserted.decoder, 2);
        assert_eq!(report.inserted.features, 16);
        assert_eq!(coordinator.buffered_records(), 0);
        assert_eq!(stores.row_count(Store::Measurements).unwrap(), 2);
        assert_eq!(stores.row_count(Store::Statements).unwrap(), 2);
        assert_eq!(*sent.lock().unwrap(), vec!["e1", "e2"]);
    }

    #[test]
    fn test_feature_failure_keeps_other_stores() {
        let dir = tempdir().unwrap();
        let mut stores = stores(dir.path());
        let mut coordinator = BatchCoordinator::new(
            "c1".into(),
            10,
            FeatureExtractor::new(Box::new(FailingKernel)),
            Box::new(RecordingSink::default()),
        );
        coordinator.append(accepted("e1"));
        let report = coordinator.flush(&mut stores).unwrap();

        assert!(report.feature_failed);
        assert_eq!(stores.row_count(Store::Decoder).unwrap(), 1);
        assert_eq!(stores.row_count(Store::Features).unwrap(), 0);
        assert_eq!(coordinator.totals().feature_failures, 1);
    }

    #[test]
    fn test_sink_failure_not_fatal() {
        let dir = tempdir().unwrap();
        let mut stores = stores(dir.path());
        let sink = RecordingSink {
            fail: true,
            ..Default::default()
        };
        let mut coordinator = BatchCoordinator::new(
            "c1".into(),
            10,
            FeatureExtractor::new(Box::new(ReferenceKernel)),
            Box::new(sink),
        );
        coordinator.append(accepted("e1"));
        coordinator.append(accepted("e2"));
        let report = coordinator.flush(&mut stores).unwrap();

        assert!(report.sink_failed);
        assert_eq!(coordinator.totals().sink_failures, 2);
        assert_eq!(stores.row_count(Store::Decoder).unwrap(), 2);
    }

    #[test]
    fn test_unparsable_flushes_on_its_own() {
        let dir = tempdir().unwrap();
        let mut stores = stores(dir.path());
        let mut coordinator = BatchCoordinator::new(
            "c1".into(),
            2,
            FeatureExtractor::new(Box::new(ReferenceKernel)),
            Box::new(RecordingSink::default()),
        );
        coordinator.append(accepted("e1"));
        for name in ["a.xml", "b.xml"] {
            coordinator.append_unparsable(UnparsableRow {
                filename: name.into(),
                buid: "c1".into(),
                reason: "bad".into(),
            });
        }
        assert!(coordinator.should_flush_unparsable());
        assert!(!coordinator.should_flush());

        coordinator.flush_unparsable(&mut stores).unwrap();
        assert_eq!(stores.row_count(Store::Unparsable).unwrap(), 2);
        assert_eq!(stores.row_count(Store::Decoder).unwrap(), 0);
        assert_eq!(coordinator.buffered_records(), 1);
    }
}
