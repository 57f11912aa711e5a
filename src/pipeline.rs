//! Run orchestration: one file at a time through validation, duplicate
//! detection, pseudonymization and de-identification into the sub-batch
//! buffers, with periodic flushes and a final report.

use crate::batch::{AcceptedRecord, BatchCoordinator, FlushReport};
use crate::config::{load_field_list, IngestConfig};
use crate::dedupe::DuplicateDetector;
use crate::deid::{self, InjectedIds};
use crate::error::{IngestError, Result, StructuralError};
use crate::features::FeatureExtractor;
use crate::identity::IdentityManager;
use crate::metrics::IngestMetrics;
use crate::record::{ClinicalContent, EcgRecord};
use crate::sink::{self, SinkRecord};
use crate::storage::{DecoderRow, MeasurementRow, StatementRow, Stores, UnparsableRow};
use crate::waveform::{self, DecodedWaveform};
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, error, info, instrument, warn};

/// What happened to one input file.
#[derive(Debug, Clone, PartialEq)]
pub enum FileOutcome {
    Accepted { euid: String },
    Duplicate,
    Unparsable(StructuralError),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub buid: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub total_files: usize,
    pub accepted: usize,
    pub unparsable: usize,
    pub duplicates: usize,
    pub unique_patients: usize,
    pub new_puids: usize,
    pub oldest_acquisition: Option<NaiveDate>,
    pub newest_acquisition: Option<NaiveDate>,
    pub percent_500hz: f64,
    pub percent_lpf_40hz: f64,
    pub site_names: BTreeSet<String>,
    pub flushes: usize,
    pub feature_failures: usize,
    pub sink_failures: usize,
}

#[derive(Debug, Default)]
struct RunStats {
    total_files: usize,
    accepted: usize,
    unparsable: usize,
    patients: HashSet<String>,
    oldest: Option<NaiveDate>,
    newest: Option<NaiveDate>,
    at_500hz: usize,
    lpf_40hz: usize,
    sites: BTreeSet<String>,
}

fn percent(part: usize, whole: usize) -> f64 {
    if whole == 0 {
        0.0
    } else {
        part as f64 * 100.0 / whole as f64
    }
}

/// A record that passed structural validation, with everything read from it
/// before any PHI is touched.
struct ValidatedRecord {
    record: EcgRecord,
    waveform: DecodedWaveform,
    clinical: ClinicalContent,
}

pub struct IngestPipeline {
    buid: String,
    phi_fields: Vec<String>,
    resting_fields: Vec<String>,
    signal_dir: PathBuf,
    deidentified_dir: Option<PathBuf>,
    report_dir: PathBuf,
    identity: IdentityManager,
    stores: Stores,
    coordinator: BatchCoordinator,
    duplicates: DuplicateDetector,
    stats: RunStats,
    started_at: DateTime<Utc>,
}

impl IngestPipeline {
    /// Acquire every run resource. Fails before any file is read when the
    /// mapping, field lists, stores, kernel or sink cannot be set up.
    pub fn from_config(config: &IngestConfig) -> Result<Self> {
        let phi_fields = load_field_list(&config.fields.phi_fields)?;
        let resting_fields = load_field_list(&config.fields.resting_measurements)?;

        let mut identity =
            IdentityManager::open(&config.identity.mapping_path, config.identity.create_if_missing)?;
        let buid = identity.new_batch_id()?;

        let stores = Stores::open(&config.stores, &phi_fields, &resting_fields)?;
        let extractor = FeatureExtractor::from_config(&config.features)?;
        let sink = sink::from_config(&config.sink)?;

        fs::create_dir_all(&config.output.signal_dir)?;
        fs::create_dir_all(&config.output.report_dir)?;
        let deidentified_dir = match &config.output.deidentified_xml_dir {
            Some(base) => {
                let dir = base.join(&buid);
                fs::create_dir_all(&dir)?;
                Some(dir)
            }
            None => None,
        };

        info!(
            buid = %buid,
            phi_fields = phi_fields.len(),
            resting_fields = resting_fields.len(),
            kernel = extractor.kernel_name(),
            sub_batch_size = config.run.sub_batch_size,
            "Ingestion run initialized"
        );

        Ok(Self {
            coordinator: BatchCoordinator::new(
                buid.clone(),
                config.run.sub_batch_size,
                extractor,
                sink,
            ),
            buid,
            phi_fields,
            resting_fields,
            signal_dir: config.output.signal_dir.clone(),
            deidentified_dir,
            report_dir: config.output.report_dir.clone(),
            identity,
            stores,
            duplicates: DuplicateDetector::new(),
            stats: RunStats::default(),
            started_at: Utc::now(),
        })
    }

    pub fn buid(&self) -> &str {
        &self.buid
    }

    /// Ingest every file, then finalize. On a fatal error the identity mapping
    /// is still written and the stores are released.
    pub fn run(mut self, files: &[PathBuf]) -> Result<RunSummary> {
        for path in files {
            if let Err(e) = self.ingest_file(path) {
                error!(error = %e, file = %path.display(), "Fatal error; aborting run");
                if let Err(persist_err) = self.identity.persist() {
                    error!(error = %persist_err, "Identity mapping could not be written after abort");
                }
                return Err(e);
            }
        }
        self.finish()
    }

    fn validate(&self, path: &Path) -> std::result::Result<ValidatedRecord, StructuralError> {
        let record = EcgRecord::from_path(path)?;
        let waveform = waveform::decode(&record)?;
        let clinical = ClinicalContent::extract(&record, waveform.sample_rate, &self.resting_fields)?;
        Ok(ValidatedRecord {
            record,
            waveform,
            clinical,
        })
    }

    #[instrument(skip(self), fields(buid = %self.buid))]
    pub fn ingest_file(&mut self, path: &Path) -> Result<FileOutcome> {
        self.stats.total_files += 1;
        let filename = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());

        let validated = match self.validate(path) {
            Ok(v) => v,
            Err(reason) => return self.reject(filename, reason),
        };
        let ValidatedRecord {
            record,
            waveform,
            clinical,
        } = validated;

        let patient = self.identity.resolve_patient(&record.patient_ref)?;
        if patient.is_new {
            IngestMetrics::record_new_patient();
        }
        let acquisition = record.acquisition.clone();
        if self.duplicates.is_duplicate(
            &self.stores,
            &patient.puid,
            &acquisition.raw_date,
            &acquisition.raw_time,
        )? {
            IngestMetrics::record_duplicate();
            info!(file = %filename, puid = %patient.puid, "Duplicate encounter dropped");
            return Ok(FileOutcome::Duplicate);
        }

        let euid = self.identity.new_encounter_id()?;
        let (mut scrubbed, phi_values) = deid::deidentify(record, &self.phi_fields);
        scrubbed.inject_identifiers(InjectedIds {
            puid: &patient.puid,
            euid: &euid,
            buid: &self.buid,
        });
        let xml = match scrubbed.to_xml_string() {
            Ok(xml) => xml,
            Err(reason) => return self.reject(filename, reason),
        };

        waveform::write_artifact(&self.signal_dir, &euid, &patient.puid, &waveform.signal)?;
        if let Some(dir) = &self.deidentified_dir {
            let name = format!("{}_{}_{}.xml", self.buid, patient.puid, euid);
            fs::write(dir.join(name), &xml)?;
        }

        self.stats.accepted += 1;
        self.stats.patients.insert(patient.puid.clone());
        self.stats.oldest = Some(self.stats.oldest.map_or(acquisition.date, |d| d.min(acquisition.date)));
        self.stats.newest = Some(self.stats.newest.map_or(acquisition.date, |d| d.max(acquisition.date)));
        if waveform.sample_rate == crate::constants::CANONICAL_SAMPLE_RATE {
            self.stats.at_500hz += 1;
        }
        if clinical.measurements.low_pass_filter.as_deref() == Some("40") {
            self.stats.lpf_40hz += 1;
        }
        if let Some(site) = &clinical.site_name {
            self.stats.sites.insert(site.clone());
        }

        self.coordinator.append(AcceptedRecord {
            decoder: DecoderRow {
                euid: euid.clone(),
                puid: patient.puid.clone(),
                buid: self.buid.clone(),
                acquisition_date: acquisition.raw_date.clone(),
                acquisition_time: acquisition.raw_time.clone(),
                phi: phi_values,
            },
            measurement: MeasurementRow {
                euid: euid.clone(),
                buid: self.buid.clone(),
                measurements: clinical.measurements,
            },
            statement: StatementRow {
                euid: euid.clone(),
                buid: self.buid.clone(),
                statements: clinical.statements,
            },
            signal: waveform.signal,
            outbound: SinkRecord {
                euid: euid.clone(),
                puid: patient.puid,
                acquisition_date: acquisition.sortable(),
                xml,
            },
        });
        IngestMetrics::record_accepted();
        debug!(file = %filename, euid = %euid, "Record accepted");

        if self.coordinator.should_flush() {
            self.flush()?;
        }
        Ok(FileOutcome::Accepted { euid })
    }

    fn reject(&mut self, filename: String, reason: StructuralError) -> Result<FileOutcome> {
        warn!(file = %filename, reason = %reason, "Unparsable record");
        IngestMetrics::record_unparsable();
        self.stats.unparsable += 1;
        self.coordinator.append_unparsable(UnparsableRow {
            filename,
            buid: self.buid.clone(),
            reason: reason.to_string(),
        });
        if self.coordinator.should_flush_unparsable() {
            self.coordinator.flush_unparsable(&mut self.stores)?;
        }
        Ok(FileOutcome::Unparsable(reason))
    }

    /// Persist the identity mapping, then flush the buffered sub-batch, so no
    /// flushed row references a PUID missing from the durable mapping.
    pub fn flush(&mut self) -> Result<FlushReport> {
        self.identity.persist()?;
        self.coordinator.flush(&mut self.stores)
    }

    fn finish(mut self) -> Result<RunSummary> {
        if self.coordinator.buffered_records() > 0 || self.coordinator.buffered_unparsable() > 0 {
            self.flush()?;
        }
        self.identity.persist()?;

        let totals = self.coordinator.totals();
        let stats = &self.stats;
        let summary = RunSummary {
            buid: self.buid.clone(),
            started_at: self.started_at,
            finished_at: Utc::now(),
            total_files: stats.total_files,
            accepted: stats.accepted,
            unparsable: stats.unparsable,
            duplicates: self.duplicates.duplicates(),
            unique_patients: stats.patients.len(),
            new_puids: self.identity.new_puid_count(),
            oldest_acquisition: stats.oldest,
            newest_acquisition: stats.newest,
            percent_500hz: percent(stats.at_500hz, stats.accepted),
            percent_lpf_40hz: percent(stats.lpf_40hz, stats.accepted),
            site_names: stats.sites.clone(),
            flushes: totals.flushes,
            feature_failures: totals.feature_failures,
            sink_failures: totals.sink_failures,
        };

        let report_path = self.report_dir.join(format!("{}.json", self.buid));
        fs::write(&report_path, serde_json::to_string_pretty(&summary)?)?;
        self.stores.close()?;

        info!(
            buid = %summary.buid,
            total = summary.total_files,
            accepted = summary.accepted,
            unparsable = summary.unparsable,
            duplicates = summary.duplicates,
            unique_patients = summary.unique_patients,
            new_puids = summary.new_puids,
            report = %report_path.display(),
            "Ingestion run complete"
        );
        Ok(summary)
    }
}

/// `*.xml` files directly inside `dir`, in file-name order.
pub fn list_xml_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        let is_xml = path
            .extension()
            .map_or(false, |ext| ext.eq_ignore_ascii_case("xml"));
        if is_xml && path.is_file() {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

/// For each PHI-looking tag not covered by `configured`, the number of files it appears in.
pub fn audit_phi_tags(files: &[PathBuf], configured: &[String]) -> BTreeMap<String, usize> {
    let mut found = BTreeMap::new();
    for path in files {
        match EcgRecord::from_path(path) {
            Ok(record) => {
                for tag in deid::uncovered_phi_tags(&record.root, configured) {
                    *found.entry(tag).or_insert(0) += 1;
                }
            }
            Err(e) => warn!(file = %path.display(), error = %e, "Skipping unreadable file in PHI audit"),
        }
    }
    found
}

/// Propose a PHI field list from one sample export.
pub fn suggest_phi_fields(sample: &Path) -> Result<Vec<String>> {
    let record = EcgRecord::from_path(sample)
        .map_err(|e| IngestError::Config(format!("{}: {}", sample.display(), e)))?;
    Ok(deid::suggest_phi_fields(&record.root))
}
