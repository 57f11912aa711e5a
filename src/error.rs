use std::path::PathBuf;
use thiserror::Error;

/// A record that cannot be ingested. Logged, stored as an unparsable row, never fatal.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum StructuralError {
    #[error("XML parse failed: {0}")]
    Xml(String),

    #[error("Document encoding: {0}")]
    Encoding(String),

    #[error("Missing required element: {0}")]
    MissingElement(&'static str),

    #[error("PatientID is missing or blank")]
    MissingPatientId,

    #[error("Invalid acquisition date '{0}'")]
    InvalidDate(String),

    #[error("Invalid acquisition time '{0}'")]
    InvalidTime(String),

    #[error("Rhythm waveform not found ({found} waveform elements)")]
    MissingRhythmWaveform { found: usize },

    #[error("Unsupported sample rate '{0}'")]
    UnsupportedSampleRate(String),

    #[error("Expected {expected} leads, found {found}")]
    LeadCount { expected: usize, found: usize },

    #[error("Missing lead {0}")]
    MissingLead(&'static str),

    #[error("Lead {lead}: invalid base64 payload: {message}")]
    Payload { lead: String, message: String },

    #[error("Lead {lead}: expected {expected} samples, found {found}")]
    SampleCount {
        lead: String,
        expected: usize,
        found: usize,
    },

    #[error("Could not read file: {0}")]
    Read(String),
}

#[derive(Error, Debug)]
pub enum IdentityError {
    #[error("Identity mapping '{path}' could not be read: {source}")]
    Unreadable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Identity mapping line {line} is corrupt: {reason}")]
    Corrupt { line: usize, reason: String },

    #[error("Reference number '{0}' appears twice in the identity mapping")]
    DuplicateReference(String),

    #[error("PUID '{0}' is assigned to more than one reference number")]
    DuplicatePuid(String),

    #[error("No free {namespace} identifier after {attempts} attempts")]
    Exhausted {
        namespace: &'static str,
        attempts: usize,
    },

    #[error("Identity mapping '{path}' could not be written: {source}")]
    Unwritable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Error, Debug)]
pub enum FeatureError {
    #[error("Native feature library failed to load: {0}")]
    Library(#[from] libloading::Error),

    #[error("Native kernel selected but no library path configured")]
    NoLibraryPath,

    #[error("Native feature library ABI {found}, expected {expected}")]
    AbiMismatch { expected: u32, found: u32 },

    #[error("Signal buffer of {len} samples is not a whole number of {signal_len}-sample leads")]
    BufferShape { len: usize, signal_len: usize },

    #[error("Native feature routine returned status {0}")]
    NativeStatus(i32),
}

/// Downstream delivery failures. Logged and counted, never fatal.
#[derive(Error, Debug)]
pub enum SinkError {
    #[error("Sink I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("Sink payload serialization failed: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Sink request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Sink rejected batch with HTTP status {0}")]
    Status(u16),
}

/// Run-level failures. Any of these aborts the run.
#[derive(Error, Debug)]
pub enum IngestError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Identity store error: {0}")]
    Identity(#[from] IdentityError),

    #[error("Persistence error: {0}")]
    Persistence(#[from] rusqlite::Error),

    #[error("Persistence error: {skipped} of {rows} decoder rows hit an already recorded EUID")]
    EncounterConflict { rows: usize, skipped: usize },

    #[error("Feature extraction error: {0}")]
    Feature(#[from] FeatureError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML deserialization failed: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("JSON serialization failed: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, IngestError>;
