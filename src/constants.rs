/// Waveform layout constants shared by the codec, the feature engine and the stores.
/// The export format always carries these eight independent leads in the rhythm strip.

// Lead slot order inside a record's signal buffer
pub const LEAD_ORDER: [&str; LEAD_COUNT] = ["I", "II", "V1", "V2", "V3", "V4", "V5", "V6"];
pub const LEAD_COUNT: usize = 8;

// Canonical sampling: 10 seconds at 500 Hz
pub const CANONICAL_SAMPLE_RATE: u32 = 500;
pub const SAMPLES_PER_LEAD: usize = 5000;
pub const SIGNAL_LEN: usize = LEAD_COUNT * SAMPLES_PER_LEAD;

/// Sample rates a rhythm waveform may declare in `SampleBase`
pub const ACCEPTED_SAMPLE_RATES: [u32; 2] = [250, 500];

// Autocorrelation similarity parameters
pub const AUTOCORR_SEGMENTS: usize = 4;
pub const AUTOCORR_SEGMENT_LEN: usize = SAMPLES_PER_LEAD / AUTOCORR_SEGMENTS;
pub const AUTOCORR_FFT_LEN: usize = 2560;
pub const AUTOCORR_LAGS: usize = 51;

// Native metric parameters
pub const FLAT_RUN_LEN: usize = 20;
pub const ENTROPY_BINS: usize = 64;

// Identifier prefixes, one alphabet per namespace
pub const PUID_PREFIXES: &[char] = &['a', 'p'];
pub const EUID_PREFIXES: &[char] = &['b', 'e'];
pub const BUID_PREFIXES: &[char] = &['c'];
/// PUID and BUID suffix length. PUIDs are checked against the durable mapping.
pub const ID_SUFFIX_LEN: usize = 8;
/// EUIDs carry a whole v4 UUID; nothing durable is consulted when minting them.
pub const EUID_SUFFIX_LEN: usize = 32;
pub const ID_MAX_ATTEMPTS: usize = 64;

// De-identification
pub const BLANK_TEXT: &str = " ";
pub const MISSING_FIELD_SENTINEL: &str = "NULL";
pub const AGE_FIELD: &str = "PatientAge";
pub const AGE_THRESHOLD: u32 = 90;
pub const AGE_SENTINEL: &str = "999";

// Export element names the pipeline reads directly
pub const PATIENT_ID_TAG: &str = "PatientID";
pub const ACQUISITION_DATE_TAG: &str = "AcquisitionDate";
pub const ACQUISITION_TIME_TAG: &str = "AcquisitionTime";
pub const WAVEFORM_TAG: &str = "Waveform";
pub const SITE_NAME_TAG: &str = "SiteName";

/// Element names in the prefix of an export that always carry PHI
pub const BASE_PHI_FIELDS: [&str; 6] = [
    "PatientLastName",
    "PatientFirstName",
    "LocationName",
    "DateofBirth",
    "Gender",
    "PatientAge",
];

/// PHI discovery stops at the first element with this name
pub const PHI_SCAN_STOP_TAG: &str = "QRSTimesTypes";
pub const PHI_NAME_HINTS: [&str; 4] = ["date", "time", "name", "location"];

// Export date/time formats
pub const EXPORT_DATE_FORMAT: &str = "%m-%d-%Y";
pub const EXPORT_TIME_FORMAT: &str = "%H:%M:%S";

/// Default number of accepted records per sub-batch
pub const DEFAULT_SUB_BATCH_SIZE: usize = 3000;

/// Native feature library ABI this crate was written against
pub const NATIVE_ABI_VERSION: u32 = 1;
