//! Pseudonymous identifiers and the durable reference-number -> PUID mapping.

use crate::constants::{
    BUID_PREFIXES, EUID_PREFIXES, EUID_SUFFIX_LEN, ID_MAX_ATTEMPTS, ID_SUFFIX_LEN, PUID_PREFIXES,
};
use crate::error::IdentityError;
use rand::seq::SliceRandom;
use std::collections::{HashMap, HashSet};
use std::fs::{self, File};
use std::io::{self, ErrorKind, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info};
use uuid::Uuid;

const MAPPING_HEADER: [&str; 2] = ["RHRN", "PUID"];

/// In-memory reference-number -> PUID bijection, loaded from and written back to a CSV file.
#[derive(Debug, Default, Clone)]
pub struct PatientMapping {
    by_reference: HashMap<String, String>,
    puids: HashSet<String>,
}

impl PatientMapping {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.by_reference.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_reference.is_empty()
    }

    pub fn get(&self, reference: &str) -> Option<&str> {
        self.by_reference.get(reference).map(String::as_str)
    }

    pub fn contains_puid(&self, puid: &str) -> bool {
        self.puids.contains(puid)
    }

    pub fn insert(&mut self, reference: String, puid: String) -> Result<(), IdentityError> {
        if self.by_reference.contains_key(&reference) {
            return Err(IdentityError::DuplicateReference(reference));
        }
        if !self.puids.insert(puid.clone()) {
            return Err(IdentityError::DuplicatePuid(puid));
        }
        self.by_reference.insert(reference, puid);
        Ok(())
    }

    /// Parse a `RHRN,PUID` file. Fields may be quoted, so reference numbers
    /// containing commas, quotes or line breaks survive a round trip.
    pub fn parse_csv(content: &str) -> Result<Self, IdentityError> {
        let mut reader = csv::ReaderBuilder::new()
            .trim(csv::Trim::All)
            .from_reader(content.as_bytes());

        let header = reader.headers().map_err(corrupt)?;
        if header.iter().ne(MAPPING_HEADER) {
            return Err(IdentityError::Corrupt {
                line: 1,
                reason: format!(
                    "expected header '{}', found '{}'",
                    MAPPING_HEADER.join(","),
                    header.iter().collect::<Vec<_>>().join(",")
                ),
            });
        }

        let mut mapping = Self::new();
        for record in reader.records() {
            let record = record.map_err(corrupt)?;
            let line = record.position().map_or(0, |p| p.line() as usize);
            match (record.get(0), record.get(1)) {
                (Some(reference), Some(puid))
                    if record.len() == 2 && !reference.is_empty() && !puid.is_empty() =>
                {
                    mapping.insert(reference.to_string(), puid.to_string())?
                }
                _ => {
                    return Err(IdentityError::Corrupt {
                        line,
                        reason: "expected two non-empty columns".to_string(),
                    })
                }
            }
        }
        Ok(mapping)
    }

    /// The mapping as CSV, rows sorted by reference number.
    pub fn to_csv(&self) -> csv::Result<Vec<u8>> {
        let mut rows: Vec<(&String, &String)> = self.by_reference.iter().collect();
        rows.sort();
        let mut writer = csv::Writer::from_writer(Vec::with_capacity(16 + rows.len() * 24));
        writer.write_record(MAPPING_HEADER)?;
        for (reference, puid) in rows {
            writer.write_record([reference, puid])?;
        }
        writer
            .into_inner()
            .map_err(|e| csv::Error::from(e.into_error()))
    }

    /// Load the mapping file. A missing file is an error unless `create_if_missing`.
    pub fn load(path: &Path, create_if_missing: bool) -> Result<Self, IdentityError> {
        match fs::read_to_string(path) {
            Ok(content) => Self::parse_csv(&content),
            Err(e) if e.kind() == ErrorKind::NotFound && create_if_missing => {
                info!("Identity mapping {} not found, starting empty", path.display());
                Ok(Self::new())
            }
            Err(source) => Err(IdentityError::Unreadable {
                path: path.to_path_buf(),
                source,
            }),
        }
    }

    /// Rewrite the whole mapping through a temp file and rename.
    pub fn save(&self, path: &Path) -> Result<(), IdentityError> {
        let unwritable = |source: io::Error| IdentityError::Unwritable {
            path: path.to_path_buf(),
            source,
        };
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(unwritable)?;
        }
        let content = self.to_csv().map_err(|e| unwritable(io::Error::from(e)))?;
        let tmp = path.with_extension("csv.tmp");
        let mut file = File::create(&tmp).map_err(unwritable)?;
        file.write_all(&content).map_err(unwritable)?;
        file.sync_all().map_err(unwritable)?;
        fs::rename(&tmp, path).map_err(unwritable)?;
        Ok(())
    }
}

fn corrupt(e: csv::Error) -> IdentityError {
    IdentityError::Corrupt {
        line: e.position().map_or(0, |p| p.line() as usize),
        reason: e.to_string(),
    }
}

fn random_id(prefixes: &[char], suffix_len: usize) -> String {
    let prefix = prefixes
        .choose(&mut rand::thread_rng())
        .copied()
        .unwrap_or('x');
    let suffix = Uuid::new_v4().simple().to_string();
    format!("{}{}", prefix, &suffix[..suffix_len.min(suffix.len())])
}

/// Draw identifiers until `taken` rejects none, giving up after `ID_MAX_ATTEMPTS`.
fn generate_unique(
    namespace: &'static str,
    prefixes: &[char],
    suffix_len: usize,
    taken: impl Fn(&str) -> bool,
) -> Result<String, IdentityError> {
    for _ in 0..ID_MAX_ATTEMPTS {
        let candidate = random_id(prefixes, suffix_len);
        if !taken(&candidate) {
            return Ok(candidate);
        }
        debug!(namespace, "Identifier collision on {}, retrying", candidate);
    }
    Err(IdentityError::Exhausted {
        namespace,
        attempts: ID_MAX_ATTEMPTS,
    })
}

/// Owns every identifier namespace for one run.
#[derive(Debug)]
pub struct IdentityManager {
    mapping_path: PathBuf,
    mapping: PatientMapping,
    issued_euids: HashSet<String>,
    issued_buids: HashSet<String>,
    new_puids: usize,
    dirty: bool,
}

impl IdentityManager {
    pub fn open(mapping_path: &Path, create_if_missing: bool) -> Result<Self, IdentityError> {
        let mapping = PatientMapping::load(mapping_path, create_if_missing)?;
        info!(
            "Loaded {} patient mappings from {}",
            mapping.len(),
            mapping_path.display()
        );
        Ok(Self::with_mapping(mapping_path.to_path_buf(), mapping))
    }

    pub fn with_mapping(mapping_path: PathBuf, mapping: PatientMapping) -> Self {
        Self {
            mapping_path,
            mapping,
            issued_euids: HashSet::new(),
            issued_buids: HashSet::new(),
            new_puids: 0,
            dirty: false,
        }
    }

    /// The PUID for a reference number, minting and recording one on first sight.
    pub fn resolve_patient(&mut self, reference: &str) -> Result<PatientResolution, IdentityError> {
        if let Some(puid) = self.mapping.get(reference) {
            return Ok(PatientResolution {
                puid: puid.to_string(),
                is_new: false,
            });
        }
        let mapping = &self.mapping;
        let puid = generate_unique("PUID", PUID_PREFIXES, ID_SUFFIX_LEN, |c| mapping.contains_puid(c))?;
        self.mapping.insert(reference.to_string(), puid.clone())?;
        self.new_puids += 1;
        self.dirty = true;
        Ok(PatientResolution { puid, is_new: true })
    }

    pub fn new_encounter_id(&mut self) -> Result<String, IdentityError> {
        let issued = &self.issued_euids;
        let euid = generate_unique("EUID", EUID_PREFIXES, EUID_SUFFIX_LEN, |c| issued.contains(c))?;
        self.issued_euids.insert(euid.clone());
        Ok(euid)
    }

    pub fn new_batch_id(&mut self) -> Result<String, IdentityError> {
        let issued = &self.issued_buids;
        let buid = generate_unique("BUID", BUID_PREFIXES, ID_SUFFIX_LEN, |c| issued.contains(c))?;
        self.issued_buids.insert(buid.clone());
        Ok(buid)
    }

    pub fn new_puid_count(&self) -> usize {
        self.new_puids
    }

    /// Write the mapping (prior entries plus everything minted so far) if it changed.
    pub fn persist(&mut self) -> Result<(), IdentityError> {
        if !self.dirty {
            return Ok(());
        }
        self.mapping.save(&self.mapping_path)?;
        self.dirty = false;
        debug!(
            "Persisted {} patient mappings to {}",
            self.mapping.len(),
            self.mapping_path.display()
        );
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatientResolution {
    pub puid: String,
    pub is_new: bool,
}
