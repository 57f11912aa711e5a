//! Duplicate encounter detection against already flushed decoder rows.
//!
//! Rows still sitting in the coordinator's buffers are not consulted, so two
//! copies of one encounter inside the same unflushed sub-batch both pass.

use crate::error::Result;
use crate::storage::Stores;

/// Lookup of flushed encounters by patient and acquisition timestamp.
pub trait EncounterIndex {
    fn encounter_recorded(&self, puid: &str, date: &str, time: &str) -> Result<bool>;
}

impl EncounterIndex for Stores {
    fn encounter_recorded(&self, puid: &str, date: &str, time: &str) -> Result<bool> {
        Stores::encounter_recorded(self, puid, date, time)
    }
}

#[derive(Debug, Default)]
pub struct DuplicateDetector {
    duplicates: usize,
}

impl DuplicateDetector {
    pub fn new() -> Self {
        Self::default()
    }

    /// True when the encounter is already recorded; such records are dropped entirely.
    pub fn is_duplicate<I: EncounterIndex + ?Sized>(
        &mut self,
        index: &I,
        puid: &str,
        date: &str,
        time: &str,
    ) -> Result<bool> {
        let duplicate = index.encounter_recorded(puid, date, time)?;
        if duplicate {
            self.duplicates += 1;
        }
        Ok(duplicate)
    }

    pub fn duplicates(&self) -> usize {
        self.duplicates
    }
}
