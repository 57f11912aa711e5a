//! PHI scrubbing, identifier injection and PHI tag discovery.

use crate::constants::{
    AGE_FIELD, AGE_SENTINEL, AGE_THRESHOLD, BASE_PHI_FIELDS, BLANK_TEXT, PATIENT_ID_TAG,
    PHI_NAME_HINTS, PHI_SCAN_STOP_TAG,
};
use crate::record::{EcgRecord, Element};
use std::collections::HashSet;

/// The original value of one configured PHI field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExtractedValue {
    /// No element with this name exists in the record
    Missing,
    /// The element exists but carries no text
    Empty,
    Text(String),
}

/// A record after PHI removal. Only scrubbed records can receive pseudonymous identifiers.
#[derive(Debug, Clone)]
pub struct ScrubbedRecord {
    pub record: EcgRecord,
}

fn scrubbed_value(field: &str, original: Option<&str>) -> String {
    if field == AGE_FIELD {
        let at_or_above_threshold = original
            .and_then(|s| s.trim().parse::<u32>().ok())
            .map_or(false, |age| age >= AGE_THRESHOLD);
        if at_or_above_threshold {
            return AGE_SENTINEL.to_string();
        }
    }
    BLANK_TEXT.to_string()
}

/// Blank every listed field, returning the removed values in list order.
///
/// Each field's element text becomes a single blank rather than being removed,
/// so identifier injection always finds its target elements. `PatientAge`
/// values at or above the age threshold get a fixed sentinel instead.
pub fn deidentify(mut record: EcgRecord, fields: &[String]) -> (ScrubbedRecord, Vec<ExtractedValue>) {
    let mut extracted = Vec::with_capacity(fields.len());
    for field in fields {
        match record.root.find_mut(field) {
            None => extracted.push(ExtractedValue::Missing),
            Some(element) => {
                let original = element.text.take();
                element.text = Some(scrubbed_value(field, original.as_deref()));
                extracted.push(match original {
                    Some(text) => ExtractedValue::Text(text),
                    None => ExtractedValue::Empty,
                });
            }
        }
    }
    (ScrubbedRecord { record }, extracted)
}

/// Identifiers embedded into a scrubbed document for later cross-reference.
#[derive(Debug, Clone, Copy)]
pub struct InjectedIds<'a> {
    pub puid: &'a str,
    pub euid: &'a str,
    pub buid: &'a str,
}

fn set_text(root: &mut Element, name: &str, value: &str) {
    if let Some(element) = root.find_mut(name) {
        element.text = Some(value.to_string());
    }
}

impl ScrubbedRecord {
    /// `PatientID` and `PatientLastName` carry the PUID, `DateofBirth` the BUID,
    /// `PatientFirstName` the EUID.
    pub fn inject_identifiers(&mut self, ids: InjectedIds<'_>) {
        let root = &mut self.record.root;
        set_text(root, PATIENT_ID_TAG, ids.puid);
        set_text(root, "PatientLastName", ids.puid);
        set_text(root, "DateofBirth", ids.buid);
        set_text(root, "PatientFirstName", ids.euid);
    }

    pub fn to_xml_string(&self) -> Result<String, crate::error::StructuralError> {
        self.record.to_xml_string()
    }
}

fn looks_like_phi(tag: &str) -> bool {
    let lower = tag.to_lowercase();
    PHI_NAME_HINTS.iter().any(|hint| lower.contains(hint))
}

/// Propose an ordered PHI field list from a sample export.
///
/// Starts from the fixed base set, then adds (in document order) every element
/// before `QRSTimesTypes` whose name mentions a date, time, name or location.
pub fn suggest_phi_fields(root: &Element) -> Vec<String> {
    let mut fields: Vec<String> = BASE_PHI_FIELDS.iter().map(|s| s.to_string()).collect();
    let mut seen: HashSet<String> = fields.iter().cloned().collect();

    let candidates = std::iter::once(root).chain(root.descendants());
    for element in candidates {
        if seen.contains(&element.name) {
            continue;
        }
        if element.name == PHI_SCAN_STOP_TAG {
            break;
        }
        if looks_like_phi(&element.name) {
            seen.insert(element.name.clone());
            fields.push(element.name.clone());
        }
    }
    fields
}

/// PHI-looking tags in the demographic prefix of a record that `configured` does not cover.
pub fn uncovered_phi_tags(root: &Element, configured: &[String]) -> Vec<String> {
    let configured: HashSet<&str> = configured.iter().map(String::as_str).collect();
    let mut seen = HashSet::new();
    let mut out = Vec::new();
    for element in std::iter::once(root).chain(root.descendants()) {
        if configured.contains(element.name.as_str()) {
            continue;
        }
        if element.name == PHI_SCAN_STOP_TAG {
            break;
        }
        if !looks_like_phi(&element.name) {
            continue;
        }
        if seen.insert(element.name.clone()) {
            out.push(element.name.clone());
        }
    }
    out
}
