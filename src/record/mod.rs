//! Parsed clinical export records.

pub mod clinical;
pub mod xml;

use crate::constants::{
    ACQUISITION_DATE_TAG, ACQUISITION_TIME_TAG, EXPORT_DATE_FORMAT, EXPORT_TIME_FORMAT,
    PATIENT_ID_TAG, SITE_NAME_TAG, WAVEFORM_TAG,
};
use crate::error::StructuralError;
use chrono::{NaiveDate, NaiveTime};
use std::fs;
use std::path::Path;

pub use clinical::{ClinicalContent, Measurements, QrsAnnotation, Statements};
pub use xml::Element;

/// Acquisition timestamp exactly as exported, plus its parsed form.
#[derive(Debug, Clone, PartialEq)]
pub struct Acquisition {
    /// `MM-DD-YYYY`
    pub raw_date: String,
    /// `HH:MM:SS`
    pub raw_time: String,
    pub date: NaiveDate,
    pub time: NaiveTime,
}

impl Acquisition {
    pub fn parse(raw_date: &str, raw_time: &str) -> Result<Self, StructuralError> {
        let raw_date = raw_date.trim();
        let raw_time = raw_time.trim();
        let date = NaiveDate::parse_from_str(raw_date, EXPORT_DATE_FORMAT)
            .map_err(|_| StructuralError::InvalidDate(raw_date.to_string()))?;
        let time = NaiveTime::parse_from_str(raw_time, EXPORT_TIME_FORMAT)
            .map_err(|_| StructuralError::InvalidTime(raw_time.to_string()))?;
        Ok(Self {
            raw_date: raw_date.to_string(),
            raw_time: raw_time.to_string(),
            date,
            time,
        })
    }

    /// `YYYY-MM-DD_HH:MM:SS`, the form downstream consumers sort on.
    pub fn sortable(&self) -> String {
        format!("{}_{}", self.date.format("%Y-%m-%d"), self.raw_time)
    }
}

/// One export file whose structural fundamentals have been checked: it parsed,
/// it names a patient, it has an acquisition date and time, and it carries a
/// rhythm waveform.
#[derive(Debug, Clone)]
pub struct EcgRecord {
    pub filename: String,
    pub root: Element,
    pub patient_ref: String,
    pub acquisition: Acquisition,
}

impl EcgRecord {
    pub fn from_path(path: &Path) -> Result<Self, StructuralError> {
        let filename = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());
        let bytes = fs::read(path).map_err(|e| StructuralError::Read(e.to_string()))?;
        Self::from_bytes(filename, &bytes)
    }

    /// Parse raw file content in whatever encoding the document declares.
    pub fn from_bytes(filename: impl Into<String>, bytes: &[u8]) -> Result<Self, StructuralError> {
        Self::parse(filename, &xml::decode_document(bytes)?)
    }

    pub fn parse(filename: impl Into<String>, xml: &str) -> Result<Self, StructuralError> {
        let root = xml::parse_document(xml)?;
        Self::from_root(filename.into(), root)
    }

    fn from_root(filename: String, root: Element) -> Result<Self, StructuralError> {
        let waveforms = root.find_all(WAVEFORM_TAG).len();
        if waveforms < 2 {
            return Err(StructuralError::MissingRhythmWaveform { found: waveforms });
        }

        let raw_date = root
            .find(ACQUISITION_DATE_TAG)
            .and_then(Element::text)
            .ok_or(StructuralError::MissingElement(ACQUISITION_DATE_TAG))?;
        let raw_time = root
            .find(ACQUISITION_TIME_TAG)
            .and_then(Element::text)
            .ok_or(StructuralError::MissingElement(ACQUISITION_TIME_TAG))?;
        let acquisition = Acquisition::parse(raw_date, raw_time)?;

        let patient_ref = root
            .find(PATIENT_ID_TAG)
            .and_then(Element::text)
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .ok_or(StructuralError::MissingPatientId)?
            .to_string();

        Ok(Self {
            filename,
            root,
            patient_ref,
            acquisition,
        })
    }

    /// The full-length waveform; the first `Waveform` element is the median beat.
    pub fn rhythm_waveform(&self) -> Result<&Element, StructuralError> {
        let waveforms = self.root.find_all(WAVEFORM_TAG);
        waveforms
            .get(1)
            .copied()
            .ok_or(StructuralError::MissingRhythmWaveform {
                found: waveforms.len(),
            })
    }

    pub fn find_text(&self, name: &str) -> Option<&str> {
        self.root.find(name).and_then(Element::text)
    }

    pub fn site_name(&self) -> Option<&str> {
        self.find_text(SITE_NAME_TAG)
            .map(str::trim)
            .filter(|s| !s.is_empty())
    }

    pub fn to_xml_string(&self) -> Result<String, StructuralError> {
        self.root.to_xml_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::EcgFixture;

    #[test]
    fn test_valid_record_fundamentals() {
        let xml = EcgFixture::new("12345").to_xml();
        let record = EcgRecord::parse("a.xml", &xml).unwrap();
        assert_eq!(record.patient_ref, "12345");
        assert_eq!(record.acquisition.raw_date, "03-15-2019");
        assert_eq!(record.acquisition.raw_time, "12:02:32");
        assert_eq!(record.acquisition.sortable(), "2019-03-15_12:02:32");
        assert_eq!(record.site_name(), Some("MAIN CAMPUS"));
        assert_eq!(
            record.rhythm_waveform().unwrap().child_text("WaveformType"),
            Some("Rhythm")
        );
    }

    #[test]
    fn test_missing_patient_id() {
        let xml = EcgFixture::new("12345").without_element("PatientID").to_xml();
        assert_eq!(
            EcgRecord::parse("a.xml", &xml).unwrap_err(),
            StructuralError::MissingPatientId
        );

        let xml = EcgFixture::new("   ").to_xml();
        assert_eq!(
            EcgRecord::parse("a.xml", &xml).unwrap_err(),
            StructuralError::MissingPatientId
        );
    }

    #[test]
    fn test_missing_acquisition_time() {
        let xml = EcgFixture::new("12345")
            .without_element("AcquisitionTime")
            .to_xml();
        assert_eq!(
            EcgRecord::parse("a.xml", &xml).unwrap_err(),
            StructuralError::MissingElement("AcquisitionTime")
        );
    }

    #[test]
    fn test_malformed_acquisition_date() {
        let xml = EcgFixture::new("12345").acquired("2019-03-15", "12:02:32").to_xml();
        assert!(matches!(
            EcgRecord::parse("a.xml", &xml),
            Err(StructuralError::InvalidDate(_))
        ));
    }

    #[test]
    fn test_single_waveform_rejected() {
        let xml = EcgFixture::new("12345").without_rhythm().to_xml();
        assert_eq!(
            EcgRecord::parse("a.xml", &xml).unwrap_err(),
            StructuralError::MissingRhythmWaveform { found: 1 }
        );
    }

    #[test]
    fn test_unparsable_document() {
        assert!(matches!(
            EcgRecord::parse("a.xml", "<RestingECG><PatientID>1</RestingECG>"),
            Err(StructuralError::Xml(_))
        ));
    }
}
