//! Read-only extraction of the clinical content that feeds the measurement and
//! statement stores. Runs on the record before any PHI is scrubbed.

use super::{EcgRecord, Element};
use crate::error::StructuralError;
use serde::{Deserialize, Serialize};

/// One annotated beat from `QRSTimesTypes`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QrsAnnotation {
    pub number: Option<u32>,
    #[serde(rename = "type")]
    pub kind: Option<i32>,
    pub time: Option<i64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Measurements {
    pub sample_base: u32,
    pub sample_exponent: Option<String>,
    pub high_pass_filter: Option<String>,
    pub low_pass_filter: Option<String>,
    pub ac_filter: Option<String>,
    pub qrs: Vec<QrsAnnotation>,
    pub global_rr: Option<f64>,
    pub qt_rr_ratio: Option<f64>,
    /// One value per configured resting-measurement field, in config order
    pub resting: Vec<Option<String>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Statements {
    pub diagnosis: String,
    pub original_diagnosis: String,
    pub extra_questions: Option<String>,
    pub reason_for_test: Option<String>,
}

/// Everything the stores need from a record besides its identity fields.
#[derive(Debug, Clone)]
pub struct ClinicalContent {
    pub measurements: Measurements,
    pub statements: Statements,
    pub site_name: Option<String>,
}

impl ClinicalContent {
    pub fn extract(
        record: &EcgRecord,
        sample_base: u32,
        resting_fields: &[String],
    ) -> Result<Self, StructuralError> {
        Ok(Self {
            measurements: extract_measurements(record, sample_base, resting_fields)?,
            statements: extract_statements(record),
            site_name: record.site_name().map(str::to_string),
        })
    }
}

fn owned_text(element: Option<&Element>) -> Option<String> {
    element
        .and_then(Element::text)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

fn parse_number<T: std::str::FromStr>(element: Option<&Element>) -> Option<T> {
    owned_text(element).and_then(|s| s.parse().ok())
}

pub fn extract_measurements(
    record: &EcgRecord,
    sample_base: u32,
    resting_fields: &[String],
) -> Result<Measurements, StructuralError> {
    let rhythm = record.rhythm_waveform()?;

    let (qrs, global_rr, qt_rr_ratio) = match record.root.find("QRSTimesTypes") {
        Some(block) => (
            block
                .children_named("QRS")
                .map(|q| QrsAnnotation {
                    number: parse_number(q.child("Number")),
                    kind: parse_number(q.child("Type")),
                    time: parse_number(q.child("Time")),
                })
                .collect(),
            parse_number(block.child("GlobalRR")),
            parse_number(block.child("QTRGGR")),
        ),
        None => (Vec::new(), None, None),
    };

    let resting_block = record.root.find("RestingECGMeasurements");
    let resting = resting_fields
        .iter()
        .map(|name| owned_text(resting_block.and_then(|b| b.child(name))))
        .collect();

    Ok(Measurements {
        sample_base,
        sample_exponent: owned_text(rhythm.child("SampleExponent")),
        high_pass_filter: owned_text(rhythm.child("HighPassFilter")),
        low_pass_filter: owned_text(rhythm.child("LowPassFilter")),
        ac_filter: owned_text(rhythm.child("ACFilter")),
        qrs,
        global_rr,
        qt_rr_ratio,
        resting,
    })
}

/// Join the statement texts of a diagnosis block. `ENDSLINE` ends a line.
fn statement_text(block: Option<&Element>) -> String {
    let mut out = String::new();
    let Some(block) = block else {
        return out;
    };
    for stmt in block.children_named("DiagnosisStatement") {
        let Some(text) = owned_text(stmt.child("StmtText")) else {
            continue;
        };
        if !out.is_empty() && !out.ends_with('\n') {
            out.push(' ');
        }
        out.push_str(&text);
        let ends_line = stmt
            .children_named("StmtFlag")
            .any(|f| f.text().map(str::trim) == Some("ENDSLINE"));
        if ends_line {
            out.push('\n');
        }
    }
    out.trim_end().to_string()
}

/// Flatten a free-form block into `Name: value` lines.
fn flatten_block(block: &Element) -> Option<String> {
    if block.children.is_empty() {
        return owned_text(Some(block));
    }
    let lines: Vec<String> = block
        .descendants()
        .into_iter()
        .filter_map(|e| owned_text(Some(e)).map(|t| format!("{}: {}", e.name, t)))
        .collect();
    if lines.is_empty() {
        None
    } else {
        Some(lines.join("\n"))
    }
}

pub fn extract_statements(record: &EcgRecord) -> Statements {
    Statements {
        diagnosis: statement_text(record.root.find("Diagnosis")),
        original_diagnosis: statement_text(record.root.find("OriginalDiagnosis")),
        extra_questions: record.root.find("ExtraQuestions").and_then(flatten_block),
        reason_for_test: record.root.find("ReasonForTest").and_then(flatten_block),
    }
}
