//! Rows buffered for each store and their column values.

use super::Store;
use crate::constants::MISSING_FIELD_SENTINEL;
use crate::deid::ExtractedValue;
use crate::error::Result;
use crate::features::FeatureRow;
use crate::record::{Measurements, Statements};
use rusqlite::types::Value;

/// Column values in schema order.
pub trait StoreRow {
    const STORE: Store;

    fn values(&self) -> Result<Vec<Value>>;
}

fn text(s: &str) -> Value {
    Value::Text(s.to_string())
}

fn opt_text(s: &Option<String>) -> Value {
    s.as_deref().map_or(Value::Null, text)
}

fn opt_real(v: Option<f64>) -> Value {
    v.map_or(Value::Null, Value::Real)
}

/// Identified attributes of one accepted encounter.
#[derive(Debug, Clone, PartialEq)]
pub struct DecoderRow {
    pub euid: String,
    pub puid: String,
    pub buid: String,
    /// As exported, `MM-DD-YYYY`
    pub acquisition_date: String,
    /// As exported, `HH:MM:SS`
    pub acquisition_time: String,
    /// Original PHI values, in configured field order
    pub phi: Vec<ExtractedValue>,
}

impl StoreRow for DecoderRow {
    const STORE: Store = Store::Decoder;

    fn values(&self) -> Result<Vec<Value>> {
        let mut values = vec![
            text(&self.euid),
            text(&self.puid),
            text(&self.buid),
            text(&self.acquisition_date),
            text(&self.acquisition_time),
        ];
        values.extend(self.phi.iter().map(|v| match v {
            ExtractedValue::Missing => text(MISSING_FIELD_SENTINEL),
            ExtractedValue::Empty => Value::Null,
            ExtractedValue::Text(s) => text(s),
        }));
        Ok(values)
    }
}

impl StoreRow for FeatureRow {
    const STORE: Store = Store::Features;

    fn values(&self) -> Result<Vec<Value>> {
        Ok(vec![
            text(&self.feature_id),
            text(&self.euid),
            text(&self.buid),
            Value::Integer(self.lead_index as i64),
            text(self.lead),
            Value::Integer(i64::from(self.flat20)),
            Value::Real(self.curve_length),
            Value::Real(self.hist_entropy),
            Value::Real(self.autocorr_similarity),
        ])
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MeasurementRow {
    pub euid: String,
    pub buid: String,
    pub measurements: Measurements,
}

impl StoreRow for MeasurementRow {
    const STORE: Store = Store::Measurements;

    fn values(&self) -> Result<Vec<Value>> {
        let m = &self.measurements;
        let mut values = vec![
            text(&self.euid),
            text(&self.buid),
            Value::Integer(i64::from(m.sample_base)),
            opt_text(&m.sample_exponent),
            opt_text(&m.high_pass_filter),
            opt_text(&m.low_pass_filter),
            opt_text(&m.ac_filter),
            Value::Text(serde_json::to_string(&m.qrs)?),
            opt_real(m.global_rr),
            opt_real(m.qt_rr_ratio),
        ];
        values.extend(m.resting.iter().map(opt_text));
        Ok(values)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct StatementRow {
    pub euid: String,
    pub buid: String,
    pub statements: Statements,
}

impl StoreRow for StatementRow {
    const STORE: Store = Store::Statements;

    fn values(&self) -> Result<Vec<Value>> {
        let s = &self.statements;
        Ok(vec![
            text(&self.euid),
            text(&self.buid),
            text(&s.diagnosis),
            text(&s.original_diagnosis),
            opt_text(&s.extra_questions),
            opt_text(&s.reason_for_test),
        ])
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct UnparsableRow {
    pub filename: String,
    pub buid: String,
    pub reason: String,
}

impl StoreRow for UnparsableRow {
    const STORE: Store = Store::Unparsable;

    fn values(&self) -> Result<Vec<Value>> {
        Ok(vec![
            text(&self.filename),
            text(&self.buid),
            text(&self.reason),
        ])
    }
}

/// Everything one flush writes.
#[derive(Debug, Default, Clone)]
pub struct RowBatch {
    pub decoder: Vec<DecoderRow>,
    pub features: Vec<FeatureRow>,
    pub measurements: Vec<MeasurementRow>,
    pub statements: Vec<StatementRow>,
    pub unparsable: Vec<UnparsableRow>,
}

impl RowBatch {
    pub fn is_empty(&self) -> bool {
        self.decoder.is_empty()
            && self.features.is_empty()
            && self.measurements.is_empty()
            && self.statements.is_empty()
            && self.unparsable.is_empty()
    }
}
