//! Best-effort delivery of de-identified records to a downstream consumer.

use crate::config::{SinkConfig, SinkKind};
use crate::error::{IngestError, Result, SinkError};
use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SinkRecord {
    #[serde(rename = "EUID")]
    pub euid: String,
    #[serde(rename = "PUID")]
    pub puid: String,
    /// `YYYY-MM-DD_HH:MM:SS`
    #[serde(rename = "AcquisitionDate")]
    pub acquisition_date: String,
    /// Scrubbed, identifier-injected document
    #[serde(rename = "XML")]
    pub xml: String,
}

pub trait RecordSink: Send {
    fn name(&self) -> &'static str;

    fn send(&mut self, records: &[SinkRecord]) -> std::result::Result<(), SinkError>;
}

#[derive(Debug, Default)]
pub struct NullSink;

impl RecordSink for NullSink {
    fn name(&self) -> &'static str {
        "none"
    }

    fn send(&mut self, _records: &[SinkRecord]) -> std::result::Result<(), SinkError> {
        Ok(())
    }
}

/// Appends one JSON line per record.
#[derive(Debug)]
pub struct NdjsonSink {
    path: PathBuf,
}

impl NdjsonSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl RecordSink for NdjsonSink {
    fn name(&self) -> &'static str {
        "ndjson"
    }

    fn send(&mut self, records: &[SinkRecord]) -> std::result::Result<(), SinkError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut out = String::new();
        for record in records {
            out.push_str(&serde_json::to_string(record)?);
            out.push('\n');
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        file.write_all(out.as_bytes())?;
        Ok(())
    }
}

/// POSTs each sub-batch as one JSON array.
#[derive(Debug)]
pub struct HttpSink {
    client: reqwest::blocking::Client,
    url: String,
}

impl HttpSink {
    pub fn new(url: &str, timeout: Duration) -> std::result::Result<Self, SinkError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("ecg_ingest/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            client,
            url: url.to_string(),
        })
    }
}

impl RecordSink for HttpSink {
    fn name(&self) -> &'static str {
        "http"
    }

    fn send(&mut self, records: &[SinkRecord]) -> std::result::Result<(), SinkError> {
        let response = self.client.post(&self.url).json(records).send()?;
        let status = response.status();
        debug!(url = %self.url, status = status.as_u16(), records = records.len(), "Sink batch posted");
        if !status.is_success() {
            return Err(SinkError::Status(status.as_u16()));
        }
        Ok(())
    }
}

pub fn from_config(config: &SinkConfig) -> Result<Box<dyn RecordSink>> {
    match config.kind {
        SinkKind::None => Ok(Box::new(NullSink)),
        SinkKind::Ndjson => {
            let path = config
                .path
                .as_ref()
                .ok_or_else(|| IngestError::Config("sink.path is required for the ndjson sink".to_string()))?;
            Ok(Box::new(NdjsonSink::new(path)))
        }
        SinkKind::Http => {
            let url = config
                .url
                .as_deref()
                .ok_or_else(|| IngestError::Config("sink.url is required for the http sink".to_string()))?;
            let sink = HttpSink::new(url, Duration::from_secs(config.timeout_secs))
                .map_err(|e| IngestError::Config(format!("http sink: {}", e)))?;
            Ok(Box::new(sink))
        }
    }
}
