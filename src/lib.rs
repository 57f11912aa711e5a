pub mod batch;
pub mod config;
pub mod constants;
pub mod dedupe;
pub mod deid;
pub mod error;
pub mod features;
pub mod identity;
pub mod logging;
pub mod metrics;
pub mod pipeline;
pub mod record;
pub mod sink;
pub mod storage;
pub mod waveform;

#[cfg(test)]
#[path = "../tests/common/mod.rs"]
mod test_support;

pub use config::IngestConfig;
pub use error::{IngestError, Result};
pub use pipeline::{IngestPipeline, RunSummary};
