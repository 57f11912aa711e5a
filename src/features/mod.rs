//! Per-lead feature rows for a sub-batch of decoded signals.

pub mod autocorr;
pub mod kernel;

pub use autocorr::AutocorrEngine;
pub use kernel::{FeatureKernel, LeadMetrics, NativeKernel, ParallelKernel, ReferenceKernel};

use crate::config::{FeaturesConfig, KernelKind};
use crate::constants::{LEAD_COUNT, LEAD_ORDER, SAMPLES_PER_LEAD, SIGNAL_LEN};
use crate::error::FeatureError;
use tracing::debug;

#[derive(Debug, Clone, PartialEq)]
pub struct FeatureRow {
    /// `<EUID>.<lead>`
    pub feature_id: String,
    pub euid: String,
    pub buid: String,
    pub lead_index: usize,
    pub lead: &'static str,
    pub flat20: bool,
    pub curve_length: f64,
    pub hist_entropy: f64,
    pub autocorr_similarity: f64,
}

pub struct FeatureExtractor {
    kernel: Box<dyn FeatureKernel>,
    autocorr: AutocorrEngine,
}

impl FeatureExtractor {
    pub fn new(kernel: Box<dyn FeatureKernel>) -> Self {
        Self {
            kernel,
            autocorr: AutocorrEngine::new(),
        }
    }

    pub fn from_config(config: &FeaturesConfig) -> Result<Self, FeatureError> {
        let kernel: Box<dyn FeatureKernel> = match config.kernel {
            KernelKind::Reference => Box::new(ReferenceKernel),
            KernelKind::Parallel => Box::new(ParallelKernel),
            KernelKind::Native => match &config.native_library {
                Some(path) => Box::new(NativeKernel::load(path)?),
                None => return Err(FeatureError::NoLibraryPath),
            },
        };
        Ok(Self::new(kernel))
    }

    pub fn kernel_name(&self) -> &'static str {
        self.kernel.name()
    }

    /// Compute eight feature rows per record.
    ///
    /// `signals` holds one `SIGNAL_LEN` buffer per entry of `euids`, back to back.
    /// Kernel metrics come from a single kernel call over the whole buffer.
    pub fn extract(
        &self,
        signals: &[f32],
        euids: &[String],
        buid: &str,
    ) -> Result<Vec<FeatureRow>, FeatureError> {
        if signals.len() != euids.len() * SIGNAL_LEN {
            return Err(FeatureError::BufferShape {
                len: signals.len(),
                signal_len: SIGNAL_LEN,
            });
        }
        let metrics = self.kernel.lead_metrics(signals)?;
        debug!(
            kernel = self.kernel.name(),
            records = euids.len(),
            leads = metrics.len(),
            "Kernel metrics computed"
        );

        let mut rows = Vec::with_capacity(metrics.len());
        for (slot, (lead_signal, m)) in signals
            .chunks_exact(SAMPLES_PER_LEAD)
            .zip(metrics)
            .enumerate()
        {
            let euid = &euids[slot / LEAD_COUNT];
            let lead_index = slot % LEAD_COUNT;
            let lead = LEAD_ORDER[lead_index];
            rows.push(FeatureRow {
                feature_id: format!("{}.{}", euid, lead),
                euid: euid.clone(),
                buid: buid.to_string(),
                lead_index,
                lead,
                flat20: m.flat20,
                curve_length: m.curve_length,
                hist_entropy: m.hist_entropy,
                autocorr_similarity: self.autocorr.similarity_score(lead_signal),
            });
        }
        Ok(rows)
    }
}
