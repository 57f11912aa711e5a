//! Autocorrelation similarity of a lead across its four 2.5 second segments.
//!
//! Each segment's normalised autocorrelation function (lags 0..=50) is compared
//! with every other segment's by the angle between the two vectors. The score is
//! the sum of the symmetric 4x4 angle matrix, so a lead whose segments share the
//! same beat morphology scores near zero.

use crate::constants::{AUTOCORR_FFT_LEN, AUTOCORR_LAGS, AUTOCORR_SEGMENTS, AUTOCORR_SEGMENT_LEN};
use rustfft::num_complex::Complex;
use rustfft::{Fft, FftPlanner};
use std::sync::Arc;

const NORM_EPS: f64 = 1e-8;

pub type AngleMatrix = [[f64; AUTOCORR_SEGMENTS]; AUTOCORR_SEGMENTS];

/// Holds the planned forward and inverse transforms so they are built once per run.
#[derive(Clone)]
pub struct AutocorrEngine {
    forward: Arc<dyn Fft<f64>>,
    inverse: Arc<dyn Fft<f64>>,
}

impl std::fmt::Debug for AutocorrEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AutocorrEngine")
            .field("fft_len", &AUTOCORR_FFT_LEN)
            .finish()
    }
}

impl Default for AutocorrEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl AutocorrEngine {
    pub fn new() -> Self {
        let mut planner = FftPlanner::<f64>::new();
        Self {
            forward: planner.plan_fft_forward(AUTOCORR_FFT_LEN),
            inverse: planner.plan_fft_inverse(AUTOCORR_FFT_LEN),
        }
    }

    /// Normalised autocorrelation of one segment for lags `0..AUTOCORR_LAGS`.
    ///
    /// The segment is mean-centred and zero padded to `AUTOCORR_FFT_LEN`, which is
    /// long enough that the circular correlation equals the linear one. A segment
    /// with zero variance yields the zero vector.
    pub fn acf(&self, segment: &[f32]) -> Vec<f64> {
        let n = segment.len();
        let mean = segment.iter().map(|&x| x as f64).sum::<f64>() / n.max(1) as f64;

        let mut buffer = vec![Complex::new(0.0, 0.0); AUTOCORR_FFT_LEN];
        for (slot, &x) in buffer.iter_mut().zip(segment) {
            slot.re = x as f64 - mean;
        }
        self.forward.process(&mut buffer);
        for value in buffer.iter_mut() {
            *value = *value * value.conj();
        }
        self.inverse.process(&mut buffer);

        let scale = (AUTOCORR_FFT_LEN * n.max(1)) as f64;
        let acov: Vec<f64> = buffer
            .iter()
            .take(AUTOCORR_LAGS.min(n))
            .map(|c| c.re / scale)
            .collect();
        let zero_lag = acov.first().copied().unwrap_or(0.0);

        let mut acf = vec![0.0; AUTOCORR_LAGS];
        if zero_lag > 0.0 {
            for (out, value) in acf.iter_mut().zip(&acov) {
                *out = value / zero_lag;
            }
        }
        acf
    }

    pub fn angle_matrix(&self, lead: &[f32]) -> AngleMatrix {
        let acfs: Vec<Vec<f64>> = lead
            .chunks_exact(AUTOCORR_SEGMENT_LEN)
            .take(AUTOCORR_SEGMENTS)
            .map(|segment| self.acf(segment))
            .collect();

        let mut angles = [[0.0; AUTOCORR_SEGMENTS]; AUTOCORR_SEGMENTS];
        for i in 0..acfs.len() {
            for j in (i + 1)..acfs.len() {
                let angle = cosine_similarity(&acfs[i], &acfs[j]).acos();
                angles[i][j] = angle;
                angles[j][i] = angle;
            }
        }
        angles
    }

    pub fn similarity_score(&self, lead: &[f32]) -> f64 {
        self.angle_matrix(lead).iter().flatten().sum()
    }
}

/// Cosine similarity clamped to `[-1, 1]`.
pub fn cosine_similarity(a: &[f64], b: &[f64]) -> f64 {
    let dot: f64 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a = a.iter().map(|x| x * x).sum::<f64>().sqrt();
    let norm_b = b.iter().map(|x| x * x).sum::<f64>().sqrt();
    (dot / (norm_a * norm_b).max(NORM_EPS)).clamp(-1.0, 1.0)
}
