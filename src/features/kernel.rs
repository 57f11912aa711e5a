//! Per-lead signal quality metrics: flatness flag, curve length and histogram entropy.
//!
//! The metrics are computed by a `FeatureKernel` over a whole sub-batch buffer in
//! one call. `ReferenceKernel` is the plain definition, `ParallelKernel` splits the
//! leads across the rayon pool, and `NativeKernel` calls a shared library that
//! exports the versioned `GetWvfmFeatures` routine.

use crate::constants::{ENTROPY_BINS, FLAT_RUN_LEN, NATIVE_ABI_VERSION, SAMPLES_PER_LEAD};
use crate::error::FeatureError;
use libloading::{Library, Symbol};
use rayon::prelude::*;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LeadMetrics {
    pub flat20: bool,
    pub curve_length: f64,
    pub hist_entropy: f64,
}

pub trait FeatureKernel: Send + Sync {
    fn name(&self) -> &'static str;

    /// One `LeadMetrics` per `SAMPLES_PER_LEAD` chunk of `signals`, in order.
    fn lead_metrics(&self, signals: &[f32]) -> Result<Vec<LeadMetrics>, FeatureError>;
}

pub fn lead_count(signals: &[f32]) -> Result<usize, FeatureError> {
    if signals.len() % SAMPLES_PER_LEAD != 0 {
        return Err(FeatureError::BufferShape {
            len: signals.len(),
            signal_len: SAMPLES_PER_LEAD,
        });
    }
    Ok(signals.len() / SAMPLES_PER_LEAD)
}

/// True when some run of `FLAT_RUN_LEN` consecutive samples holds one exact value.
pub fn has_flat_run(lead: &[f32]) -> bool {
    let mut run = 1usize;
    for pair in lead.windows(2) {
        if pair[0] == pair[1] {
            run += 1;
            if run >= FLAT_RUN_LEN {
                return true;
            }
        } else {
            run = 1;
        }
    }
    false
}

/// Arc length of the sampled trace with unit spacing between samples.
pub fn curve_length(lead: &[f32]) -> f64 {
    lead.windows(2)
        .map(|pair| {
            let dy = pair[1] as f64 - pair[0] as f64;
            (1.0 + dy * dy).sqrt()
        })
        .sum()
}

/// Shannon entropy in bits of the amplitude histogram over `ENTROPY_BINS`
/// equal-width bins between the lead's minimum and maximum.
pub fn histogram_entropy(lead: &[f32]) -> f64 {
    if lead.is_empty() {
        return 0.0;
    }
    let (min, max) = lead.iter().fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &x| {
        let x = x as f64;
        (lo.min(x), hi.max(x))
    });
    if max <= min {
        return 0.0;
    }
    let width = (max - min) / ENTROPY_BINS as f64;
    let mut counts = [0usize; ENTROPY_BINS];
    for &x in lead {
        let bin = (((x as f64) - min) / width).floor() as usize;
        counts[bin.min(ENTROPY_BINS - 1)] += 1;
    }
    let n = lead.len() as f64;
    counts
        .iter()
        .filter(|&&c| c > 0)
        .map(|&c| {
            let p = c as f64 / n;
            -p * p.log2()
        })
        .sum()
}

pub fn metrics_for_lead(lead: &[f32]) -> LeadMetrics {
    LeadMetrics {
        flat20: has_flat_run(lead),
        curve_length: curve_length(lead),
        hist_entropy: histogram_entropy(lead),
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct ReferenceKernel;

impl FeatureKernel for ReferenceKernel {
    fn name(&self) -> &'static str {
        "reference"
    }

    fn lead_metrics(&self, signals: &[f32]) -> Result<Vec<LeadMetrics>, FeatureError> {
        lead_count(signals)?;
        Ok(signals
            .chunks_exact(SAMPLES_PER_LEAD)
            .map(metrics_for_lead)
            .collect())
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct ParallelKernel;

impl FeatureKernel for ParallelKernel {
    fn name(&self) -> &'static str {
        "parallel"
    }

    fn lead_metrics(&self, signals: &[f32]) -> Result<Vec<LeadMetrics>, FeatureError> {
        lead_count(signals)?;
        Ok(signals
            .par_chunks_exact(SAMPLES_PER_LEAD)
            .map(metrics_for_lead)
            .collect())
    }
}

type AbiVersionFn = unsafe extern "C" fn() -> u32;
type GetWvfmFeaturesFn =
    unsafe extern "C" fn(*const f32, *mut f32, *mut f32, *mut i32, usize) -> i32;

const ABI_VERSION_SYMBOL: &[u8] = b"wvfm_features_abi_version\0";
const FEATURES_SYMBOL: &[u8] = b"GetWvfmFeatures\0";

/// Shared library exporting ABI version 1:
///
/// ```c
/// uint32_t wvfm_features_abi_version(void);
/// int32_t GetWvfmFeatures(const float *signals, float *curve_length,
///                         float *hist_entropy, int32_t *flat20, size_t n_signals);
/// ```
///
/// `signals` holds `n_signals` leads of 5000 samples; each output array holds
/// `n_signals` values. A zero return means success.
pub struct NativeKernel {
    library: Library,
    path: PathBuf,
}

impl std::fmt::Debug for NativeKernel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NativeKernel").field("path", &self.path).finish()
    }
}

impl NativeKernel {
    pub fn load(path: &Path) -> Result<Self, FeatureError> {
        // SAFETY: loading runs the library's initialisers; the path is operator configuration.
        let library = unsafe { Library::new(path)? };

        // SAFETY: the symbol type matches the declared ABI version function.
        let found = unsafe {
            let version: Symbol<AbiVersionFn> = library.get(ABI_VERSION_SYMBOL)?;
            version()
        };
        if found != NATIVE_ABI_VERSION {
            return Err(FeatureError::AbiMismatch {
                expected: NATIVE_ABI_VERSION,
                found,
            });
        }

        // SAFETY: only resolves the symbol; it is called in `lead_metrics`.
        unsafe {
            library.get::<GetWvfmFeaturesFn>(FEATURES_SYMBOL)?;
        }

        info!(path = %path.display(), abi = found, "Loaded native feature library");
        Ok(Self {
            library,
            path: path.to_path_buf(),
        })
    }
}

impl FeatureKernel for NativeKernel {
    fn name(&self) -> &'static str {
        "native"
    }

    fn lead_metrics(&self, signals: &[f32]) -> Result<Vec<LeadMetrics>, FeatureError> {
        // SAFETY: the symbol type matches the ABI version checked in `load`.
        unsafe {
            let routine: Symbol<GetWvfmFeaturesFn> = self.library.get(FEATURES_SYMBOL)?;
            call_features_routine(*routine, signals)
        }
    }
}

/// Marshal one sub-batch through a `GetWvfmFeatures`-shaped routine.
///
/// # Safety
///
/// `routine` must honour the version 1 contract: read `n_signals` leads from
/// `signals`, write `n_signals` values to each output, and nothing else.
unsafe fn call_features_routine(
    routine: GetWvfmFeaturesFn,
    signals: &[f32],
) -> Result<Vec<LeadMetrics>, FeatureError> {
    let n = lead_count(signals)?;
    if n == 0 {
        return Ok(Vec::new());
    }
    let mut curve = vec![0.0f32; n];
    let mut entropy = vec![0.0f32; n];
    let mut flat = vec![0i32; n];

    debug!(leads = n, "Calling native feature routine");
    // SAFETY: `signals` holds exactly `n * SAMPLES_PER_LEAD` samples and each
    // output buffer holds `n` elements. The buffers outlive the call and are
    // not aliased.
    let status = routine(
        signals.as_ptr(),
        curve.as_mut_ptr(),
        entropy.as_mut_ptr(),
        flat.as_mut_ptr(),
        n,
    );
    if status != 0 {
        return Err(FeatureError::NativeStatus(status));
    }

    Ok((0..n)
        .map(|i| LeadMetrics {
            flat20: flat[i] != 0,
            curve_length: curve[i] as f64,
            hist_entropy: entropy[i] as f64,
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn varied_lead(seed: usize) -> Vec<f32> {
        (0..SAMPLES_PER_LEAD)
            .map(|k| ((k * (seed + 3) * 13) % 97) as f32 - 48.0)
            .collect()
    }

    #[test]
    fn test_flat_run_threshold() {
        let mut lead = varied_lead(1);
        for s in &mut lead[100..119] {
            *s = 5.0;
        }
        lead[99] = 4.0;
        lead[119] = 6.0;
        assert!(!has_flat_run(&lead), "19 equal samples is not a flat run");

        lead[119] = 5.0;
        assert!(has_flat_run(&lead));
    }

    #[test]
    fn test_curve_length() {
        assert_eq!(curve_length(&[0.0, 0.0, 0.0]), 2.0);
        let len = curve_length(&[0.0, 3.0]);
        assert!((len - 10f64.sqrt()).abs() < 1e-12);
        assert_eq!(curve_length(&[]), 0.0);
    }

    #[test]
    fn test_histogram_entropy() {
        assert_eq!(histogram_entropy(&vec![3.0; 100]), 0.0);

        // Two equally populated extremes give one bit
        let lead: Vec<f32> = (0..100).map(|i| if i % 2 == 0 { 0.0 } else { 1.0 }).collect();
        assert!((histogram_entropy(&lead) - 1.0).abs() < 1e-12);

        // One sample per bin gives log2(64) = 6 bits
        let lead: Vec<f32> = (0..ENTROPY_BINS).map(|i| i as f32 + 0.5).collect();
        assert!((histogram_entropy(&lead) - 6.0).abs() < 1e-9);
    }

    #[test]
    fn test_reference_and_parallel_agree() {
        let mut signals = Vec::new();
        for seed in 0..16 {
            signals.extend(varied_lead(seed));
        }
        signals[3 * SAMPLES_PER_LEAD..3 * SAMPLES_PER_LEAD + 40].fill(0.0);

        let reference = ReferenceKernel.lead_metrics(&signals).unwrap();
        let parallel = ParallelKernel.lead_metrics(&signals).unwrap();
        assert_eq!(reference.len(), 16);
        assert_eq!(reference, parallel);
        assert!(reference[3].flat20);
        assert!(!reference[4].flat20);
    }

    #[test]
    fn test_buffer_shape_rejected() {
        let signals = vec![0.0f32; SAMPLES_PER_LEAD + 1];
        assert!(matches!(
            ReferenceKernel.lead_metrics(&signals),
            Err(FeatureError::BufferShape { .. })
        ));
        assert!(ParallelKernel.lead_metrics(&signals).is_err());
    }

    /// Version 1 routine backed by the reference metrics.
    unsafe extern "C" fn reference_routine(
        signals: *const f32,
        curve_length: *mut f32,
        hist_entropy: *mut f32,
        flat20: *mut i32,
        n_signals: usize,
    ) -> i32 {
        let signals = std::slice::from_raw_parts(signals, n_signals * SAMPLES_PER_LEAD);
        let curve = std::slice::from_raw_parts_mut(curve_length, n_signals);
        let entropy = std::slice::from_raw_parts_mut(hist_entropy, n_signals);
        let flat = std::slice::from_raw_parts_mut(flat20, n_signals);
        for (i, lead) in signals.chunks_exact(SAMPLES_PER_LEAD).enumerate() {
            let metrics = metrics_for_lead(lead);
            curve[i] = metrics.curve_length as f32;
            entropy[i] = metrics.hist_entropy as f32;
            flat[i] = i32::from(metrics.flat20);
        }
        0
    }

    unsafe extern "C" fn failing_routine(
        _signals: *const f32,
        _curve_length: *mut f32,
        _hist_entropy: *mut f32,
        _flat20: *mut i32,
        _n_signals: usize,
    ) -> i32 {
        7
    }

    #[test]
    fn test_native_marshalling_matches_reference() {
        let mut signals = Vec::new();
        for seed in 0..6 {
            signals.extend(varied_lead(seed));
        }
        signals[2 * SAMPLES_PER_LEAD..2 * SAMPLES_PER_LEAD + 25].fill(1.0);

        let reference = ReferenceKernel.lead_metrics(&signals).unwrap();
        let native = unsafe { call_features_routine(reference_routine, &signals) }.unwrap();
        assert_eq!(native.len(), reference.len());
        for (n, r) in native.iter().zip(&reference) {
            assert_eq!(n.flat20, r.flat20);
            // Outputs cross the boundary as f32
            assert!((n.curve_length - r.curve_length).abs() <= 1e-6 * r.curve_length.max(1.0));
            assert!((n.hist_entropy - r.hist_entropy).abs() <= 1e-6 * r.hist_entropy.max(1.0));
        }
        assert!(native[2].flat20);
    }

    #[test]
    fn test_native_status_and_shape_errors() {
        let signals = varied_lead(0);
        assert!(matches!(
            unsafe { call_features_routine(failing_routine, &signals) },
            Err(FeatureError::NativeStatus(7))
        ));
        // Empty batches never reach the routine
        assert!(unsafe { call_features_routine(failing_routine, &[]) }
            .unwrap()
            .is_empty());
        assert!(matches!(
            unsafe { call_features_routine(reference_routine, &signals[1..]) },
            Err(FeatureError::BufferShape { .. })
        ));
    }

    #[test]
    fn test_native_library_missing() {
        let err = NativeKernel::load(Path::new("/nonexistent/libwvfm_features.so")).unwrap_err();
        assert!(matches!(err, FeatureError::Library(_)));
    }
}
