//! Rhythm waveform decoding, resampling to the canonical rate, and the
//! per-encounter binary signal artifact.

use crate::constants::{
    ACCEPTED_SAMPLE_RATES, CANONICAL_SAMPLE_RATE, LEAD_COUNT, LEAD_ORDER, SAMPLES_PER_LEAD,
    SIGNAL_LEN,
};
use crate::error::StructuralError;
use crate::record::{EcgRecord, Element};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use byteorder::{ByteOrder, LittleEndian, ReadBytesExt, WriteBytesExt};
use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

/// Eight leads of 5000 canonical-rate samples, laid out lead after lead in `LEAD_ORDER`.
#[derive(Debug, Clone, PartialEq)]
pub struct SignalBuffer {
    samples: Vec<f32>,
}

impl SignalBuffer {
    pub fn from_samples(samples: Vec<f32>) -> Option<Self> {
        (samples.len() == SIGNAL_LEN).then_some(Self { samples })
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.samples
    }

    pub fn lead(&self, index: usize) -> &[f32] {
        &self.samples[index * SAMPLES_PER_LEAD..(index + 1) * SAMPLES_PER_LEAD]
    }
}

#[derive(Debug, Clone)]
pub struct DecodedWaveform {
    /// Rate declared by the export, before resampling
    pub sample_rate: u32,
    pub signal: SignalBuffer,
}

pub fn declared_sample_rate(rhythm: &Element) -> Result<u32, StructuralError> {
    let raw = rhythm
        .child_text("SampleBase")
        .map(str::trim)
        .ok_or(StructuralError::MissingElement("SampleBase"))?;
    raw.parse::<u32>()
        .ok()
        .filter(|rate| ACCEPTED_SAMPLE_RATES.contains(rate))
        .ok_or_else(|| StructuralError::UnsupportedSampleRate(raw.to_string()))
}

/// Base64 text of 16-bit little-endian PCM to float samples. Embedded whitespace is ignored.
pub fn decode_lead_payload(lead: &str, payload: &str) -> Result<Vec<f32>, StructuralError> {
    let compact: String = payload.chars().filter(|c| !c.is_ascii_whitespace()).collect();
    let bytes = STANDARD
        .decode(compact.as_bytes())
        .map_err(|e| StructuralError::Payload {
            lead: lead.to_string(),
            message: e.to_string(),
        })?;
    if bytes.len() % 2 != 0 {
        return Err(StructuralError::Payload {
            lead: lead.to_string(),
            message: format!("odd byte count {}", bytes.len()),
        });
    }
    Ok(bytes
        .chunks_exact(2)
        .map(|pair| LittleEndian::read_i16(pair) as f32)
        .collect())
}

/// Double the sample count by linear interpolation.
///
/// Output sample `i` sits at source position `(i + 0.5) / 2 - 0.5`; positions
/// before the first or after the last input sample take that edge sample.
pub fn upsample_linear_2x(input: &[f32]) -> Vec<f32> {
    let n = input.len();
    if n == 0 {
        return Vec::new();
    }
    let last = n - 1;
    (0..n * 2)
        .map(|i| {
            let pos = ((i as f64 + 0.5) / 2.0 - 0.5).max(0.0);
            let lo = (pos.floor() as usize).min(last);
            let hi = (lo + 1).min(last);
            let frac = pos - lo as f64;
            let a = input[lo] as f64;
            let b = input[hi] as f64;
            (a + (b - a) * frac) as f32
        })
        .collect()
}

/// Decode the rhythm waveform of a record into the canonical signal buffer.
pub fn decode(record: &EcgRecord) -> Result<DecodedWaveform, StructuralError> {
    let rhythm = record.rhythm_waveform()?;
    let sample_rate = declared_sample_rate(rhythm)?;
    let expected_raw = SAMPLES_PER_LEAD * sample_rate as usize / CANONICAL_SAMPLE_RATE as usize;

    let lead_blocks: Vec<&Element> = rhythm.children_named("LeadData").collect();
    if lead_blocks.len() != LEAD_COUNT {
        return Err(StructuralError::LeadCount {
            expected: LEAD_COUNT,
            found: lead_blocks.len(),
        });
    }

    let mut by_id: HashMap<&str, &Element> = HashMap::with_capacity(LEAD_COUNT);
    for block in lead_blocks {
        if let Some(id) = block.child_text("LeadID") {
            by_id.insert(id.trim(), block);
        }
    }

    let mut samples = Vec::with_capacity(SIGNAL_LEN);
    for lead in LEAD_ORDER {
        let block = by_id.get(lead).ok_or(StructuralError::MissingLead(lead))?;
        let payload = block
            .child_text("WaveFormData")
            .ok_or(StructuralError::MissingLead(lead))?;
        let raw = decode_lead_payload(lead, payload)?;
        if raw.len() != expected_raw {
            return Err(StructuralError::SampleCount {
                lead: lead.to_string(),
                expected: expected_raw,
                found: raw.len(),
            });
        }
        if sample_rate < CANONICAL_SAMPLE_RATE {
            samples.extend(upsample_linear_2x(&raw));
        } else {
            samples.extend(raw);
        }
    }

    let signal = SignalBuffer::from_samples(samples).ok_or(StructuralError::SampleCount {
        lead: "all".to_string(),
        expected: SIGNAL_LEN,
        found: 0,
    })?;
    Ok(DecodedWaveform {
        sample_rate,
        signal,
    })
}

pub fn artifact_path(dir: &Path, euid: &str, puid: &str) -> PathBuf {
    dir.join(format!("{}_{}.bin", euid, puid))
}

/// Write the signal as little-endian f32 through a temp file and rename.
pub fn write_artifact(
    dir: &Path,
    euid: &str,
    puid: &str,
    signal: &SignalBuffer,
) -> io::Result<PathBuf> {
    fs::create_dir_all(dir)?;
    let path = artifact_path(dir, euid, puid);
    let tmp = path.with_extension("bin.tmp");
    {
        let mut writer = BufWriter::new(File::create(&tmp)?);
        for sample in signal.as_slice() {
            writer.write_f32::<LittleEndian>(*sample)?;
        }
        writer.flush()?;
    }
    fs::rename(&tmp, &path)?;
    Ok(path)
}

pub fn read_artifact(path: &Path) -> io::Result<SignalBuffer> {
    let mut reader = BufReader::new(File::open(path)?);
    let mut samples = vec![0.0f32; SIGNAL_LEN];
    reader.read_f32_into::<LittleEndian>(&mut samples)?;
    SignalBuffer::from_samples(samples)
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "bad signal length"))
}
