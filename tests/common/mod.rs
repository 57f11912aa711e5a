//! Builder for synthetic MUSE-style resting ECG exports.
//!
//! Shared by the integration tests and, through `#[path]`, the unit tests, so
//! it depends on nothing from the crate itself.
#![allow(dead_code)]

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use std::collections::{HashMap, HashSet};
use std::fmt::Write as _;
use std::path::{Path, PathBuf};

pub const FIXTURE_LEADS: [&str; 8] = ["I", "II", "V1", "V2", "V3", "V4", "V5", "V6"];

/// Deterministic integer waveform, distinct per lead.
pub fn synthetic_samples(lead_index: usize, count: usize) -> Vec<i16> {
    (0..count)
        .map(|k| (((k * (lead_index + 1) * 7) % 401) as i32 - 200) as i16)
        .collect()
}

pub fn encode_samples(samples: &[i16]) -> String {
    let mut bytes = Vec::with_capacity(samples.len() * 2);
    for s in samples {
        bytes.extend_from_slice(&s.to_le_bytes());
    }
    STANDARD.encode(bytes)
}

#[derive(Debug, Clone)]
pub struct EcgFixture {
    patient_id: String,
    last_name: String,
    date: String,
    time: String,
    sample_rate: String,
    age: String,
    low_pass: String,
    site: String,
    rhythm: bool,
    wrap_payload: bool,
    omitted: HashSet<String>,
    dropped_leads: HashSet<String>,
    extra_leads: Vec<String>,
    lead_overrides: HashMap<String, Vec<i16>>,
}

impl EcgFixture {
    pub fn new(patient_id: &str) -> Self {
        Self {
            patient_id: patient_id.to_string(),
            last_name: "DOE".to_string(),
            date: "03-15-2019".to_string(),
            time: "12:02:32".to_string(),
            sample_rate: "500".to_string(),
            age: "67".to_string(),
            low_pass: "40".to_string(),
            site: "MAIN CAMPUS".to_string(),
            rhythm: true,
            wrap_payload: false,
            omitted: HashSet::new(),
            dropped_leads: HashSet::new(),
            extra_leads: Vec::new(),
            lead_overrides: HashMap::new(),
        }
    }

    pub fn acquired(mut self, date: &str, time: &str) -> Self {
        self.date = date.to_string();
        self.time = time.to_string();
        self
    }

    pub fn last_name(mut self, name: &str) -> Self {
        self.last_name = name.to_string();
        self
    }

    pub fn sample_rate(mut self, rate: &str) -> Self {
        self.sample_rate = rate.to_string();
        self
    }

    pub fn age(mut self, age: &str) -> Self {
        self.age = age.to_string();
        self
    }

    pub fn low_pass(mut self, value: &str) -> Self {
        self.low_pass = value.to_string();
        self
    }

    pub fn site(mut self, site: &str) -> Self {
        self.site = site.to_string();
        self
    }

    pub fn without_element(mut self, name: &str) -> Self {
        self.omitted.insert(name.to_string());
        self
    }

    pub fn without_rhythm(mut self) -> Self {
        self.rhythm = false;
        self
    }

    pub fn wrapped_payload(mut self) -> Self {
        self.wrap_payload = true;
        self
    }

    pub fn drop_lead(mut self, lead: &str) -> Self {
        self.dropped_leads.insert(lead.to_string());
        self
    }

    pub fn extra_lead(mut self, lead: &str) -> Self {
        self.extra_leads.push(lead.to_string());
        self
    }

    pub fn lead_samples(mut self, lead: &str, samples: Vec<i16>) -> Self {
        self.lead_overrides.insert(lead.to_string(), samples);
        self
    }

    fn samples_per_lead(&self) -> usize {
        self.sample_rate.parse::<usize>().map(|r| r * 10).unwrap_or(5000)
    }

    fn leaf(&self, out: &mut String, name: &str, value: &str) {
        if !self.omitted.contains(name) {
            let _ = write!(out, "<{name}>{value}</{name}>");
        }
    }

    fn lead_block(&self, out: &mut String, lead: &str, samples: &[i16]) {
        let mut payload = encode_samples(samples);
        if self.wrap_payload && payload.len() > 76 {
            payload.insert(76, '\n');
        }
        out.push_str("<LeadData>");
        self.leaf(out, "LeadByteCountTotal", &(samples.len() * 2).to_string());
        self.leaf(out, "LeadSampleCountTotal", &samples.len().to_string());
        self.leaf(out, "LeadAmplitudeUnitsPerBit", "4.88");
        self.leaf(out, "LeadAmplitudeUnits", "MICROVOLTS");
        self.leaf(out, "LeadID", lead);
        self.leaf(out, "WaveFormData", &payload);
        out.push_str("</LeadData>");
    }

    pub fn to_xml(&self) -> String {
        let mut s = String::new();
        s.push_str("<?xml version=\"1.0\" encoding=\"ISO-8859-1\"?>\n");
        s.push_str("<!DOCTYPE RestingECG SYSTEM \"restecg.dtd\">\n<RestingECG>");
        s.push_str("<MuseInfo><MuseVersion>8.0.2.10132</MuseVersion></MuseInfo>");

        s.push_str("<PatientDemographics>");
        self.leaf(&mut s, "PatientID", &self.patient_id);
        self.leaf(&mut s, "PatientAge", &self.age);
        self.leaf(&mut s, "AgeUnits", "YEARS");
        self.leaf(&mut s, "DateofBirth", "01-02-1952");
        self.leaf(&mut s, "Gender", "MALE");
        self.leaf(&mut s, "PatientLastName", &self.last_name);
        self.leaf(&mut s, "PatientFirstName", "JOHN");
        s.push_str("</PatientDemographics>");

        s.push_str("<TestDemographics>");
        self.leaf(&mut s, "DataType", "RESTING");
        self.leaf(&mut s, "SiteName", &self.site);
        self.leaf(&mut s, "LocationName", "CARDIOLOGY");
        self.leaf(&mut s, "AcquisitionTime", &self.time);
        self.leaf(&mut s, "AcquisitionDate", &self.date);
        s.push_str("</TestDemographics>");

        s.push_str("<Order>");
        self.leaf(&mut s, "ReasonForTest", "CHEST PAIN");
        s.push_str("</Order>");

        s.push_str("<RestingECGMeasurements>");
        self.leaf(&mut s, "VentricularRate", "72");
        self.leaf(&mut s, "AtrialRate", "72");
        self.leaf(&mut s, "PRInterval", "160");
        self.leaf(&mut s, "QRSDuration", "88");
        self.leaf(&mut s, "QTInterval", "380");
        self.leaf(&mut s, "QTCorrected", "416");
        s.push_str("</RestingECGMeasurements>");

        if !self.omitted.contains("Diagnosis") {
            s.push_str("<Diagnosis><Modality>RESTING</Modality>");
            s.push_str("<DiagnosisStatement><StmtFlag>ENDSLINE</StmtFlag><StmtText>Normal sinus rhythm</StmtText></DiagnosisStatement>");
            s.push_str("<DiagnosisStatement><StmtText>Normal ECG</StmtText></DiagnosisStatement>");
            s.push_str("</Diagnosis>");
        }
        if !self.omitted.contains("OriginalDiagnosis") {
            s.push_str("<OriginalDiagnosis>");
            s.push_str("<DiagnosisStatement><StmtFlag>ENDSLINE</StmtFlag><StmtText>Sinus rhythm</StmtText></DiagnosisStatement>");
            s.push_str("</OriginalDiagnosis>");
        }
        if !self.omitted.contains("ExtraQuestions") {
            s.push_str("<ExtraQuestions><Question1>Smoker</Question1><Answer1>NO</Answer1></ExtraQuestions>");
        }

        s.push_str("<QRSTimesTypes>");
        for (n, time) in [409, 1243, 2077].iter().enumerate() {
            let _ = write!(
                s,
                "<QRS><Number>{}</Number><Type>0</Type><Time>{}</Time></QRS>",
                n + 1,
                time
            );
        }
        self.leaf(&mut s, "GlobalRR", "833");
        self.leaf(&mut s, "QTRGGR", "455");
        s.push_str("</QRSTimesTypes>");

        // Median beat
        s.push_str("<Waveform><WaveformType>Median</WaveformType><SampleBase>500</SampleBase>");
        self.lead_block(&mut s, "I", &synthetic_samples(0, 600));
        s.push_str("</Waveform>");

        if self.rhythm {
            let n = self.samples_per_lead();
            s.push_str("<Waveform><WaveformType>Rhythm</WaveformType>");
            self.leaf(&mut s, "NumberofLeads", "8");
            self.leaf(&mut s, "SampleBase", &self.sample_rate);
            self.leaf(&mut s, "SampleExponent", "0");
            self.leaf(&mut s, "HighPassFilter", "16");
            self.leaf(&mut s, "LowPassFilter", &self.low_pass);
            self.leaf(&mut s, "ACFilter", "60");
            for (i, lead) in FIXTURE_LEADS.iter().enumerate() {
                if self.dropped_leads.contains(*lead) {
                    continue;
                }
                let samples = self
                    .lead_overrides
                    .get(*lead)
                    .cloned()
                    .unwrap_or_else(|| synthetic_samples(i, n));
                self.lead_block(&mut s, lead, &samples);
            }
            for (i, lead) in self.extra_leads.iter().enumerate() {
                self.lead_block(&mut s, lead, &synthetic_samples(8 + i, n));
            }
            s.push_str("</Waveform>");
        }

        s.push_str("</RestingECG>\n");
        s
    }

    /// The document encoded as its declaration says, ISO-8859-1.
    /// Characters outside Latin-1 become `?`.
    pub fn to_latin1_bytes(&self) -> Vec<u8> {
        self.to_xml()
            .chars()
            .map(|c| u8::try_from(u32::from(c)).unwrap_or(b'?'))
            .collect()
    }

    pub fn write_to(&self, dir: &Path, filename: &str) -> std::io::Result<PathBuf> {
        let path = dir.join(filename);
        std::fs::write(&path, self.to_latin1_bytes())?;
        Ok(path)
    }
}
