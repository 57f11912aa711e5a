use crate::constants::DEFAULT_SUB_BATCH_SIZE;
use crate::error::{IngestError, Result};
use serde::Deserialize;
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Deserialize)]
pub struct IngestConfig {
    #[serde(default)]
    pub run: RunConfig,
    pub identity: IdentityConfig,
    pub fields: FieldsConfig,
    pub stores: StoresConfig,
    pub output: OutputConfig,
    #[serde(default)]
    pub features: FeaturesConfig,
    #[serde(default)]
    pub sink: SinkConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RunConfig {
    #[serde(default = "default_sub_batch_size")]
    pub sub_batch_size: usize,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            sub_batch_size: DEFAULT_SUB_BATCH_SIZE,
        }
    }
}

fn default_sub_batch_size() -> usize {
    DEFAULT_SUB_BATCH_SIZE
}

#[derive(Debug, Clone, Deserialize)]
pub struct IdentityConfig {
    pub mapping_path: PathBuf,
    #[serde(default)]
    pub create_if_missing: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FieldsConfig {
    pub phi_fields: PathBuf,
    pub resting_measurements: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StoresConfig {
    pub decoder: PathBuf,
    pub features: PathBuf,
    pub measurements: PathBuf,
    pub statements: PathBuf,
    pub unparsable: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OutputConfig {
    pub signal_dir: PathBuf,
    #[serde(default)]
    pub deidentified_xml_dir: Option<PathBuf>,
    pub report_dir: PathBuf,
}

#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum KernelKind {
    #[default]
    Reference,
    Parallel,
    Native,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct FeaturesConfig {
    #[serde(default)]
    pub kernel: KernelKind,
    #[serde(default)]
    pub native_library: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SinkKind {
    #[default]
    None,
    Ndjson,
    Http,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SinkConfig {
    #[serde(default)]
    pub kind: SinkKind,
    #[serde(default)]
    pub path: Option<PathBuf>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for SinkConfig {
    fn default() -> Self {
        Self {
            kind: SinkKind::None,
            path: None,
            url: None,
            timeout_secs: default_timeout_secs(),
        }
    }
}

fn default_timeout_secs() -> u64 {
    30
}

impl IngestConfig {
    /// Load a config file; relative paths inside it resolve against its directory.
    pub fn load<P: AsRef<Path>>(config_path: P) -> Result<Self> {
        let config_path = config_path.as_ref();
        let config_content = fs::read_to_string(config_path).map_err(|e| {
            IngestError::Config(format!(
                "Failed to read config file '{}': {}",
                config_path.display(),
                e
            ))
        })?;

        let mut config = Self::from_toml_str(&config_content)?;
        if let Some(base) = config_path.parent() {
            config.resolve_relative_to(base);
        }
        Ok(config)
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: IngestConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.run.sub_batch_size == 0 {
            return Err(IngestError::Config(
                "run.sub_batch_size must be at least 1".to_string(),
            ));
        }
        if self.features.kernel == KernelKind::Native && self.features.native_library.is_none() {
            return Err(IngestError::Config(
                "features.native_library is required for the native kernel".to_string(),
            ));
        }
        match self.sink.kind {
            SinkKind::Ndjson if self.sink.path.is_none() => Err(IngestError::Config(
                "sink.path is required for the ndjson sink".to_string(),
            )),
            SinkKind::Http if self.sink.url.is_none() => Err(IngestError::Config(
                "sink.url is required for the http sink".to_string(),
            )),
            _ => Ok(()),
        }
    }

    fn resolve_relative_to(&mut self, base: &Path) {
        let resolve = |p: &mut PathBuf| {
            if p.is_relative() {
                *p = base.join(&*p);
            }
        };
        resolve(&mut self.identity.mapping_path);
        resolve(&mut self.fields.phi_fields);
        resolve(&mut self.fields.resting_measurements);
        resolve(&mut self.stores.decoder);
        resolve(&mut self.stores.features);
        resolve(&mut self.stores.measurements);
        resolve(&mut self.stores.statements);
        resolve(&mut self.stores.unparsable);
        resolve(&mut self.output.signal_dir);
        resolve(&mut self.output.report_dir);
        if let Some(dir) = self.output.deidentified_xml_dir.as_mut() {
            resolve(dir);
        }
        if let Some(lib) = self.features.native_library.as_mut() {
            resolve(lib);
        }
        if let Some(path) = self.sink.path.as_mut() {
            resolve(path);
        }
    }
}

/// Read an ordered field-name list: one name per line, `#` comments and blank lines skipped.
pub fn load_field_list<P: AsRef<Path>>(path: P) -> Result<Vec<String>> {
    let path = path.as_ref();
    let content = fs::read_to_string(path).map_err(|e| {
        IngestError::Config(format!(
            "Failed to read field list '{}': {}",
            path.display(),
            e
        ))
    })?;
    parse_field_list(&content)
        .map_err(|reason| IngestError::Config(format!("{}: {}", path.display(), reason)))
}

pub fn parse_field_list(content: &str) -> std::result::Result<Vec<String>, String> {
    let mut seen = HashSet::new();
    let mut fields = Vec::new();
    for raw in content.lines() {
        let name = raw.trim();
        if name.is_empty() || name.starts_with('#') {
            continue;
        }
        if !is_identifier(name) {
            return Err(format!("'{}' is not a valid field name", name));
        }
        if !seen.insert(name.to_string()) {
            return Err(format!("'{}' is listed twice", name));
        }
        fields.push(name.to_string());
    }
    Ok(fields)
}

/// Field names become SQL column names, so only plain identifiers are allowed.
pub fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
        [identity]
        mapping_path = "patients.csv"

        [fields]
        phi_fields = "idtags.txt"
        resting_measurements = "measurements.txt"

        [stores]
        decoder = "decoder.db"
        features = "features.db"
        measurements = "measurements.db"
        statements = "statements.db"
        unparsable = "unparsable.db"

        [output]
        signal_dir = "signals"
        report_dir = "reports"
    "#;

    #[test]
    fn test_defaults_applied() {
        let config = IngestConfig::from_toml_str(MINIMAL).unwrap();
        assert_eq!(config.run.sub_batch_size, DEFAULT_SUB_BATCH_SIZE);
        assert!(!config.identity.create_if_missing);
        assert_eq!(config.features.kernel, KernelKind::Reference);
        assert_eq!(config.sink.kind, SinkKind::None);
        assert!(config.output.deidentified_xml_dir.is_none());
    }

    #[test]
    fn test_zero_sub_batch_rejected() {
        let content = format!("[run]\nsub_batch_size = 0\n{}", MINIMAL);
        assert!(matches!(
            IngestConfig::from_toml_str(&content),
            Err(IngestError::Config(_))
        ));
    }

    #[test]
    fn test_native_kernel_requires_library() {
        let content = format!("{}\n[features]\nkernel = \"native\"\n", MINIMAL);
        assert!(IngestConfig::from_toml_str(&content).is_err());
    }

    #[test]
    fn test_relative_paths_resolved() {
        let mut config = IngestConfig::from_toml_str(MINIMAL).unwrap();
        config.resolve_relative_to(Path::new("/data/run"));
        assert_eq!(config.stores.decoder, PathBuf::from("/data/run/decoder.db"));
        assert_eq!(config.output.signal_dir, PathBuf::from("/data/run/signals"));
    }

    #[test]
    fn test_field_list_parsing() {
        let fields = parse_field_list("# PHI\nPatientLastName\n\n  DateofBirth \n").unwrap();
        assert_eq!(fields, vec!["PatientLastName", "DateofBirth"]);

        assert!(parse_field_list("PatientAge\nPatientAge\n").is_err());
        assert!(parse_field_list("Patient Age\n").is_err());
        assert!(parse_field_list("x; DROP TABLE Decoder\n").is_err());
    }
}
