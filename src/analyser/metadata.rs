//! Run-level metadata: where configuration for a normalization run comes from.
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use std::io::Read;
use crate::error::{AnalysisError, Result};

pub const FILE_TYPE: &str = "ecnspider-qof-ipfix";

/// Metadata of one raw capture, optionally backed by its campaign's metadata.
#[derive(Clone, Debug, Default)]
pub struct RunMetadata {
    values: Map<String, Value>,
    parent: Option<Box<RunMetadata>>,
}

fn value_as_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

impl RunMetadata {
    pub fn from_reader<R: Read>(reader: R) -> Result<Self> {
        let value: Value =
            serde_json::from_reader(reader).map_err(|e| AnalysisError::MetadataRead(e.to_string()))?;
        match value {
            Value::Object(values) => Ok(Self { values, parent: None }),
            _ => Err(AnalysisError::MetadataRead("metadata is not a JSON object".to_string())),
        }
    }

    pub fn with_parent(mut self, parent: RunMetadata) -> Self {
        self.parent = Some(Box::new(parent));
        self
    }

    /// Looks up a key as a string, empty when absent.
    pub fn get(&self, key: &str, inherit: bool) -> String {
        match self.values.get(key) {
            Some(v) => value_as_string(v),
            None if inherit => self.parent.as_ref().map(|p| p.get(key, true)).unwrap_or_default(),
            None => String::new(),
        }
    }

    fn get_time(&self, key: &str) -> Option<DateTime<Utc>> {
        let raw = self.get(key, true);
        DateTime::parse_from_rfc3339(&raw).ok().map(|t| t.with_timezone(&Utc))
    }

    pub fn file_type(&self) -> String {
        self.get("_file_type", true)
    }

    pub fn owner(&self) -> String {
        self.get("_owner", true)
    }

    pub fn time_start(&self) -> Option<DateTime<Utc>> {
        self.get_time("_time_start")
    }

    pub fn time_end(&self) -> Option<DateTime<Utc>> {
        self.get_time("_time_end")
    }

    /// Fails unless the capture is of the one file type this analyzer reads.
    pub fn check_file_type(&self) -> Result<()> {
        let file_type = self.file_type();
        if file_type == FILE_TYPE {
            Ok(())
        } else {
            Err(AnalysisError::UnsupportedFileType(file_type))
        }
    }

    /// Non-underscore keys carried over verbatim into the output metadata.
    pub fn aux(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.values.iter().filter(|(k, _)| !k.starts_with('_'))
    }
}

/// Settings the correlator and path builder take from metadata.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RunConfig {
    pub source_override: Option<String>,
    pub source_prepend: Option<String>,
    pub required_dst_port: u16,
}

fn non_empty(s: String) -> Option<String> {
    if s.is_empty() { None } else { Some(s) }
}

impl RunConfig {
    pub fn from_metadata(md: &RunMetadata) -> Self {
        Self {
            source_override: non_empty(md.get("source_override", true)),
            source_prepend: non_empty(md.get("source_prepend", true)),
            required_dst_port: md.get("dst_port", true).trim().parse().unwrap_or(0),
        }
    }
}
