//! Helpers at the boundary with the flow-record decoder.
//!
//! The decoder emits one JSON object per flow, keyed by information-element
//! name. Only the fields in [FIELD_TYPES] survive; everything else is dropped.
use chrono::{DateTime, TimeZone, Utc};
use lazy_static::lazy_static;
use serde_json::Value;
use std::collections::HashMap;
use std::io::BufRead;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use super::containers::*;
use crate::error::{AnalysisError, Result};

/// Declared information-element types for the fields we extract.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FieldType {
    Unsigned8,
    Unsigned16,
    Unsigned32,
    DateTimeMilliseconds,
    Ipv4Address,
    Ipv6Address,
}

lazy_static! {
    pub static ref FIELD_TYPES: HashMap<&'static str, FieldType> = {
        let mut m = HashMap::new();
        m.insert(INITIAL_TCP_FLAGS, FieldType::Unsigned8);
        m.insert(LAST_SYN_TCP_FLAGS, FieldType::Unsigned8);
        m.insert(REVERSE_LAST_SYN_TCP_FLAGS, FieldType::Unsigned8);
        m.insert(REVERSE_QOF_TCP_CHARACTERISTICS, FieldType::Unsigned32);
        m.insert(FLOW_START_MILLISECONDS, FieldType::DateTimeMilliseconds);
        m.insert(SOURCE_TRANSPORT_PORT, FieldType::Unsigned16);
        m.insert(DESTINATION_TRANSPORT_PORT, FieldType::Unsigned16);
        m.insert(SOURCE_IPV4_ADDRESS, FieldType::Ipv4Address);
        m.insert(SOURCE_IPV6_ADDRESS, FieldType::Ipv6Address);
        m.insert(DESTINATION_IPV4_ADDRESS, FieldType::Ipv4Address);
        m.insert(DESTINATION_IPV6_ADDRESS, FieldType::Ipv6Address);
        m
    };
}

fn unsigned(value: &Value, max: u64) -> Option<u64> {
    value.as_u64().filter(|v| *v <= max)
}

fn date_time(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::Number(n) => n.as_i64().and_then(|ms| Utc.timestamp_millis_opt(ms).single()),
        Value::String(s) => DateTime::parse_from_rfc3339(s).ok().map(|t| t.with_timezone(&Utc)),
        _ => None,
    }
}

/// Interprets a JSON value as the declared field type.
pub fn interpret(field_type: FieldType, value: &Value) -> Option<FieldValue> {
    match field_type {
        FieldType::Unsigned8 => unsigned(value, u8::MAX as u64).map(|v| FieldValue::Unsigned8(v as u8)),
        FieldType::Unsigned16 => unsigned(value, u16::MAX as u64).map(|v| FieldValue::Unsigned16(v as u16)),
        FieldType::Unsigned32 => unsigned(value, u32::MAX as u64).map(|v| FieldValue::Unsigned32(v as u32)),
        FieldType::DateTimeMilliseconds => date_time(value).map(FieldValue::DateTime),
        FieldType::Ipv4Address => value
            .as_str()
            .and_then(|s| s.parse::<Ipv4Addr>().ok())
            .map(|a| FieldValue::Address(IpAddr::V4(a))),
        FieldType::Ipv6Address => value
            .as_str()
            .and_then(|s| s.parse::<Ipv6Addr>().ok())
            .map(|a| FieldValue::Address(IpAddr::V6(a))),
    }
}

/// Turns one decoded record into a [FieldMap], keeping only dictionary fields.
pub fn interpret_record(line: &str, line_no: usize) -> Result<FieldMap> {
    let decode_err = |reason: String| AnalysisError::DecodeStream { line: line_no, reason };

    let record: Value = serde_json::from_str(line).map_err(|e| decode_err(e.to_string()))?;
    let object = record
        .as_object()
        .ok_or_else(|| decode_err("record is not a JSON object".to_string()))?;

    let mut fields = FieldMap::new();
    for (name, value) in object {
        if let Some(field_type) = FIELD_TYPES.get(name.as_str()) {
            let typed = interpret(*field_type, value)
                .ok_or_else(|| decode_err(format!("{name} is not a valid {field_type:?}")))?;
            fields.insert(name.clone(), typed);
        }
    }

    Ok(fields)
}

/// Iterates over the decoded records of a stream, skipping blank lines.
///
/// A record that cannot be decoded ends the stream with an error.
pub struct RecordReader<R> {
    input: R,
    line_no: usize,
    buf: String,
}

impl<R: BufRead> RecordReader<R> {
    pub fn new(input: R) -> Self {
        Self { input, line_no: 0, buf: String::new() }
    }
}

impl<R: BufRead> Iterator for RecordReader<R> {
    type Item = Result<FieldMap>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            self.buf.clear();
            match self.input.read_line(&mut self.buf) {
                Ok(0) => return None,
                Ok(_) => {
                    self.line_no += 1;
                    let line = self.buf.trim();
                    if line.is_empty() {
                        continue;
                    }
                    return Some(interpret_record(line, self.line_no));
                }
                Err(e) => return Some(Err(AnalysisError::Io(e))),
            }
        }
    }
}
