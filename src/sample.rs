//! Continuous-read samples.
//!
//! While streaming, the meter pushes one `0E <text>` packet per second. The
//! text is a `;` separated list of `NAME:VALUE` pairs, for example
//! `DR:0.15uSv/h;D:1.63uSv;CPS:2;CPM:41;...`. Fields are kept by name in the
//! order the meter sent them, and each value is split into a number and a
//! unit suffix when it has one.

use crate::error::{Error, Result};
use crate::protocol::Opcode;
use chrono::{DateTime, Local};
use regex::Regex;
use serde::ser::{Serialize, SerializeMap, Serializer};
use std::fmt;
use std::sync::LazyLock;
use tracing::trace;

/// Instantaneous dose rate.
pub const FIELD_RATE: &str = "DR";
/// Accumulated dose.
pub const FIELD_DOSE: &str = "D";
/// Counts per second.
pub const FIELD_CPS: &str = "CPS";
/// Counts per minute.
pub const FIELD_CPM: &str = "CPM";

/// Timestamp format used in text and JSON output.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S";

static VALUE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^([-+]?(?:\d+\.?\d*|\.\d+))\s*(.*)$").expect("static regex is valid")
});

/// One `NAME:VALUE` pair.
#[derive(Debug, Clone, PartialEq)]
pub struct Field {
    pub name: String,
    /// Value exactly as sent, e.g. `0.15uSv/h`.
    pub raw: String,
    /// Leading number of the value, if it has one.
    pub value: Option<f64>,
    /// Whatever follows the number, e.g. `uSv/h`. Empty for plain counts.
    pub unit: String,
}

impl Field {
    fn parse(name: &str, raw: &str) -> Self {
        let raw = raw.trim();
        let (value, unit) = match VALUE_RE.captures(raw) {
            Some(caps) => (
                caps.get(1).and_then(|m| m.as_str().parse::<f64>().ok()),
                caps.get(2).map(|m| m.as_str().trim().to_string()).unwrap_or_default(),
            ),
            None => (None, String::new()),
        };
        Self {
            name: name.trim().to_string(),
            raw: raw.to_string(),
            value,
            unit,
        }
    }
}

/// A live reading, stamped with the time it was received.
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    pub captured_at: DateTime<Local>,
    pub fields: Vec<Field>,
}

impl Sample {
    /// Decode a continuous-read payload, opcode byte included.
    pub fn parse(payload: &[u8], captured_at: DateTime<Local>) -> Result<Self> {
        let (&opcode, text) = payload
            .split_first()
            .ok_or_else(|| Error::Protocol("empty sample payload".to_string()))?;
        if opcode != Opcode::ContinuousRead.byte() {
            return Err(Error::Protocol(format!(
                "unexpected datum marker {opcode:#04x}, expected {:#04x}",
                Opcode::ContinuousRead.byte()
            )));
        }
        let text = std::str::from_utf8(text)
            .map_err(|e| Error::Protocol(format!("sample text is not valid UTF-8: {e}")))?;
        Ok(Self::from_text(text, captured_at))
    }

    /// Build a sample from the text part of a datum.
    pub fn from_text(text: &str, captured_at: DateTime<Local>) -> Self {
        let text = text.trim_matches(|c: char| c == '\0' || c.is_whitespace());
        let mut fields = Vec::new();
        for part in text.split(';').filter(|p| !p.trim().is_empty()) {
            match part.split_once(':') {
                Some((name, raw)) => fields.push(Field::parse(name, raw)),
                None => trace!(part, "Ignoring sample segment without a name"),
            }
        }
        Self { captured_at, fields }
    }

    pub fn get(&self, name: &str) -> Option<&Field> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// Numeric part of a field.
    pub fn value(&self, name: &str) -> Option<f64> {
        self.get(name).and_then(|f| f.value)
    }

    pub fn dose_rate(&self) -> Option<&Field> {
        self.get(FIELD_RATE)
    }

    pub fn dose(&self) -> Option<&Field> {
        self.get(FIELD_DOSE)
    }

    pub fn timestamp(&self) -> String {
        self.captured_at.format(TIMESTAMP_FORMAT).to_string()
    }
}

/// `timestamp;NAME:VALUE;...`, the layout the meter's own logger writes.
impl fmt::Display for Sample {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.timestamp())?;
        for field in &self.fields {
            write!(f, ";{}:{}", field.name, field.raw)?;
        }
        Ok(())
    }
}

/// Flat object: `{"timestamp": "...", "DR": "0.15uSv/h", ...}`.
impl Serialize for Sample {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.fields.len() + 1))?;
        map.serialize_entry("timestamp", &self.timestamp())?;
        for field in &self.fields {
            map.serialize_entry(&field.name, &field.raw)?;
        }
        map.end()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at() -> DateTime<Local> {
        Local.with_ymd_and_hms(2025, 8, 13, 14, 22, 10).unwrap()
    }

    #[test]
    fn parses_named_fields() {
        let payload = b"\x0eDR:0.15uSv/h;D:1.63uSv;CPS:2;CPM:41;";
        let sample = Sample::parse(payload, at()).unwrap();
        assert_eq!(sample.fields.len(), 4);
        let rate = sample.dose_rate().unwrap();
        assert_eq!(rate.value, Some(0.15));
        assert_eq!(rate.unit, "uSv/h");
        assert_eq!(sample.value(FIELD_CPM), Some(41.0));
        assert_eq!(sample.get(FIELD_CPS).unwrap().unit, "");
        assert_eq!(sample.dose().unwrap().raw, "1.63uSv");
    }

    #[test]
    fn keeps_non_numeric_values() {
        let sample = Sample::from_text("AL:OFF;T:00:10:00", at());
        let alarm = sample.get("AL").unwrap();
        assert_eq!(alarm.value, None);
        assert_eq!(alarm.raw, "OFF");
        // Only the first colon separates the name.
        assert_eq!(sample.get("T").unwrap().raw, "00:10:00");
    }

    #[test]
    fn rejects_wrong_marker() {
        assert!(matches!(Sample::parse(b"\x07DR:1", at()), Err(Error::Protocol(_))));
        assert!(matches!(Sample::parse(b"", at()), Err(Error::Protocol(_))));
    }

    #[test]
    fn rejects_binary_garbage() {
        assert!(matches!(Sample::parse(&[0x0E, 0xFF, 0xFE], at()), Err(Error::Protocol(_))));
    }

    #[test]
    fn strips_padding() {
        let sample = Sample::from_text("DR:0.10uSv/h;\0\0\r\n", at());
        assert_eq!(sample.fields.len(), 1);
    }

    #[test]
    fn display_and_json_forms() {
        let sample = Sample::from_text("DR:0.15uSv/h;D:1.63uSv", at());
        assert_eq!(sample.to_string(), "2025-08-13T14:22:10;DR:0.15uSv/h;D:1.63uSv");
        let json = serde_json::to_value(&sample).unwrap();
        assert_eq!(json["timestamp"], "2025-08-13T14:22:10");
        assert_eq!(json["DR"], "0.15uSv/h");
        assert_eq!(json["D"], "1.63uSv");
    }
}
