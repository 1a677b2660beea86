use serde_json::{Map, Value};

/// Fields that the CSV log knows about, in column order (timestamp aside).
pub const RECOGNISED_FIELDS: [&str; 6] = ["bpm", "spo2", "steps", "fall", "lat", "lng"];

pub const TIMESTAMP_FIELD: &str = "timestamp";

/// One decoded telemetry frame. Field order is not preserved; unknown
/// fields are kept as-is.
#[derive(Clone, Debug, PartialEq)]
pub struct TelemetryRecord {
    fields: Map<String, Value>,
}

impl TelemetryRecord {
    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields.get(field)
    }

    pub fn fields(&self) -> &Map<String, Value> {
        &self.fields
    }

    /// Sets (or replaces, if the device sent its own) the timestamp field.
    pub fn set_timestamp(&mut self, timestamp: String) {
        self.fields
            .insert(TIMESTAMP_FIELD.to_string(), Value::String(timestamp));
    }

    /// Fields that aren't part of the CSV column set.
    pub fn unrecognised_fields(&self) -> impl Iterator<Item = &str> {
        self.fields
            .keys()
            .map(|key| key.as_str())
            .filter(|key| *key != TIMESTAMP_FIELD && !RECOGNISED_FIELDS.contains(key))
    }
}

impl std::fmt::Display for TelemetryRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Value's Display is compact JSON.
        write!(f, "{}", Value::Object(self.fields.clone()))
    }
}

/// DecodeWarning describes a frame we couldn't use. It is never fatal.
#[derive(Debug)]
pub struct DecodeWarning {
    pub received_line: String,
    pub reason: String,
}

impl PartialEq for DecodeWarning {
    fn eq(&self, other: &Self) -> bool {
        self.received_line == other.received_line
    }
}

impl Eq for DecodeWarning {}

impl std::fmt::Display for DecodeWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Invalid JSON: {} ({})", self.received_line, self.reason)
    }
}

impl std::error::Error for DecodeWarning {}

/// Converts raw line bytes to text: invalid UTF-8 sequences are dropped (not
/// fatal), and the line terminator plus any surrounding whitespace is
/// stripped.
pub fn line_to_text(raw: &[u8]) -> String {
    let mut text = String::with_capacity(raw.len());
    let mut rest = raw;
    loop {
        match std::str::from_utf8(rest) {
            Ok(valid) => {
                text.push_str(valid);
                break;
            }
            Err(e) => {
                let (valid, invalid) = rest.split_at(e.valid_up_to());
                // Everything before valid_up_to() is UTF-8 by definition.
                text.push_str(std::str::from_utf8(valid).unwrap_or_default());
                // error_len() is None for a sequence truncated by the end of
                // the line, in which case the remainder is all garbage.
                let skip = e.error_len().unwrap_or(invalid.len());
                rest = &invalid[skip..];
            }
        }
    }
    text.trim().to_string()
}

/// Decodes one frame, which must be a single JSON object.
pub fn decode_frame(line: &str) -> Result<TelemetryRecord, DecodeWarning> {
    match serde_json::from_str::<Value>(line) {
        Ok(Value::Object(fields)) => Ok(TelemetryRecord { fields }),
        Ok(other) => Err(DecodeWarning {
            received_line: line.to_string(),
            reason: format!("expected a JSON object, got {}", json_type_name(&other)),
        }),
        Err(e) => Err(DecodeWarning {
            received_line: line.to_string(),
            reason: e.to_string(),
        }),
    }
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
