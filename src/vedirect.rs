//! Parser for the Victron VE.Direct text protocol (19200 baud, 8-N-1).
//!
//! Records are newline-delimited `key<TAB>value` pairs closed by a
//! `Checksum` field whose value makes the byte-wise running sum of the whole
//! record a multiple of 256. Lines starting with `:` are HEX-mode traffic and
//! are discarded. The parser is a pure byte-stream state machine: feed it one
//! byte at a time and it yields a typed record whenever one completes and
//! verifies.

use std::collections::BTreeMap;

use serde::Serialize;

/// A typed VE.Direct field value.
///
/// Serialized untagged, so a record publishes as a flat JSON object and
/// integer fields such as `PPV` stay bare numbers on the bus.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum FieldValue {
    Int(i64),
    Float(f64),
    Text(String),
}

/// One complete, checksum-verified record.
pub type Record = BTreeMap<String, FieldValue>;

/// Converts a raw field to its typed value.
///
/// Millivolt and milliamp fields scale to volts/amps, the 0.01-kWh counters
/// to kWh. Bitmask-ish fields accept a `0x` prefix. Unknown keys pass through
/// as text; a known key whose value fails to parse yields `None`.
fn convert(key: &str, raw: &str) -> Option<FieldValue> {
    let int = |raw: &str| raw.parse::<i64>().ok();
    // some firmware versions emit these fields in hex with a 0x prefix
    let int_base_guess = |raw: &str| match raw.strip_prefix("0x").or_else(|| raw.strip_prefix("0X"))
    {
        Some(hex) => i64::from_str_radix(hex, 16).ok(),
        None => raw.parse::<i64>().ok(),
    };
    match key {
        "V" | "V2" | "V3" | "VS" | "VM" | "VPV" | "I" | "I2" | "I3" | "IL" => {
            int(raw).map(|v| FieldValue::Float(v as f64 / 1000.0))
        }
        "H17" | "H18" | "H19" | "H20" | "H22" => {
            int(raw).map(|v| FieldValue::Float(v as f64 / 100.0))
        }
        "PPV" | "P" | "T" | "CE" | "SOC" | "TTG" | "H21" | "H23" | "HSDS" => {
            int(raw).map(FieldValue::Int)
        }
        "CS" | "ERR" | "MODE" | "AR" | "OR" | "WARN" | "MPPT" => {
            int_base_guess(raw).map(FieldValue::Int)
        }
        _ => Some(FieldValue::Text(raw.to_string())),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    WaitCr,
    WaitLf,
    InKey,
    InValue,
    InChecksum,
    Hex,
}

/// Streaming VE.Direct record parser.
#[derive(Debug)]
pub struct VeDirectParser {
    state: State,
    key: Vec<u8>,
    value: Vec<u8>,
    sum: u8,
    fields: BTreeMap<String, String>,
}

impl Default for VeDirectParser {
    fn default() -> Self {
        Self::new()
    }
}

impl VeDirectParser {
    pub fn new() -> Self {
        Self {
            state: State::WaitCr,
            key: Vec::new(),
            value: Vec::new(),
            sum: 0,
            fields: BTreeMap::new(),
        }
    }

    fn store_field(&mut self) {
        match (
            String::from_utf8(std::mem::take(&mut self.key)),
            String::from_utf8(std::mem::take(&mut self.value)),
        ) {
            (Ok(key), Ok(value)) => {
                self.fields.insert(key, value);
            }
            (key, value) => log::warn!("could not decode field {key:?}={value:?}"),
        }
    }

    fn finish_record(&mut self) -> Option<Record> {
        let checksum_ok = self.sum == 0;
        self.sum = 0;
        if !checksum_ok {
            log::debug!("malformed record dropped, {} fields", self.fields.len());
            self.fields.clear();
            return None;
        }
        let fields = std::mem::take(&mut self.fields);
        let mut record = Record::new();
        for (key, raw) in fields {
            match convert(&key, &raw) {
                Some(value) => {
                    record.insert(key, value);
                }
                None => log::warn!("unable to convert field {key}={raw}"),
            }
        }
        Some(record)
    }

    /// Accepts one byte; returns a record when a complete one verifies.
    pub fn feed(&mut self, byte: u8) -> Option<Record> {
        if byte == b':' && self.state != State::InChecksum {
            self.state = State::Hex;
        }
        match self.state {
            State::WaitCr => {
                if byte == b'\r' {
                    self.sum = self.sum.wrapping_add(byte);
                    self.state = State::WaitLf;
                }
                None
            }
            State::WaitLf => {
                if byte == b'\n' {
                    self.sum = self.sum.wrapping_add(byte);
                    self.state = State::InKey;
                }
                None
            }
            State::InKey => {
                self.sum = self.sum.wrapping_add(byte);
                if byte == b'\t' {
                    if self.key == b"Checksum" {
                        self.state = State::InChecksum;
                    } else {
                        self.state = State::InValue;
                    }
                } else {
                    self.key.push(byte);
                }
                None
            }
            State::InValue => {
                self.sum = self.sum.wrapping_add(byte);
                if byte == b'\r' {
                    self.state = State::WaitLf;
                    self.store_field();
                } else {
                    self.value.push(byte);
                }
                None
            }
            State::InChecksum => {
                self.sum = self.sum.wrapping_add(byte);
                self.key.clear();
                self.value.clear();
                self.state = State::WaitCr;
                self.finish_record()
            }
            State::Hex => {
                self.sum = 0;
                if byte == b'\n' {
                    self.state = State::WaitCr;
                }
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::running_sum;

    fn with_checksum(body: &str) -> Vec<u8> {
        let mut bytes = body.as_bytes().to_vec();
        let fix = 0u8.wrapping_sub(running_sum(&bytes));
        bytes.push(fix);
        bytes
    }

    fn feed_all(parser: &mut VeDirectParser, bytes: &[u8]) -> Vec<Record> {
        bytes.iter().filter_map(|b| parser.feed(*b)).collect()
    }

    #[test]
    fn parses_mppt_record() {
        let bytes = with_checksum(
            "\r\nPID\t0xA053\r\nV\t26400\r\nI\t-500\r\nVPV\t71200\r\nPPV\t130\r\nCS\t3\r\nERR\t0\r\nH20\t25\r\nChecksum\t",
        );
        let mut parser = VeDirectParser::new();
        let records = feed_all(&mut parser, &bytes);
        assert_eq!(records.len(), 1);
        let record = &records[0];
        assert_eq!(record["PPV"], FieldValue::Int(130));
        assert_eq!(record["V"], FieldValue::Float(26.4));
        assert_eq!(record["I"], FieldValue::Float(-0.5));
        assert_eq!(record["CS"], FieldValue::Int(3));
        assert_eq!(record["H20"], FieldValue::Float(0.25));
        assert_eq!(record["PID"], FieldValue::Text("0xA053".to_string()));
    }

    #[test]
    fn drops_record_with_bad_checksum() {
        let mut bytes = with_checksum("\r\nPPV\t130\r\nChecksum\t");
        let n = bytes.len();
        bytes[n - 1] = bytes[n - 1].wrapping_add(1);
        let mut parser = VeDirectParser::new();
        assert!(feed_all(&mut parser, &bytes).is_empty());
        // parser recovers for the next record
        let good = with_checksum("\r\nPPV\t131\r\nChecksum\t");
        let records = feed_all(&mut parser, &good);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0]["PPV"], FieldValue::Int(131));
    }

    #[test]
    fn hex_lines_are_discarded() {
        let mut parser = VeDirectParser::new();
        assert!(feed_all(&mut parser, b":A0002000148\n").is_empty());
        let bytes = with_checksum("\r\nPPV\t99\r\nChecksum\t");
        let records = feed_all(&mut parser, &bytes);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0]["PPV"], FieldValue::Int(99));
    }

    #[test]
    fn unknown_keys_pass_through_as_text() {
        let bytes = with_checksum("\r\nXYZ\tsomething\r\nChecksum\t");
        let mut parser = VeDirectParser::new();
        let records = feed_all(&mut parser, &bytes);
        assert_eq!(
            records[0]["XYZ"],
            FieldValue::Text("something".to_string())
        );
    }

    #[test]
    fn record_serializes_flat() {
        let bytes = with_checksum("\r\nPPV\t130\r\nV\t26400\r\nChecksum\t");
        let mut parser = VeDirectParser::new();
        let records = feed_all(&mut parser, &bytes);
        let json = serde_json::to_value(&records[0]).unwrap();
        assert_eq!(json["PPV"], serde_json::json!(130));
        assert_eq!(json["V"], serde_json::json!(26.4));
    }
}
