//! Core types for the CAN CSV decoder
//!
//! This module defines the records that flow through a decode job: raw frames
//! as read from a capture, decoded rows as handed to the output writer, and
//! the error taxonomy shared by every stage.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Result type for decoder operations
pub type Result<T> = std::result::Result<T, DecoderError>;

/// Maximum payload length of a classic CAN frame
pub const MAX_PAYLOAD_BYTES: usize = 8;

/// Physical CAN bus a frame was captured on
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Channel {
    #[serde(rename = "can0", alias = "CAN0")]
    Can0,
    #[serde(rename = "can1", alias = "CAN1")]
    Can1,
}

impl Channel {
    /// Both buses, in tie-break order (CAN0 before CAN1)
    pub const ALL: [Channel; 2] = [Channel::Can0, Channel::Can1];

    /// Lowercase tag used in output file names
    pub fn file_tag(self) -> &'static str {
        match self {
            Channel::Can0 => "can0",
            Channel::Can1 => "can1",
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Channel::Can0 => write!(f, "CAN0"),
            Channel::Can1 => write!(f, "CAN1"),
        }
    }
}

/// Returned when a channel label is neither CAN0 nor CAN1
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown channel '{0}'")]
pub struct ParseChannelError(pub String);

impl FromStr for Channel {
    type Err = ParseChannelError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "can0" | "ch0" | "0" => Ok(Channel::Can0),
            "can1" | "ch1" | "1" => Ok(Channel::Can1),
            _ => Err(ParseChannelError(s.trim().to_string())),
        }
    }
}

/// One raw CAN frame as recorded in the input capture
#[derive(Debug, Clone, PartialEq)]
pub struct RawFrameRecord {
    /// 1-based line in the source file (for diagnostics)
    pub line: u64,
    /// Capture timestamp in seconds
    pub timestamp: f64,
    pub channel: Channel,
    /// 11-bit or 29-bit arbitration id
    pub message_id: u32,
    /// Payload bytes, exact length as recorded (0..=8)
    pub payload: Vec<u8>,
}

/// Decoded signal value
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SignalValue {
    /// Unscaled integer value
    Integer(i64),
    /// Scaled or IEEE-754 value
    Float(f64),
    /// Single-bit flag
    Boolean(bool),
}

impl SignalValue {
    /// Convert the value to f64
    pub fn as_f64(&self) -> f64 {
        match self {
            SignalValue::Integer(v) => *v as f64,
            SignalValue::Float(v) => *v,
            SignalValue::Boolean(v) => {
                if *v {
                    1.0
                } else {
                    0.0
                }
            }
        }
    }

    /// Check if the value is non-zero
    pub fn as_bool(&self) -> bool {
        match self {
            SignalValue::Boolean(v) => *v,
            SignalValue::Integer(v) => *v != 0,
            SignalValue::Float(v) => *v != 0.0,
        }
    }
}

/// Formats the value as a CSV cell. Booleans are written as 1/0 so that
/// spreadsheets can plot them next to numeric columns.
impl fmt::Display for SignalValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SignalValue::Integer(v) => write!(f, "{}", v),
            SignalValue::Float(v) => write!(f, "{}", v),
            SignalValue::Boolean(v) => write!(f, "{}", u8::from(*v)),
        }
    }
}

/// One decoded frame, ready for the output writer
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedRow {
    pub timestamp: f64,
    pub channel: Channel,
    pub message_id: u32,
    /// (column name, value) in signal-table declaration order
    pub values: Vec<(String, SignalValue)>,
}

impl DecodedRow {
    /// Look up a decoded value by column name
    pub fn get(&self, name: &str) -> Option<SignalValue> {
        self.values
            .iter()
            .find(|(column, _)| column == name)
            .map(|(_, value)| *value)
    }
}

/// Errors that can occur while decoding a capture
#[derive(Debug, thiserror::Error)]
pub enum DecoderError {
    #[error("Malformed input at line {line}: {reason}")]
    MalformedInput { line: u64, reason: String },

    #[error("Signal '{signal}' needs {required} payload bytes but the frame has {available}")]
    TruncatedPayload {
        signal: String,
        required: usize,
        available: usize,
    },

    #[error("No signal definitions for {channel} message 0x{message_id:X}")]
    UnknownSignal { channel: Channel, message_id: u32 },

    #[error("Invalid configuration: {0}")]
    Configuration(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}
