//! Signal table files
//!
//! Loads signal definitions from CSV or JSON. Both formats carry the same
//! fields:
//!
//! ```text
//! channel,message_id,name,start_bit,bit_length,byte_order,signed,scale,offset,unit,kind
//! any,0x100,Speed,0,8,little,false,0.5,0,km/h,scaled
//! ```
//!
//! `byte_order`, `signed`, `scale`, `offset`, `unit` and `kind` are optional.
//! Message ids in CSV are always hexadecimal; JSON accepts a number or a hex
//! string. A channel of `any` declares the signal on both buses.

use crate::signals::database::{ByteOrder, SignalDefinition, SignalKind, SignalTable};
use crate::types::{Channel, DecoderError, Result};
use serde::Deserialize;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

/// One row of a CSV signal table; every field arrives as text
#[derive(Debug, Deserialize)]
struct CsvSignalRow {
    channel: String,
    #[serde(alias = "id", alias = "can_id")]
    message_id: String,
    name: String,
    start_bit: u8,
    bit_length: u8,
    #[serde(default)]
    byte_order: Option<ByteOrder>,
    #[serde(default)]
    signed: Option<String>,
    #[serde(default)]
    scale: Option<f64>,
    #[serde(default)]
    offset: Option<f64>,
    #[serde(default)]
    unit: Option<String>,
    #[serde(default)]
    kind: Option<SignalKind>,
}

/// One entry of a JSON signal table
#[derive(Debug, Deserialize)]
struct JsonSignalEntry {
    #[serde(default = "default_channel")]
    channel: String,
    #[serde(alias = "id", alias = "can_id")]
    message_id: JsonMessageId,
    name: String,
    start_bit: u8,
    bit_length: u8,
    #[serde(default)]
    byte_order: ByteOrder,
    #[serde(default)]
    signed: bool,
    #[serde(default = "default_scale")]
    scale: f64,
    #[serde(default)]
    offset: f64,
    #[serde(default)]
    unit: String,
    #[serde(default)]
    kind: SignalKind,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum JsonMessageId {
    Number(u32),
    Text(String),
}

fn default_channel() -> String {
    "any".to_string()
}

fn default_scale() -> f64 {
    1.0
}

impl SignalTable {
    /// Load a table, picking the format from the file extension
    pub fn load(path: &Path) -> Result<Self> {
        let extension = path
            .extension()
            .and_then(|s| s.to_str())
            .map(|s| s.to_lowercase());

        match extension.as_deref() {
            Some("csv") => Self::from_csv_path(path),
            Some("json") => Self::from_json_path(path),
            _ => Err(DecoderError::Configuration(format!(
                "Unsupported signal table format: {:?}",
                path
            ))),
        }
    }

    /// Load a table from a CSV file
    pub fn from_csv_path(path: &Path) -> Result<Self> {
        log::info!("Loading signal table: {:?}", path);
        let file = File::open(path).map_err(|e| {
            DecoderError::Configuration(format!("Failed to open signal table {:?}: {}", path, e))
        })?;
        let table = Self::from_csv_reader(BufReader::new(file))?;
        log::info!(
            "Signal table loaded: {} signals in {} messages",
            table.stats().num_signals,
            table.stats().num_messages
        );
        Ok(table)
    }

    /// Load a table from CSV text
    pub fn from_csv_reader<R: Read>(reader: R) -> Result<Self> {
        let mut csv_reader = csv::ReaderBuilder::new()
            .trim(csv::Trim::All)
            .comment(Some(b'#'))
            .from_reader(reader);

        let mut table = SignalTable::new();
        for (index, row) in csv_reader.deserialize::<CsvSignalRow>().enumerate() {
            let row_number = index + 1;
            let row = row.map_err(|e| {
                DecoderError::Configuration(format!("signal table row {}: {}", row_number, e))
            })?;
            let template = SignalDefinition {
                channel: Channel::Can0,
                message_id: parse_hex_id(&row.message_id).map_err(|reason| {
                    DecoderError::Configuration(format!("signal table row {}: {}", row_number, reason))
                })?,
                name: row.name,
                start_bit: row.start_bit,
                bit_length: row.bit_length,
                byte_order: row.byte_order.unwrap_or_default(),
                signed: match row.signed.as_deref() {
                    None => false,
                    Some(text) => parse_flag(text).ok_or_else(|| {
                        DecoderError::Configuration(format!(
                            "signal table row {}: invalid signed flag '{}'",
                            row_number, text
                        ))
                    })?,
                },
                scale: row.scale.unwrap_or(1.0),
                offset: row.offset.unwrap_or(0.0),
                unit: row.unit.unwrap_or_default(),
                kind: row.kind.unwrap_or_default(),
            };
            add_on_channels(&mut table, &row.channel, template)?;
        }
        Ok(table)
    }

    /// Load a table from a JSON file
    pub fn from_json_path(path: &Path) -> Result<Self> {
        log::info!("Loading signal table: {:?}", path);
        let text = std::fs::read_to_string(path).map_err(|e| {
            DecoderError::Configuration(format!("Failed to read signal table {:?}: {}", path, e))
        })?;
        Self::from_json_str(&text)
    }

    /// Load a table from JSON text (an array of signal entries)
    pub fn from_json_str(text: &str) -> Result<Self> {
        let entries: Vec<JsonSignalEntry> = serde_json::from_str(text)?;

        let mut table = SignalTable::new();
        for entry in entries {
            let message_id = match entry.message_id {
                JsonMessageId::Number(id) => id,
                JsonMessageId::Text(text) => parse_hex_id(&text).map_err(|reason| {
                    DecoderError::Configuration(format!("signal '{}': {}", entry.name, reason))
                })?,
            };
            let template = SignalDefinition {
                channel: Channel::Can0,
                message_id,
                name: entry.name,
                start_bit: entry.start_bit,
                bit_length: entry.bit_length,
                byte_order: entry.byte_order,
                signed: entry.signed,
                scale: entry.scale,
                offset: entry.offset,
                unit: entry.unit,
                kind: entry.kind,
            };
            add_on_channels(&mut table, &entry.channel, template)?;
        }
        Ok(table)
    }
}

/// Add `template` on the channel(s) named by `channel`
fn add_on_channels(table: &mut SignalTable, channel: &str, template: SignalDefinition) -> Result<()> {
    let channels = match channel.trim().to_ascii_lowercase().as_str() {
        "" | "any" | "*" | "all" => Channel::ALL.to_vec(),
        other => vec![other.parse::<Channel>().map_err(|e| {
            DecoderError::Configuration(format!("signal '{}': {}", template.name, e))
        })?],
    };

    for channel in channels {
        table.add_signal(SignalDefinition {
            channel,
            ..template.clone()
        })?;
    }
    Ok(())
}

/// Parse a hexadecimal message id (`0x` prefix optional)
pub fn parse_hex_id(text: &str) -> std::result::Result<u32, String> {
    let trimmed = text.trim();
    let digits = trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))
        .unwrap_or(trimmed);
    if digits.is_empty() {
        return Err("empty message id".to_string());
    }
    u32::from_str_radix(digits, 16).map_err(|_| format!("invalid message id '{}'", trimmed))
}

fn parse_flag(text: &str) -> Option<bool> {
    match text.trim().to_ascii_lowercase().as_str() {
        "" | "false" | "no" | "0" | "unsigned" | "u" => Some(false),
        "true" | "yes" | "1" | "signed" | "s" => Some(true),
        _ => None,
    }
}
