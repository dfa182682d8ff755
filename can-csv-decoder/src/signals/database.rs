//! Signal table
//!
//! Maps (channel, message id) to the ordered list of signal definitions for
//! that message. The table is built once before a job starts and is read-only
//! afterwards, so both bus pipelines share it through an `Arc` without locks.

use crate::config::{BitExpansion, ChannelFilter};
use crate::output::OutputSchema;
use crate::types::{Channel, DecoderError, Result};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

/// Byte order for signal extraction
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ByteOrder {
    /// Little-endian (Intel format): `start_bit` is the signal's LSB
    #[default]
    #[serde(rename = "little", alias = "intel", alias = "little_endian")]
    LittleEndian,
    /// Big-endian (Motorola format): `start_bit` is the signal's MSB in
    /// sequential MSB-first numbering
    #[serde(rename = "big", alias = "motorola", alias = "big_endian")]
    BigEndian,
}

/// Closed set of signal kinds, resolved when the table is loaded
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignalKind {
    /// Integer raw value converted with `raw * scale + offset`
    #[default]
    Scaled,
    /// Composite status word, eligible for bit expansion
    Bitfield,
    /// IEEE-754 value stored in the bit range (32 or 64 bits)
    Float,
}

/// A CAN signal definition
#[derive(Debug, Clone, PartialEq)]
pub struct SignalDefinition {
    pub channel: Channel,
    pub message_id: u32,
    /// Signal name, unique within its message
    pub name: String,
    /// Start bit in the payload word
    pub start_bit: u8,
    /// Length in bits (1..=64)
    pub bit_length: u8,
    pub byte_order: ByteOrder,
    /// Two's-complement signed raw value
    pub signed: bool,
    /// Scale factor to convert raw value to physical value
    pub scale: f64,
    /// Offset to add after scaling
    pub offset: f64,
    /// Engineering unit (e.g. "V", "rpm"); may be empty
    pub unit: String,
    pub kind: SignalKind,
}

impl SignalDefinition {
    /// Create an unsigned little-endian scaled signal with unit scaling
    pub fn new(
        channel: Channel,
        message_id: u32,
        name: impl Into<String>,
        start_bit: u8,
        bit_length: u8,
    ) -> Self {
        Self {
            channel,
            message_id,
            name: name.into(),
            start_bit,
            bit_length,
            byte_order: ByteOrder::LittleEndian,
            signed: false,
            scale: 1.0,
            offset: 0.0,
            unit: String::new(),
            kind: SignalKind::Scaled,
        }
    }

    /// Builder method: set byte order
    pub fn with_byte_order(mut self, byte_order: ByteOrder) -> Self {
        self.byte_order = byte_order;
        self
    }

    /// Builder method: mark the raw value as two's-complement signed
    pub fn with_signed(mut self, signed: bool) -> Self {
        self.signed = signed;
        self
    }

    /// Builder method: set scale and offset
    pub fn with_scaling(mut self, scale: f64, offset: f64) -> Self {
        self.scale = scale;
        self.offset = offset;
        self
    }

    /// Builder method: set engineering unit
    pub fn with_unit(mut self, unit: impl Into<String>) -> Self {
        self.unit = unit.into();
        self
    }

    /// Builder method: set signal kind
    pub fn with_kind(mut self, kind: SignalKind) -> Self {
        self.kind = kind;
        self
    }

    /// Number of payload bytes needed to hold the signal's bit range
    pub fn required_bytes(&self) -> usize {
        (self.start_bit as usize + self.bit_length as usize + 7) / 8
    }

    /// Physical payload bits covered by the signal, as a mask over
    /// `byte * 8 + bit_in_byte` (LSB = 0)
    pub fn bit_mask(&self) -> u64 {
        let mut mask = 0u64;
        for i in 0..self.bit_length as u32 {
            let seq = self.start_bit as u32 + i;
            let physical = match self.byte_order {
                ByteOrder::LittleEndian => seq,
                ByteOrder::BigEndian => (seq & !7) | (7 - (seq & 7)),
            };
            if physical < 64 {
                mask |= 1u64 << physical;
            }
        }
        mask
    }

    /// True if this signal produces per-bit columns under `mode`
    pub fn expands(&self, mode: BitExpansion) -> bool {
        mode != BitExpansion::Off && self.kind == SignalKind::Bitfield && self.bit_length > 1
    }

    /// Column name of bit `index` of an expanded signal
    pub fn bit_name(&self, index: u8) -> String {
        format!("{}[{}]", self.name, index)
    }

    /// True if `column` is one of the per-bit columns this bitfield can emit
    pub fn generates_bit_column(&self, column: &str) -> bool {
        if self.kind != SignalKind::Bitfield || self.bit_length <= 1 {
            return false;
        }
        column
            .strip_prefix(self.name.as_str())
            .and_then(|rest| rest.strip_prefix('['))
            .and_then(|rest| rest.strip_suffix(']'))
            .and_then(|index| index.parse::<u8>().ok())
            .map_or(false, |index| index < self.bit_length)
    }

    /// Output column names produced by this signal, in emission order
    pub fn column_names(&self, mode: BitExpansion) -> Vec<String> {
        if !self.expands(mode) {
            return vec![self.name.clone()];
        }
        let bits = (0..self.bit_length).map(|i| self.bit_name(i));
        match mode {
            BitExpansion::Replace => bits.collect(),
            _ => std::iter::once(self.name.clone()).chain(bits).collect(),
        }
    }

    /// Reject malformed definitions eagerly
    pub fn validate(&self) -> Result<()> {
        let fail = |reason: &str| {
            Err(DecoderError::Configuration(format!(
                "signal '{}' ({} 0x{:X}): {}",
                self.name, self.channel, self.message_id, reason
            )))
        };

        if self.name.trim().is_empty() {
            return fail("empty signal name");
        }
        if OutputSchema::FIXED_COLUMNS
            .iter()
            .any(|column| self.name.trim().eq_ignore_ascii_case(column))
        {
            return fail("name is reserved for a fixed output column");
        }
        if self.bit_length == 0 || self.bit_length > 64 {
            return fail("bit_length must be between 1 and 64");
        }
        if self.start_bit as u32 + self.bit_length as u32 > 64 {
            return fail("bit range exceeds the 64-bit payload word");
        }
        if !self.scale.is_finite() || !self.offset.is_finite() {
            return fail("scale and offset must be finite");
        }
        match self.kind {
            SignalKind::Float if self.bit_length != 32 && self.bit_length != 64 => {
                fail("float signals must be 32 or 64 bits long")
            }
            SignalKind::Bitfield if self.signed => fail("bitfield signals cannot be signed"),
            _ => Ok(()),
        }
    }
}

/// The signal table shared by all bus pipelines
#[derive(Debug, Clone, Default)]
pub struct SignalTable {
    /// Every definition, in declaration order (drives output column order)
    definitions: Vec<SignalDefinition>,

    /// Per-message definitions, in declaration order
    messages: HashMap<(Channel, u32), Vec<SignalDefinition>>,
}

impl SignalTable {
    /// Create an empty table
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a table from definitions, validating each one
    pub fn from_definitions<I>(definitions: I) -> Result<Self>
    where
        I: IntoIterator<Item = SignalDefinition>,
    {
        let mut table = Self::new();
        for definition in definitions {
            table.add_signal(definition)?;
        }
        Ok(table)
    }

    /// Add a signal definition to the table
    ///
    /// Fails if the definition is invalid, if its name is already used in
    /// the same message, or if it overlaps a sibling that is not a bitfield.
    pub fn add_signal(&mut self, definition: SignalDefinition) -> Result<()> {
        definition.validate()?;

        let key = (definition.channel, definition.message_id);
        if let Some(siblings) = self.messages.get(&key) {
            let mask = definition.bit_mask();
            for sibling in siblings {
                if sibling.name == definition.name {
                    return Err(DecoderError::Configuration(format!(
                        "duplicate signal '{}' in {} message 0x{:X}",
                        definition.name, definition.channel, definition.message_id
                    )));
                }
                let expansion_pair = sibling.kind == SignalKind::Bitfield
                    || definition.kind == SignalKind::Bitfield;
                if !expansion_pair && sibling.bit_mask() & mask != 0 {
                    return Err(DecoderError::Configuration(format!(
                        "signal '{}' overlaps '{}' in {} message 0x{:X}",
                        definition.name, sibling.name, definition.channel, definition.message_id
                    )));
                }
            }
        }

        if let Some(other) = self.definitions.iter().find(|other| {
            other.generates_bit_column(&definition.name) || definition.generates_bit_column(&other.name)
        }) {
            return Err(DecoderError::Configuration(format!(
                "signal '{}' ({} 0x{:X}) clashes with a bit column of '{}' ({} 0x{:X})",
                definition.name,
                definition.channel,
                definition.message_id,
                other.name,
                other.channel,
                other.message_id
            )));
        }

        self.messages.entry(key).or_default().push(definition.clone());
        self.definitions.push(definition);
        Ok(())
    }

    /// Signal definitions for a message; empty for unknown ids
    pub fn lookup(&self, channel: Channel, message_id: u32) -> &[SignalDefinition] {
        self.messages
            .get(&(channel, message_id))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Like [`lookup`](Self::lookup), but an unknown id is an `UnknownSignal` error
    pub fn require(&self, channel: Channel, message_id: u32) -> Result<&[SignalDefinition]> {
        match self.lookup(channel, message_id) {
            [] => Err(DecoderError::UnknownSignal {
                channel,
                message_id,
            }),
            signals => Ok(signals),
        }
    }

    /// True if the table holds no definitions
    pub fn is_empty(&self) -> bool {
        self.definitions.is_empty()
    }

    /// All definitions in declaration order
    pub fn definitions(&self) -> &[SignalDefinition] {
        &self.definitions
    }

    /// Sorted message ids defined on a channel
    pub fn message_ids(&self, channel: Channel) -> Vec<u32> {
        let mut ids: Vec<u32> = self
            .messages
            .keys()
            .filter(|(c, _)| *c == channel)
            .map(|(_, id)| *id)
            .collect();
        ids.sort_unstable();
        ids
    }

    /// Output signal columns for a stream carrying `channels`
    ///
    /// Columns follow declaration order; a name declared by several
    /// messages maps to a single column.
    pub fn columns(
        &self,
        channels: &[Channel],
        filter: &ChannelFilter,
        expansion: BitExpansion,
    ) -> Vec<String> {
        let mut seen = HashSet::new();
        self.definitions
            .iter()
            .filter(|d| channels.contains(&d.channel) && filter.allows(d.channel, d.message_id))
            .flat_map(|d| d.column_names(expansion))
            .filter(|name| seen.insert(name.clone()))
            .collect()
    }

    /// Get table statistics
    pub fn stats(&self) -> TableStats {
        TableStats {
            num_messages: self.messages.len(),
            num_signals: self.definitions.len(),
        }
    }
}

/// Signal table statistics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TableStats {
    /// Distinct (channel, message id) pairs
    pub num_messages: usize,
    /// Total number of signal definitions
    pub num_signals: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn speed() -> SignalDefinition {
        SignalDefinition::new(Channel::Can0, 0x100, "Speed", 0, 8).with_scaling(0.5, 0.0)
    }

    #[test]
    fn test_empty_table() {
        let table = SignalTable::new();
        assert!(table.is_empty());
        assert_eq!(table.stats(), TableStats { num_messages: 0, num_signals: 0 });
        assert!(table.lookup(Channel::Can0, 0x100).is_empty());
    }

    #[test]
    fn test_add_and_lookup() {
        let table = SignalTable::from_definitions([
            speed(),
            SignalDefinition::new(Channel::Can0, 0x100, "Rpm", 8, 16),
            SignalDefinition::new(Channel::Can1, 0x6B0, "Volts", 0, 16),
        ])
        .unwrap();

        let names: Vec<_> = table
            .lookup(Channel::Can0, 0x100)
            .iter()
            .map(|d| d.name.as_str())
            .collect();
        assert_eq!(names, vec!["Speed", "Rpm"]);
        assert!(table.lookup(Channel::Can1, 0x100).is_empty());
        assert_eq!(table.require(Channel::Can0, 0x100).unwrap().len(), 2);
        assert!(matches!(
            table.require(Channel::Can1, 0x100),
            Err(DecoderError::UnknownSignal { channel: Channel::Can1, message_id: 0x100 })
        ));
        assert_eq!(table.stats().num_messages, 2);
        assert_eq!(table.message_ids(Channel::Can1), vec![0x6B0]);
    }

    #[test]
    fn test_rejects_duplicates_and_overlaps() {
        let mut table = SignalTable::new();
        table.add_signal(speed()).unwrap();

        let duplicate = SignalDefinition::new(Channel::Can0, 0x100, "Speed", 8, 8);
        assert!(matches!(
            table.add_signal(duplicate),
            Err(DecoderError::Configuration(_))
        ));

        let overlap = SignalDefinition::new(Channel::Can0, 0x100, "Other", 4, 8);
        assert!(table.add_signal(overlap).is_err());

        // Same name on another message is fine
        let elsewhere = SignalDefinition::new(Channel::Can0, 0x101, "Speed", 0, 8);
        assert!(table.add_signal(elsewhere).is_ok());
    }

    #[test]
    fn test_bitfield_siblings_may_overlap() {
        let table = SignalTable::from_definitions([
            SignalDefinition::new(Channel::Can1, 0x6B3, "flags", 0, 8)
                .with_kind(SignalKind::Bitfield),
            SignalDefinition::new(Channel::Can1, 0x6B3, "over_temp", 2, 1),
        ]);
        assert!(table.is_ok());
    }

    #[test]
    fn test_validation() {
        let too_long = SignalDefinition::new(Channel::Can0, 1, "x", 60, 8);
        assert!(too_long.validate().is_err());

        let bad_float = SignalDefinition::new(Channel::Can0, 1, "f", 0, 16)
            .with_kind(SignalKind::Float);
        assert!(bad_float.validate().is_err());

        let signed_bits = SignalDefinition::new(Channel::Can0, 1, "b", 0, 8)
            .with_kind(SignalKind::Bitfield)
            .with_signed(true);
        assert!(signed_bits.validate().is_err());

        let nan_scale = SignalDefinition::new(Channel::Can0, 1, "n", 0, 8)
            .with_scaling(f64::NAN, 0.0);
        assert!(nan_scale.validate().is_err());
    }

    #[test]
    fn test_rejects_names_that_clash_with_columns() {
        for name in ["timestamp", "Channel"] {
            let fixed = SignalDefinition::new(Channel::Can0, 1, name, 0, 8);
            assert!(matches!(fixed.validate(), Err(DecoderError::Configuration(_))));
        }

        let mut table = SignalTable::new();
        table
            .add_signal(
                SignalDefinition::new(Channel::Can0, 0x200, "Status", 0, 4)
                    .with_kind(SignalKind::Bitfield),
            )
            .unwrap();
        let shadow = SignalDefinition::new(Channel::Can1, 0x300, "Status[2]", 0, 1);
        assert!(matches!(
            table.add_signal(shadow),
            Err(DecoderError::Configuration(_))
        ));
        // Out of range for a 4-bit field, so no clash
        let beyond = SignalDefinition::new(Channel::Can1, 0x300, "Status[7]", 0, 1);
        assert!(table.add_signal(beyond).is_ok());

        // Same check the other way round: the bitfield arrives second
        let mut table = SignalTable::new();
        table
            .add_signal(SignalDefinition::new(Channel::Can0, 0x100, "Mode[0]", 0, 1))
            .unwrap();
        let mode = SignalDefinition::new(Channel::Can0, 0x101, "Mode", 0, 2)
            .with_kind(SignalKind::Bitfield);
        assert!(table.add_signal(mode).is_err());

        // A bitfield repeated on the other channel emits the same columns
        let mut table = SignalTable::new();
        for channel in Channel::ALL {
            table
                .add_signal(
                    SignalDefinition::new(channel, 0x6B3, "flags", 0, 8)
                        .with_kind(SignalKind::Bitfield),
                )
                .unwrap();
        }
    }

    #[test]
    fn test_big_endian_mask() {
        // Sequential bit 0 is the MSB of byte 0
        let msb = SignalDefinition::new(Channel::Can0, 1, "msb", 0, 1)
            .with_byte_order(ByteOrder::BigEndian);
        assert_eq!(msb.bit_mask(), 1 << 7);

        let word = SignalDefinition::new(Channel::Can0, 1, "w", 8, 16)
            .with_byte_order(ByteOrder::BigEndian);
        assert_eq!(word.bit_mask(), 0x00FF_FF00);
        assert_eq!(word.required_bytes(), 3);
    }

    #[test]
    fn test_columns_follow_expansion_mode() {
        let table = SignalTable::from_definitions([
            speed(),
            SignalDefinition::new(Channel::Can0, 0x200, "Status", 0, 3)
                .with_kind(SignalKind::Bitfield),
            SignalDefinition::new(Channel::Can1, 0x100, "Speed", 0, 8),
        ])
        .unwrap();
        let filter = ChannelFilter::new();

        assert_eq!(
            table.columns(&Channel::ALL, &filter, BitExpansion::Off),
            vec!["Speed", "Status"]
        );
        assert_eq!(
            table.columns(&[Channel::Can0], &filter, BitExpansion::Append),
            vec!["Speed", "Status", "Status[0]", "Status[1]", "Status[2]"]
        );
        assert_eq!(
            table.columns(&[Channel::Can0], &filter, BitExpansion::Replace),
            vec!["Speed", "Status[0]", "Status[1]", "Status[2]"]
        );

        let only_status = ChannelFilter::new().with_message_ids(vec![0x200]);
        assert_eq!(
            table.columns(&Channel::ALL, &only_status, BitExpansion::Off),
            vec!["Status"]
        );
    }
}
