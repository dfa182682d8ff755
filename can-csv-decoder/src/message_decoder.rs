//! Frame decoding engine
//!
//! Extracts signal values from raw CAN frames based on the signal table.
//! Handles bit extraction, endianness, sign extension, physical value
//! conversion and bit expansion.

use crate::config::BitExpansion;
use crate::signals::database::{ByteOrder, SignalDefinition, SignalKind};
use crate::types::{DecoderError, RawFrameRecord, SignalValue, MAX_PAYLOAD_BYTES};
use byteorder::{BigEndian, ByteOrder as _, LittleEndian};

/// Result of decoding one frame
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DecodedFrame {
    /// (column name, value) in declaration order
    pub values: Vec<(String, SignalValue)>,
    /// Signals omitted because the payload was too short
    pub truncated: Vec<TruncatedSignal>,
}

/// A signal whose bit range did not fit the frame's payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TruncatedSignal {
    pub name: String,
    /// Payload bytes the signal needs
    pub required: usize,
    /// Payload bytes the frame carried
    pub available: usize,
}

/// Frame decoder - extracts signals from CAN frames
pub struct FrameDecoder;

impl FrameDecoder {
    /// Decode a frame against the definitions of its message
    ///
    /// A signal whose bit range does not fit the payload is skipped and
    /// reported in `truncated`; the remaining signals still decode.
    pub fn decode(
        record: &RawFrameRecord,
        signals: &[SignalDefinition],
        expansion: BitExpansion,
    ) -> DecodedFrame {
        let mut frame = DecodedFrame::default();

        for signal in signals {
            if let Err(e) = Self::decode_signal(&record.payload, signal, expansion, &mut frame.values) {
                log::trace!(
                    "{} message 0x{:X} line {}: {}",
                    record.channel,
                    record.message_id,
                    record.line,
                    e
                );
                frame.truncated.push(TruncatedSignal {
                    name: signal.name.clone(),
                    required: signal.required_bytes(),
                    available: record.payload.len(),
                });
            }
        }

        frame
    }

    /// Decode a single signal and append its column(s) to `out`
    pub fn decode_signal(
        payload: &[u8],
        signal: &SignalDefinition,
        expansion: BitExpansion,
        out: &mut Vec<(String, SignalValue)>,
    ) -> Result<(), DecoderError> {
        let raw = Self::extract_raw(payload, signal.start_bit, signal.bit_length, signal.byte_order)
            .ok_or_else(|| DecoderError::TruncatedPayload {
                signal: signal.name.clone(),
                required: signal.required_bytes(),
                available: payload.len(),
            })?;

        let expands = signal.expands(expansion);
        if !(expands && expansion == BitExpansion::Replace) {
            out.push((signal.name.clone(), Self::physical_value(raw, signal)));
        }
        if expands {
            for bit in 0..signal.bit_length {
                out.push((signal.bit_name(bit), SignalValue::Boolean((raw >> bit) & 1 == 1)));
            }
        }
        Ok(())
    }

    /// Convert an extracted raw value to its physical value
    pub fn physical_value(raw: u64, signal: &SignalDefinition) -> SignalValue {
        let unscaled = signal.scale == 1.0 && signal.offset == 0.0;

        match signal.kind {
            SignalKind::Float => {
                let value = if signal.bit_length == 32 {
                    f64::from(f32::from_bits(raw as u32))
                } else {
                    f64::from_bits(raw)
                };
                SignalValue::Float(value * signal.scale + signal.offset)
            }
            SignalKind::Bitfield => SignalValue::Integer(raw as i64),
            SignalKind::Scaled if signal.signed => {
                let value = Self::sign_extend(raw, signal.bit_length as usize);
                if unscaled {
                    SignalValue::Integer(value)
                } else {
                    SignalValue::Float(value as f64 * signal.scale + signal.offset)
                }
            }
            SignalKind::Scaled => {
                if unscaled && signal.bit_length == 1 {
                    SignalValue::Boolean(raw != 0)
                } else if unscaled && raw <= i64::MAX as u64 {
                    SignalValue::Integer(raw as i64)
                } else {
                    SignalValue::Float(raw as f64 * signal.scale + signal.offset)
                }
            }
        }
    }

    /// Extract `bit_length` bits starting at `start_bit`
    ///
    /// Returns `None` if the bit range does not fit in the payload.
    ///
    /// - Little-endian: `start_bit` is the LSB; bit `n` is bit `n % 8` of
    ///   byte `n / 8`.
    /// - Big-endian: `start_bit` is the MSB in sequential numbering where bit
    ///   0 is the MSB of byte 0. This is the payload read as a big-endian word.
    pub fn extract_raw(payload: &[u8], start_bit: u8, bit_length: u8, byte_order: ByteOrder) -> Option<u64> {
        let start = start_bit as u32;
        let length = bit_length as u32;
        if length == 0 || start + length > 64 {
            return None;
        }
        let required_bytes = ((start + length + 7) / 8) as usize;
        if required_bytes > payload.len() {
            return None;
        }

        let word = Self::load_word(payload, byte_order);
        let shift = match byte_order {
            ByteOrder::LittleEndian => start,
            ByteOrder::BigEndian => 64 - start - length,
        };
        Some((word >> shift) & Self::mask(length))
    }

    /// Write `raw` into the bit range, leaving the other payload bits intact
    ///
    /// Inverse of [`FrameDecoder::extract_raw`]. Bits of the range that fall
    /// outside the payload are dropped.
    pub fn insert_raw(payload: &mut [u8], start_bit: u8, bit_length: u8, byte_order: ByteOrder, raw: u64) {
        let start = start_bit as u32;
        let length = bit_length as u32;
        if length == 0 || start + length > 64 {
            return;
        }

        let shift = match byte_order {
            ByteOrder::LittleEndian => start,
            ByteOrder::BigEndian => 64 - start - length,
        };
        let mask = Self::mask(length) << shift;
        let word = (Self::load_word(payload, byte_order) & !mask) | ((raw << shift) & mask);

        let mut bytes = [0u8; MAX_PAYLOAD_BYTES];
        match byte_order {
            ByteOrder::LittleEndian => LittleEndian::write_u64(&mut bytes, word),
            ByteOrder::BigEndian => BigEndian::write_u64(&mut bytes, word),
        }
        let len = payload.len().min(MAX_PAYLOAD_BYTES);
        payload[..len].copy_from_slice(&bytes[..len]);
    }

    /// Sign-extend a value from N bits to 64 bits
    ///
    /// If the value's MSB is 1, fill the upper bits with 1s.
    pub fn sign_extend(value: u64, bit_length: usize) -> i64 {
        if bit_length == 0 || bit_length >= 64 {
            return value as i64;
        }

        let sign_bit = 1u64 << (bit_length - 1);
        if (value & sign_bit) != 0 {
            (value | (!0u64 << bit_length)) as i64
        } else {
            value as i64
        }
    }

    /// Payload zero-padded to 8 bytes and read as one word
    fn load_word(payload: &[u8], byte_order: ByteOrder) -> u64 {
        let mut bytes = [0u8; MAX_PAYLOAD_BYTES];
        let len = payload.len().min(MAX_PAYLOAD_BYTES);
        bytes[..len].copy_from_slice(&payload[..len]);
        match byte_order {
            ByteOrder::LittleEndian => LittleEndian::read_u64(&bytes),
            ByteOrder::BigEndian => BigEndian::read_u64(&bytes),
        }
    }

    fn mask(length: u32) -> u64 {
        if length >= 64 {
            u64::MAX
        } else {
            (1u64 << length) - 1
        }
    }
}
