//! Built-in signal table presets
//!
//! `wavesculptor-orion` covers a solar race car logger: the Prohelion
//! WaveSculptor motor controller, driver controls, steering wheel and battery
//! protection unit on CAN0 (most values are little-endian `f32` pairs), and
//! the Orion BMS plus its thermistor expansion module on CAN1. The
//! MPPT words are raw and left unscaled.

use crate::signals::database::{ByteOrder, SignalDefinition, SignalKind, SignalTable};
use crate::types::{Channel, DecoderError, Result};

/// Names accepted by [`SignalTable::builtin`]
pub const BUILTIN_PRESETS: &[&str] = &["wavesculptor-orion"];

impl SignalTable {
    /// Build a named preset table
    pub fn builtin(name: &str) -> Result<Self> {
        match name {
            "wavesculptor-orion" => Self::from_definitions(wavesculptor_orion()),
            _ => Err(DecoderError::Configuration(format!(
                "unknown built-in signal table '{}' (available: {})",
                name,
                BUILTIN_PRESETS.join(", ")
            ))),
        }
    }
}

fn scaled(channel: Channel, id: u32, name: &str, start: u8, len: u8) -> SignalDefinition {
    SignalDefinition::new(channel, id, name, start, len)
}

/// Low (bytes 0..4) or high (bytes 4..8) half of a packed `f32` pair
fn float32(id: u32, name: &str, high: bool, unit: &str) -> SignalDefinition {
    SignalDefinition::new(Channel::Can0, id, name, if high { 32 } else { 0 }, 32)
        .with_kind(SignalKind::Float)
        .with_unit(unit)
}

fn bitfield(channel: Channel, id: u32, name: &str, start: u8, len: u8) -> SignalDefinition {
    SignalDefinition::new(channel, id, name, start, len).with_kind(SignalKind::Bitfield)
}

fn wavesculptor_orion() -> Vec<SignalDefinition> {
    use Channel::{Can0, Can1};

    // Two motor controllers share one layout (bases 0x400 and 0x420)
    let mut signals = Vec::new();
    for base in [0x400, 0x420] {
        signals.extend([
            bitfield(Can0, base + 0x01, "mc_limit", 0, 16),
            float32(base + 0x02, "bus_voltage_V", false, "V"),
            float32(base + 0x02, "bus_current_A", true, "A"),
            float32(base + 0x03, "motor_velocity_rpm", false, "rpm"),
            float32(base + 0x03, "vehicle_velocity_mps", true, "m/s"),
            float32(base + 0x04, "phase_b_current_arms", false, "A"),
            float32(base + 0x04, "phase_c_current_arms", true, "A"),
            float32(base + 0x05, "Vq", false, "V"),
            float32(base + 0x05, "Vd", true, "V"),
            float32(base + 0x06, "Iq", false, "A"),
            float32(base + 0x06, "Id", true, "A"),
            float32(base + 0x07, "BEMFq", false, "V"),
            float32(base + 0x07, "BEMFd", true, "V"),
            float32(base + 0x08, "rail_15V", true, "V"),
            float32(base + 0x09, "rail_1v9", false, "V"),
            float32(base + 0x09, "rail_3v3", true, "V"),
            float32(base + 0x0B, "motor_temp_C", false, "C"),
            float32(base + 0x0B, "heatsink_temp_C", true, "C"),
            float32(base + 0x0C, "dsp_temp_C", false, "C"),
            float32(base + 0x0E, "odometer_m", false, "m"),
            float32(base + 0x0E, "dc_bus_Ah", true, "Ah"),
        ]);
    }

    signals.extend([
        // Driver controls (base 0x500); percentages travel as 0..1
        float32(0x501, "motor_velocity_setpoint_rpm", false, "rpm"),
        float32(0x501, "motor_current_setpoint_pct", true, "%").with_scaling(100.0, 0.0),
        float32(0x502, "bus_current_cmd_pct", true, "%").with_scaling(100.0, 0.0),
        bitfield(Can0, 0x504, "dc_switch_pos", 0, 16),
        bitfield(Can0, 0x504, "dc_switch_change", 16, 16),
        // Steering wheel (base 0x540)
        bitfield(Can0, 0x541, "stw_pos", 0, 16),
        bitfield(Can0, 0x541, "stw_change", 16, 16),
    ]);

    for (bit, label) in ["horn", "ind_l", "ind_r", "regen", "cruise"].iter().enumerate() {
        signals.push(scaled(Can0, 0x541, &format!("stw_pos_{}", label), bit as u8, 1));
    }

    signals.extend([
        // Battery protection (base 0x580)
        float32(0x581, "max_cell_id", false, ""),
        float32(0x581, "max_cell_voltage_V", true, "V"),
        float32(0x582, "min_cell_id", false, ""),
        float32(0x582, "min_cell_voltage_V", true, "V"),
        float32(0x583, "max_temp_cell", false, ""),
        float32(0x583, "max_temp_C", true, "C"),
        float32(0x585, "state_of_charge_pct", false, "%"),
        float32(0x585, "shunt_current_A", true, "A"),
        float32(0x586, "pack_voltage_V", false, "V"),
        float32(0x586, "shunt_sum", true, "Ah"),
    ]);

    // MPPTs (0x600..0x61F) send four raw little-endian words; on the on/off
    // command id the command byte takes the place of word 0
    const MPPT_ONOFF: u32 = 0x610;
    for id in 0x600..0x620 {
        let first_word = if id == MPPT_ONOFF {
            signals.push(scaled(Can0, id, "mppt_onoff_cmd", 0, 8));
            1
        } else {
            0
        };
        for word in first_word..4u8 {
            signals.push(scaled(Can0, id, &format!("mppt_word{}", word), word * 16, 16));
        }
    }

    signals.extend([
        // Orion BMS (base 0x6B0)
        scaled(Can1, 0x6B0, "high_cell_voltage_V", 0, 16).with_scaling(1e-4, 0.0).with_unit("V"),
        scaled(Can1, 0x6B0, "high_cell_id", 16, 8),
        scaled(Can1, 0x6B0, "low_cell_voltage_V", 32, 16).with_scaling(1e-4, 0.0).with_unit("V"),
        scaled(Can1, 0x6B0, "low_cell_id", 48, 8),
        scaled(Can1, 0x6B1, "pack_current_A", 0, 16)
            .with_signed(true)
            .with_scaling(0.1, 0.0)
            .with_unit("A"),
        scaled(Can1, 0x6B1, "pack_voltage_V_orion", 16, 16).with_scaling(0.1, 0.0).with_unit("V"),
        scaled(Can1, 0x6B1, "state_of_charge_pct_orion", 32, 16).with_scaling(0.5, 0.0).with_unit("%"),
        scaled(Can1, 0x6B1, "num_cells", 48, 16),
        scaled(Can1, 0x6B2, "high_temp_C_orion", 0, 16).with_signed(true).with_unit("C"),
        scaled(Can1, 0x6B2, "high_temp_id", 16, 16),
        scaled(Can1, 0x6B2, "low_temp_C_orion", 32, 16).with_signed(true).with_unit("C"),
        scaled(Can1, 0x6B2, "low_temp_id", 48, 16),
        bitfield(Can1, 0x6B3, "flag0", 0, 8),
    ]);

    let flags = [
        "low_cell_voltage",
        "high_cell_voltage",
        "over_temp",
        "open_wiring",
        "internal_comm",
        "charge_enable_relay",
        "discharge_relay",
    ];
    for (bit, label) in flags.iter().enumerate() {
        signals.push(scaled(Can1, 0x6B3, &format!("flag0_{}", label), bit as u8, 1));
    }

    // Cell broadcast is big-endian
    let cell = |name: &str, start: u8, len: u8| {
        scaled(Can1, 0x6B4, name, start, len).with_byte_order(ByteOrder::BigEndian)
    };
    signals.extend([
        cell("cell_id", 0, 8),
        cell("inst_voltage_V", 8, 16).with_scaling(1e-4, 0.0).with_unit("V"),
        cell("shunting", 24, 1),
        cell("internal_resistance_mOhm", 25, 15).with_scaling(0.01, 0.0).with_unit("mOhm"),
        cell("open_circuit_voltage_V", 40, 16).with_scaling(1e-4, 0.0).with_unit("V"),
        cell("checksum", 56, 8),
    ]);

    // Thermistor expansion module, J1939 general broadcast
    const THERM_GENERAL: u32 = 0x1838_F380;
    signals.extend([
        scaled(Can1, THERM_GENERAL, "thermistor_global_id", 0, 8),
        scaled(Can1, THERM_GENERAL, "temp_C", 8, 8).with_signed(true).with_unit("C"),
        scaled(Can1, THERM_GENERAL, "thermistor_local_id", 16, 7),
        scaled(Can1, THERM_GENERAL, "local_fault", 23, 1),
        scaled(Can1, THERM_GENERAL, "lowest_temp_C", 24, 8).with_signed(true).with_unit("C"),
        scaled(Can1, THERM_GENERAL, "highest_temp_C", 32, 8).with_signed(true).with_unit("C"),
        scaled(Can1, THERM_GENERAL, "module_highest_id", 40, 8),
        scaled(Can1, THERM_GENERAL, "module_lowest_id", 48, 8),
    ]);

    // Thermistor module J1939 address claim
    const THERM_ADDR_CLAIM: u32 = 0x18EE_FF80;
    signals.extend([
        scaled(Can1, THERM_ADDR_CLAIM, "unique_id", 0, 24).with_byte_order(ByteOrder::BigEndian),
        scaled(Can1, THERM_ADDR_CLAIM, "bms_target_addr", 24, 8),
        scaled(Can1, THERM_ADDR_CLAIM, "module_number_shifted", 32, 8),
        scaled(Can1, THERM_ADDR_CLAIM, "const_5", 40, 8),
        scaled(Can1, THERM_ADDR_CLAIM, "const_6", 48, 8),
        scaled(Can1, THERM_ADDR_CLAIM, "const_7", 56, 8),
    ]);

    signals
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_preset_is_valid() {
        let table = SignalTable::builtin("wavesculptor-orion").unwrap();
        assert!(table.stats().num_signals > 60);
        assert_eq!(table.lookup(Channel::Can0, 0x402).len(), 2);
        assert_eq!(table.lookup(Channel::Can1, 0x6B3).len(), 8);
        assert!(table.lookup(Channel::Can1, 0x402).is_empty());
    }

    #[test]
    fn test_second_motor_controller_mirrors_the_first() {
        let table = SignalTable::builtin("wavesculptor-orion").unwrap();
        let names = |id| -> Vec<String> {
            table
                .lookup(Channel::Can0, id)
                .iter()
                .map(|d| d.name.clone())
                .collect()
        };
        for offset in [0x01, 0x02, 0x03, 0x09, 0x0E] {
            assert!(!names(0x400 + offset).is_empty());
            assert_eq!(names(0x400 + offset), names(0x420 + offset));
        }
    }

    #[test]
    fn test_mppt_words_and_address_claim() {
        let table = SignalTable::builtin("wavesculptor-orion").unwrap();
        for id in [0x600, 0x605, 0x61F] {
            let words = table.lookup(Channel::Can0, id);
            assert_eq!(words.len(), 4);
            assert_eq!(words[3].name, "mppt_word3");
            assert_eq!(words[3].start_bit, 48);
        }
        assert!(table.lookup(Channel::Can0, 0x620).is_empty());

        let onoff: Vec<_> = table
            .lookup(Channel::Can0, 0x610)
            .iter()
            .map(|d| d.name.as_str())
            .collect();
        assert_eq!(onoff, vec!["mppt_onoff_cmd", "mppt_word1", "mppt_word2", "mppt_word3"]);

        let claim = table.lookup(Channel::Can1, 0x18EE_FF80);
        assert_eq!(claim.len(), 6);
        assert_eq!(claim[0].name, "unique_id");
        assert_eq!(claim[0].byte_order, ByteOrder::BigEndian);
    }

    #[test]
    fn test_unknown_preset() {
        assert!(matches!(
            SignalTable::builtin("nope"),
            Err(DecoderError::Configuration(_))
        ));
    }
}
