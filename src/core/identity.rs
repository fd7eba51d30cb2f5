//! Device identity derived from the hardware id.

/// CRC polynomial (reflected) used for the device name suffix.
pub const NAME_CRC_POLY: u16 = 0x9EB2;
pub const NAME_CRC_SEED: u16 = 0xFFFF;

/// Reflected CRC-16: LSB-first, no final XOR.
pub fn crc16_reflect(poly: u16, seed: u16, data: &[u8]) -> u16 {
    let mut crc = seed;
    for &byte in data {
        crc ^= byte as u16;
        for _ in 0..8 {
            crc = if crc & 1 != 0 { (crc >> 1) ^ poly } else { crc >> 1 };
        }
    }
    crc
}

/// Builds `"<base>_<HHHH>"` from the 8-byte hardware id.
///
/// The result is cut to `buf_size - 1` bytes, the room left in a
/// NUL-terminated buffer of `buf_size` bytes.
pub fn device_name(base: &str, id: &[u8; 8], buf_size: usize) -> String {
    let crc = crc16_reflect(NAME_CRC_POLY, NAME_CRC_SEED, id);
    let mut name = format!("{base}_{crc:04X}");

    let limit = buf_size.saturating_sub(1);
    if name.len() > limit {
        let mut cut = limit;
        while !name.is_char_boundary(cut) {
            cut -= 1;
        }
        name.truncate(cut);
    }
    name
}

/// Hex rendering of the hardware id for logs.
pub fn format_id(id: &[u8; 8]) -> String {
    id.iter().map(|b| format!("{b:02x}")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crc_matches_reference_values() {
        let cases: [([u8; 8], u16); 4] = [
            ([0x00; 8], 0x51F1),
            ([0x00, 0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07], 0x223F),
            ([0xFF; 8], 0xC404),
            ([0x12, 0x34, 0x56, 0x78, 0x9A, 0xBC, 0xDE, 0xF0], 0xF312),
        ];
        for (id, expected) in cases {
            assert_eq!(crc16_reflect(NAME_CRC_POLY, NAME_CRC_SEED, &id), expected);
        }
    }

    #[test]
    fn empty_input_returns_seed() {
        assert_eq!(crc16_reflect(NAME_CRC_POLY, 0x1234, &[]), 0x1234);
    }

    #[test]
    fn name_uses_uppercase_hex_suffix() {
        assert_eq!(device_name("SlotVM", &[0xFF; 8], 32), "SlotVM_C404");
        assert_eq!(device_name("base", &[0x00; 8], 32), "base_51F1");
    }

    #[test]
    fn name_is_truncated_to_buffer() {
        assert_eq!(device_name("SlotVM", &[0xFF; 8], 8), "SlotVM_");
        assert_eq!(device_name("SlotVM", &[0xFF; 8], 12), "SlotVM_C404");
        assert_eq!(device_name("SlotVM", &[0xFF; 8], 1), "");
        assert_eq!(device_name("SlotVM", &[0xFF; 8], 0), "");
        assert_eq!(device_name("Zürich", &[0xFF; 8], 3), "Z");
    }

    #[test]
    fn id_renders_as_lowercase_hex() {
        assert_eq!(format_id(&[0x12, 0x34, 0x56, 0x78, 0x9A, 0xBC, 0xDE, 0xF0]), "123456789abcdef0");
    }
}
