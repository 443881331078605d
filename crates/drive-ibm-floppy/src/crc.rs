//! CRC-16/CCITT as used by IBM-format ID and data fields.
//!
//! Polynomial 0x1021, MSB first, preset 0xFFFF. The CRC covers the address
//! mark bytes (including the A1 sync bytes in MFM), so a field followed by
//! its own CRC leaves a residue of zero.

pub const CRC_PRESET: u16 = 0xFFFF;

/// Register value after the three MFM A1 sync bytes.
pub const CRC_AFTER_MFM_SYNC: u16 = 0xCDB4;

/// Shift one bit through the register.
#[must_use]
pub fn crc16_bit(crc: u16, bit: bool) -> u16 {
    if (crc & 0x8000 != 0) ^ bit {
        (crc << 1) ^ 0x1021
    } else {
        crc << 1
    }
}

#[must_use]
pub fn crc16_byte(mut crc: u16, byte: u8) -> u16 {
    for i in (0..8).rev() {
        crc = crc16_bit(crc, byte & (1 << i) != 0);
    }
    crc
}

/// CRC of `bytes` from the standard preset.
#[must_use]
pub fn crc16(bytes: &[u8]) -> u16 {
    bytes.iter().fold(CRC_PRESET, |crc, &b| crc16_byte(crc, b))
}
