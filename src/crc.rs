//! CRC engines in USB wire bit order.
//!
//! USB transmits every field LSB first and the CRC residual is sent
//! bit-reversed. Working with reversed generator polynomials and shifting
//! right lets the computed value be compared with, or written into, a
//! packet without reordering any bits.

/// Reversed CRC5 generator polynomial (x^5 + x^2 + 1).
pub const CRC5_POLY: u16 = 0b1_0100;
/// CRC5 seed and final mask.
pub const CRC5_MASK: u16 = 0b1_1111;
/// Reversed CRC16 generator polynomial (x^16 + x^15 + x^2 + 1).
pub const CRC16_POLY: u16 = 0b1010_0000_0000_0001;
/// CRC16 seed and final mask.
pub const CRC16_MASK: u16 = 0xffff;

/// Value of [`crc16`] over a payload followed by its own CRC.
pub const CRC16_RESIDUAL: u16 = 0x4ffe;
/// Value of the token CRC5 over all 16 token bits including the CRC field.
pub const CRC5_RESIDUAL: u16 = 0x19;

/// Number of token bits covered by CRC5: address and endpoint.
pub const TOKEN_BITS: usize = 11;

/// Bitwise CRC over the first `num_bits` bits of `data`, LSB first.
///
/// The register is seeded with `mask` and the result is XORed with
/// `mask` again.
///
/// # Panics
///
/// If `num_bits` is more than `data` holds.
pub fn crc(mask: u16, data: &[u8], num_bits: usize, poly: u16) -> u16 {
    debug_assert!(num_bits <= data.len() * 8, "crc over more bits than data");
    let mut crc = mask;

    for i in 0..num_bits {
        let bit = (data[i / 8] >> (i % 8)) as u16;
        let x = (bit ^ crc) & 1;
        crc >>= 1;
        if x != 0 {
            crc ^= poly;
        }
    }

    crc ^ mask
}

/// CRC5 of the 11 address and endpoint bits of a token.
pub fn crc5_token(token: u16) -> u16 {
    crc(CRC5_MASK, &token.to_le_bytes(), TOKEN_BITS, CRC5_POLY)
}

/// CRC16 of a data packet payload.
pub fn crc16(data: &[u8]) -> u16 {
    crc(CRC16_MASK, data, data.len() * 8, CRC16_POLY)
}

/// Reflected IEEE CRC32 with explicit seed, `!update(!seed)`.
///
/// Matches the ROM `crc32_le` routine used to protect OTA selector records.
pub fn crc32_le(seed: u32, data: &[u8]) -> u32 {
    let mut crc = !seed;
    for &b in data {
        crc ^= b as u32;
        for _ in 0..8 {
            crc = if crc & 1 != 0 {
                (crc >> 1) ^ 0xedb8_8320
            } else {
                crc >> 1
            };
        }
    }
    !crc
}
