//! 16-bit additive checksum used to self-validate outbound messages.

/// Sum `buf` as little-endian 16-bit words, modulo 2^16.
///
/// A trailing odd byte is ignored.
pub fn checksum16(buf: &[u8]) -> u16 {
    buf.chunks_exact(2)
        .fold(0u16, |sum, word| sum.wrapping_add(u16::from_le_bytes([word[0], word[1]])))
}

/// Value to store in a zeroed checksum field so the whole message sums to zero.
pub fn checksum_complement(buf: &[u8]) -> u16 {
    0u16.wrapping_sub(checksum16(buf))
}
