//! Image checksum
//!
//! A Fletcher-style sum over little-endian 16-bit words with end-around
//! carry folding, stored at offset 0 and covering everything after it.

/// Compute the checksum of `data`
///
/// A trailing odd byte is ignored; images are rejected earlier if their
/// length is not even.
pub fn checksum(data: &[u8]) -> u32 {
    let mut lsw: u32 = 0xffff;
    let mut msw: u32 = 0xffff;

    for word in data.chunks_exact(2) {
        lsw += u32::from(u16::from_le_bytes([word[0], word[1]]));
        msw += lsw;
        lsw = (lsw & 0xffff) + (lsw >> 16);
        msw = (msw & 0xffff) + (msw >> 16);
    }

    (msw << 16) | lsw
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty() {
        assert_eq!(checksum(&[]), 0xffff_ffff);
    }

    #[test]
    fn test_single_word() {
        // lsw folds to 0x0001, msw folds to 0x10000 and its carry is
        // shifted out of the high half
        assert_eq!(checksum(&[0x01, 0x00]), 0x0000_0001);
        assert_eq!(checksum(&[0x00, 0x00]), 0xffff_ffff);
    }

    #[test]
    fn test_word_order_matters() {
        assert_ne!(checksum(&[1, 0, 2, 0]), checksum(&[2, 0, 1, 0]));
    }

    #[test]
    fn test_odd_trailing_byte_ignored() {
        assert_eq!(checksum(&[0x12, 0x34]), checksum(&[0x12, 0x34, 0x56]));
    }
}
