//! Hamming weight lookup
//!
//! The leakage model charges a changed register with the number of set
//! bits of its new value, one byte at a time.

/// Population count of every byte value
pub const HAMMING_WEIGHT: [u8; 256] = build_table();

const fn build_table() -> [u8; 256] {
    let mut table = [0u8; 256];
    let mut byte = 0;
    while byte < 256 {
        table[byte] = (byte as u8).count_ones() as u8;
        byte += 1;
    }
    table
}

/// Sum of the Hamming weights of all bytes in `bytes`
pub fn hamming_weight(bytes: &[u8]) -> u64 {
    bytes
        .iter()
        .map(|&byte| u64::from(HAMMING_WEIGHT[byte as usize]))
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_table_matches_popcount() {
        for byte in 0..=255u8 {
            assert_eq!(
                HAMMING_WEIGHT[byte as usize] as u32,
                byte.count_ones(),
                "Wrong weight for {:#04x}",
                byte
            );
        }
    }

    #[test]
    fn test_hamming_weight_of_bytes() {
        assert_eq!(hamming_weight(&[]), 0);
        assert_eq!(hamming_weight(&[0xff]), 8);
        assert_eq!(hamming_weight(&[0x0f]), 4);
        assert_eq!(hamming_weight(&[0x01, 0x80, 0xff, 0x00]), 10);
        assert_eq!(hamming_weight(&u64::MAX.to_le_bytes()), 64);
    }
}
