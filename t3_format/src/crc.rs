//! Running CRC-32 used to frame saved state files.
//!
//! The accumulator starts at zero and is never complemented, so the value
//! returned by [`Crc32::crc_val`] is the raw running CRC rather than the
//! IEEE 802.3 presentation value. Callers that need the standard value must
//! complement it themselves.

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Crc32 {
    crc: u32,
}

impl Crc32 {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold `bytes` into the running accumulator.
    pub fn scan_bytes(&mut self, bytes: &[u8]) {
        // crc32fast presets and complements; undo both around the update.
        let mut hasher = crc32fast::Hasher::new_with_initial(!self.crc);
        hasher.update(bytes);
        self.crc = !hasher.finalize();
    }

    pub fn crc_val(&self) -> u32 {
        self.crc
    }
}

/// One-shot checksum of a byte slice.
pub fn checksum(bytes: &[u8]) -> u32 {
    let mut crc = Crc32::new();
    crc.scan_bytes(bytes);
    crc.crc_val()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_input_leaves_zero() {
        let crc = Crc32::new();
        assert_eq!(crc.crc_val(), 0);
        assert_eq!(checksum(&[]), 0);
    }

    #[test]
    fn single_bytes_match_reflected_table() {
        assert_eq!(checksum(&[0x01]), 0x7707_3096);
        assert_eq!(checksum(&[0x80]), 0xEDB8_8320);
        assert_eq!(checksum(&[0xff]), 0x2D02_EF8D);
    }

    #[test]
    fn incremental_matches_one_shot() {
        let data: Vec<u8> = (0u8..=200).collect();
        let mut crc = Crc32::new();
        for chunk in data.chunks(7) {
            crc.scan_bytes(chunk);
        }
        assert_eq!(crc.crc_val(), checksum(&data));
    }

    #[test]
    fn differs_from_complemented_ieee_value() {
        // "123456789" has the IEEE check value 0xCBF43926 only when the
        // accumulator is preset and complemented.
        let raw = checksum(b"123456789");
        assert_ne!(raw, 0xCBF4_3926);
        assert_ne!(checksum(b"123456788"), raw);
    }
}
