//! CRC32 implementation for MPEG-2 TS PSI tables, per ITU-T H.222.0 /
//! ISO/IEC 13818-1. Polynomial 0x04C11DB7, initial value 0xFFFFFFFF,
//! no final xor, no reflection.

const CRC32_MPEG2_POLY: u32 = 0x04C1_1DB7;

/// MPEG-2 CRC32 calculator used for PSI section validation and signing.
pub struct Crc32Mpeg2 {
    table: [u32; 256],
}

impl Crc32Mpeg2 {
    /// Creates a calculator with a pre-computed lookup table.
    pub fn new() -> Self {
        let mut table = [0u32; 256];
        let mut i = 0;
        while i < 256 {
            let mut crc = (i as u32) << 24;
            let mut bit = 0;
            while bit < 8 {
                crc = if crc & 0x8000_0000 != 0 {
                    (crc << 1) ^ CRC32_MPEG2_POLY
                } else {
                    crc << 1
                };
                bit += 1;
            }
            table[i] = crc;
            i += 1;
        }
        Self { table }
    }

    /// Calculates the CRC32 of `data`.
    pub fn calculate(&self, data: &[u8]) -> u32 {
        let mut crc = 0xFFFF_FFFFu32;
        for &byte in data {
            let index = ((crc >> 24) ^ byte as u32) & 0xFF;
            crc = (crc << 8) ^ self.table[index as usize];
        }
        crc
    }
}

impl Default for Crc32Mpeg2 {
    fn default() -> Self {
        Self::new()
    }
}

thread_local! {
    static CRC: Crc32Mpeg2 = Crc32Mpeg2::new();
}

/// Calculates an MPEG-2 CRC32 using a per-thread lookup table.
pub fn crc32(data: &[u8]) -> u32 {
    CRC.with(|c| c.calculate(data))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_vector() {
        // Test vector from STMicroelectronics community forum post
        let crc = Crc32Mpeg2::new();
        assert_eq!(crc.calculate(&[0x01, 0x01]), 0xD66FB816);
    }

    #[test]
    fn test_section_self_check() {
        // A section whose trailing 4 bytes are its own CRC must hash to it
        let pat_data = [
            0x00, // Table ID (PAT)
            0xB0, 0x0D, // Section syntax + length
            0x00, 0x01, // Transport stream ID
            0xC1, // Version 0, current
            0x00, 0x00, // Section number, last section number
            0x00, 0x01, // Program number
            0xE1, 0x00, // Program map PID
        ];
        let crc_val = crc32(&pat_data);
        let mut section = pat_data.to_vec();
        section.extend_from_slice(&crc_val.to_be_bytes());
        assert_eq!(crc32(&section[..section.len() - 4]), crc_val);
    }
}
