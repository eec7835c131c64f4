use crc::{Crc, CRC_32_ISO_HDLC};
use sha2::{Digest, Sha256};

/// CRC-32/IEEE calculator, as used by the frame header's `DataCRC` field.
const CRC_IEEE: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

/// Compute CRC-32/IEEE over a byte slice.
pub fn crc32(data: &[u8]) -> u32 {
    CRC_IEEE.checksum(data)
}

/// Verify a CRC-32/IEEE checksum.
pub fn verify_crc32(data: &[u8], expected: u32) -> bool {
    crc32(data) == expected
}

/// SHA-256 digest type.
pub type Sha256Digest = [u8; 32];

/// Compute SHA-256 hash of a byte slice.
pub fn sha256(data: &[u8]) -> Sha256Digest {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_crc32_known_value() {
        // "123456789" has a well-known CRC-32/IEEE checksum
        assert_eq!(crc32(b"123456789"), 0xCBF43926);
    }

    #[test]
    fn test_crc32_empty() {
        assert_eq!(crc32(b""), 0);
    }

    #[test]
    fn test_crc32_single_byte_sensitivity() {
        let mut data = vec![0xAB; 64];
        let crc = crc32(&data);
        data[17] ^= 0x01;
        assert_ne!(crc32(&data), crc);
        assert!(!verify_crc32(&data, crc));
    }

    #[test]
    fn test_sha256_known_value() {
        let hash = sha256(b"hello");
        let expected = "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824";
        let hex: String = hash.iter().map(|b| format!("{:02x}", b)).collect();
        assert_eq!(hex, expected);
    }
}
