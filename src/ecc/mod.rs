//! Systematic Reed-Solomon shard protection over GF(2^8).
//!
//! Frames are split into `data_shards` equal pieces (zero-padded), extended
//! with `parity_shards` parity pieces, and can be rebuilt from any
//! `data_shards` of the total. High redundancy (48 parity, 75%) is the
//! default for lossy video where shard-level corruption is routine.

use reed_solomon_erasure::galois_8::ReedSolomon;
use thiserror::Error;

use crate::config::EccConfig;

#[derive(Error, Debug)]
pub enum EccError {
    #[error("invalid shard configuration ({data}+{parity}): {source}")]
    InvalidConfig {
        data: usize,
        parity: usize,
        source: reed_solomon_erasure::Error,
    },
    #[error("cannot split empty data")]
    EmptyData,
    #[error("parity encode failed: {0}")]
    Encode(reed_solomon_erasure::Error),
    #[error("parity verify failed: {0}")]
    Verify(reed_solomon_erasure::Error),
    #[error("reconstruct failed: {0}")]
    Reconstruct(reed_solomon_erasure::Error),
}

/// Reusable Reed-Solomon codec. One instance per renderer thread; the
/// underlying matrix setup is the expensive part.
pub struct EccEncoder {
    rs: ReedSolomon,
    pub config: EccConfig,
}

impl EccEncoder {
    pub fn new(config: EccConfig) -> Result<Self, EccError> {
        let rs = ReedSolomon::new(config.data_shards, config.parity_shards).map_err(|source| {
            EccError::InvalidConfig {
                data: config.data_shards,
                parity: config.parity_shards,
                source,
            }
        })?;
        Ok(EccEncoder { rs, config })
    }

    /// Shard size for a given data length: `ceil(len / data_shards)`, at
    /// least one byte.
    pub fn shard_size(&self, data_len: usize) -> usize {
        data_len.div_ceil(self.config.data_shards).max(1)
    }

    /// Zero-pad `data` and slice it into `data_shards` equal shards.
    pub fn split(&self, data: &[u8]) -> Result<Vec<Vec<u8>>, EccError> {
        if data.is_empty() {
            return Err(EccError::EmptyData);
        }
        let shard_size = self.shard_size(data.len());
        let mut shards = Vec::with_capacity(self.config.total_shards());
        for i in 0..self.config.data_shards {
            let start = i * shard_size;
            let mut shard = vec![0u8; shard_size];
            if start < data.len() {
                let end = (start + shard_size).min(data.len());
                shard[..end - start].copy_from_slice(&data[start..end]);
            }
            shards.push(shard);
        }
        Ok(shards)
    }

    /// Split `data` and fill in the parity shards. Returns all
    /// `data_shards + parity_shards` shards.
    pub fn encode(&self, data: &[u8]) -> Result<Vec<Vec<u8>>, EccError> {
        let mut shards = self.split(data)?;
        let shard_size = shards[0].len();
        for _ in 0..self.config.parity_shards {
            shards.push(vec![0u8; shard_size]);
        }
        self.rs.encode(&mut shards).map_err(EccError::Encode)?;
        Ok(shards)
    }

    /// Check parity consistency across a full shard set.
    pub fn verify(&self, shards: &[Vec<u8>]) -> Result<bool, EccError> {
        self.rs.verify(shards).map_err(EccError::Verify)
    }

    /// Rebuild missing (`None`) shards in place. Needs at least
    /// `data_shards` present shards.
    pub fn reconstruct(&self, shards: &mut [Option<Vec<u8>>]) -> Result<(), EccError> {
        self.rs.reconstruct(shards).map_err(EccError::Reconstruct)
    }

    /// Concatenate the data shards and truncate to `out_size`.
    pub fn join(&self, shards: &[Vec<u8>], out_size: usize) -> Vec<u8> {
        let mut out = Vec::with_capacity(out_size);
        for shard in shards.iter().take(self.config.data_shards) {
            out.extend_from_slice(shard);
        }
        out.truncate(out_size);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Redundancy;

    fn encoder(redundancy: Redundancy) -> EccEncoder {
        EccEncoder::new(EccConfig::new(redundancy)).unwrap()
    }

    #[test]
    fn test_split_pads_to_equal_shards() {
        let ecc = encoder(Redundancy::Medium);
        let shards = ecc.split(&[1u8; 33]).unwrap();
        assert_eq!(shards.len(), 16);
        assert!(shards.iter().all(|s| s.len() == 3));
    }

    #[test]
    fn test_encode_verify_join() {
        let ecc = encoder(Redundancy::Medium);
        let data: Vec<u8> = (0..200).map(|i| (i * 7) as u8).collect();
        let shards = ecc.encode(&data).unwrap();
        assert_eq!(shards.len(), 24);
        assert!(ecc.verify(&shards).unwrap());
        assert_eq!(ecc.join(&shards, data.len()), data);
    }

    #[test]
    fn test_reconstruct_up_to_parity_losses() {
        let ecc = encoder(Redundancy::High);
        let data: Vec<u8> = (0..512).map(|i| (i % 251) as u8).collect();
        let shards = ecc.encode(&data).unwrap();

        // Drop the maximum tolerable number of shards (= parity count).
        let mut damaged: Vec<Option<Vec<u8>>> = shards.iter().cloned().map(Some).collect();
        for slot in damaged.iter_mut().take(48) {
            *slot = None;
        }
        ecc.reconstruct(&mut damaged).unwrap();

        let restored: Vec<Vec<u8>> = damaged.into_iter().map(Option::unwrap).collect();
        assert!(ecc.verify(&restored).unwrap());
        assert_eq!(ecc.join(&restored, data.len()), data);
    }

    #[test]
    fn test_reconstruct_floor_medium() {
        let ecc = encoder(Redundancy::Medium);
        let data = vec![0x5Au8; 160];
        let shards = ecc.encode(&data).unwrap();

        let mut damaged: Vec<Option<Vec<u8>>> = shards.iter().cloned().map(Some).collect();
        for slot in damaged.iter_mut().skip(2).take(8) {
            *slot = None;
        }
        ecc.reconstruct(&mut damaged).unwrap();
        let restored: Vec<Vec<u8>> = damaged.into_iter().map(Option::unwrap).collect();
        assert_eq!(ecc.join(&restored, data.len()), data);
    }

    #[test]
    fn test_too_many_losses_fails() {
        let ecc = encoder(Redundancy::Low);
        let shards = ecc.encode(&[9u8; 64]).unwrap();
        let mut damaged: Vec<Option<Vec<u8>>> = shards.into_iter().map(Some).collect();
        for slot in damaged.iter_mut().take(5) {
            *slot = None;
        }
        assert!(ecc.reconstruct(&mut damaged).is_err());
    }

    #[test]
    fn test_verify_detects_corruption() {
        let ecc = encoder(Redundancy::Medium);
        let mut shards = ecc.encode(&[0xA5u8; 100]).unwrap();
        shards[3][0] ^= 0xFF;
        assert!(!ecc.verify(&shards).unwrap());
    }

    #[test]
    fn test_empty_data_rejected() {
        let ecc = encoder(Redundancy::Medium);
        assert!(matches!(ecc.split(&[]), Err(EccError::EmptyData)));
    }
}
