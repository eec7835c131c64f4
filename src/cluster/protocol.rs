//! Cluster wire types: JSON for configuration and registration, a big-endian
//! length-prefixed record stream for job and result batches.

use byteorder::{BigEndian, ByteOrder};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::{EccConfig, FrameConfig};

#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("truncated record stream: need {need} bytes, have {have}")]
    Truncated { need: usize, have: usize },
    #[error("record field too large: {0} bytes")]
    FieldTooLarge(usize),
}

/// Encode parameters handed to a worker on connect.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobConfig {
    pub width: usize,
    pub height: usize,
    pub macro_size: usize,
    pub fps: u32,
    pub calibration_height: usize,
    pub gray_levels: usize,

    pub data_shards: usize,
    pub parity_shards: usize,

    pub total_frames: usize,
    pub original_size: u64,
    pub file_hash: [u8; 32],
}

impl JobConfig {
    pub fn new(
        frame_cfg: FrameConfig,
        ecc_cfg: EccConfig,
        total_frames: usize,
        original_size: u64,
        file_hash: [u8; 32],
    ) -> Self {
        JobConfig {
            width: frame_cfg.width,
            height: frame_cfg.height,
            macro_size: frame_cfg.macro_size,
            fps: frame_cfg.fps,
            calibration_height: frame_cfg.calibration_height,
            gray_levels: frame_cfg.gray_levels,
            data_shards: ecc_cfg.data_shards,
            parity_shards: ecc_cfg.parity_shards,
            total_frames,
            original_size,
            file_hash,
        }
    }

    pub fn frame_config(&self) -> FrameConfig {
        FrameConfig {
            width: self.width,
            height: self.height,
            macro_size: self.macro_size,
            fps: self.fps,
            calibration_height: self.calibration_height,
            gray_levels: self.gray_levels,
        }
    }

    pub fn ecc_config(&self) -> EccConfig {
        EccConfig {
            data_shards: self.data_shards,
            parity_shards: self.parity_shards,
        }
    }
}

/// One frame's worth of payload to render.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameJob {
    pub frame_index: u32,
    pub data: Vec<u8>,
}

/// A rendered frame coming back from a worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameResult {
    pub frame_index: u32,
    pub compressed_pixels: Vec<u8>,
    pub width: u32,
    pub height: u32,
    /// Empty on success.
    pub error: String,
}

/// Worker capabilities announced at registration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerInfo {
    pub hostname: String,
    pub cpu_cores: usize,
    pub os: String,
    pub arch: String,
}

impl WorkerInfo {
    pub fn local(cpu_cores: usize) -> Self {
        let hostname = std::env::var("HOSTNAME")
            .or_else(|_| std::env::var("COMPUTERNAME"))
            .unwrap_or_else(|_| "unknown".to_string());
        WorkerInfo {
            hostname,
            cpu_cores,
            os: std::env::consts::OS.to_string(),
            arch: std::env::consts::ARCH.to_string(),
        }
    }
}

// Individual length fields cap at u32; a frame's pixels stay far below this.
const MAX_FIELD: usize = u32::MAX as usize;

fn put_u16(out: &mut Vec<u8>, v: u16) {
    let mut buf = [0u8; 2];
    BigEndian::write_u16(&mut buf, v);
    out.extend_from_slice(&buf);
}

fn put_u32(out: &mut Vec<u8>, v: u32) {
    let mut buf = [0u8; 4];
    BigEndian::write_u32(&mut buf, v);
    out.extend_from_slice(&buf);
}

/// Sequential big-endian reader over a record stream.
struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Reader { data, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], ProtocolError> {
        if self.pos + n > self.data.len() {
            return Err(ProtocolError::Truncated {
                need: self.pos + n,
                have: self.data.len(),
            });
        }
        let slice = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn u16(&mut self) -> Result<u16, ProtocolError> {
        Ok(BigEndian::read_u16(self.take(2)?))
    }

    fn u32(&mut self) -> Result<u32, ProtocolError> {
        Ok(BigEndian::read_u32(self.take(4)?))
    }
}

/// Serialize a job batch: count, then per job `index ‖ len ‖ data`.
pub fn encode_jobs(jobs: &[FrameJob]) -> Vec<u8> {
    let mut out = Vec::new();
    put_u32(&mut out, jobs.len() as u32);
    for job in jobs {
        put_u32(&mut out, job.frame_index);
        put_u32(&mut out, job.data.len() as u32);
        out.extend_from_slice(&job.data);
    }
    out
}

pub fn decode_jobs(data: &[u8]) -> Result<Vec<FrameJob>, ProtocolError> {
    let mut r = Reader::new(data);
    let count = r.u32()? as usize;
    let mut jobs = Vec::with_capacity(count.min(1024));
    for _ in 0..count {
        let frame_index = r.u32()?;
        let len = r.u32()? as usize;
        jobs.push(FrameJob {
            frame_index,
            data: r.take(len)?.to_vec(),
        });
    }
    Ok(jobs)
}

/// Serialize a result batch: count, then per result
/// `index ‖ width ‖ height ‖ pixels_len ‖ pixels ‖ err_len ‖ err`.
pub fn encode_results(results: &[FrameResult]) -> Result<Vec<u8>, ProtocolError> {
    let mut out = Vec::new();
    put_u32(&mut out, results.len() as u32);
    for result in results {
        if result.compressed_pixels.len() > MAX_FIELD {
            return Err(ProtocolError::FieldTooLarge(result.compressed_pixels.len()));
        }
        put_u32(&mut out, result.frame_index);
        put_u32(&mut out, result.width);
        put_u32(&mut out, result.height);
        put_u32(&mut out, result.compressed_pixels.len() as u32);
        out.extend_from_slice(&result.compressed_pixels);
        let err = result.error.as_bytes();
        put_u16(&mut out, err.len().min(u16::MAX as usize) as u16);
        out.extend_from_slice(&err[..err.len().min(u16::MAX as usize)]);
    }
    Ok(out)
}

pub fn decode_results(data: &[u8]) -> Result<Vec<FrameResult>, ProtocolError> {
    let mut r = Reader::new(data);
    let count = r.u32()? as usize;
    let mut results = Vec::with_capacity(count.min(1024));
    for _ in 0..count {
        let frame_index = r.u32()?;
        let width = r.u32()?;
        let height = r.u32()?;
        let pix_len = r.u32()? as usize;
        let compressed_pixels = r.take(pix_len)?.to_vec();
        let err_len = r.u16()? as usize;
        let error = String::from_utf8_lossy(r.take(err_len)?).into_owned();
        results.push(FrameResult {
            frame_index,
            compressed_pixels,
            width,
            height,
            error,
        });
    }
    Ok(results)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Redundancy;

    #[test]
    fn test_jobs_roundtrip() {
        let jobs = vec![
            FrameJob {
                frame_index: 0,
                data: vec![1, 2, 3],
            },
            FrameJob {
                frame_index: 7,
                data: Vec::new(),
            },
            FrameJob {
                frame_index: 8,
                data: vec![0xFF; 500],
            },
        ];
        let encoded = encode_jobs(&jobs);
        assert_eq!(decode_jobs(&encoded).unwrap(), jobs);
    }

    #[test]
    fn test_results_roundtrip() {
        let results = vec![
            FrameResult {
                frame_index: 3,
                compressed_pixels: vec![9; 77],
                width: 1280,
                height: 720,
                error: String::new(),
            },
            FrameResult {
                frame_index: 4,
                compressed_pixels: Vec::new(),
                width: 0,
                height: 0,
                error: "render failed".to_string(),
            },
        ];
        let encoded = encode_results(&results).unwrap();
        assert_eq!(decode_results(&encoded).unwrap(), results);
    }

    #[test]
    fn test_truncated_batch_rejected() {
        let jobs = vec![FrameJob {
            frame_index: 1,
            data: vec![5; 64],
        }];
        let encoded = encode_jobs(&jobs);
        let err = decode_jobs(&encoded[..encoded.len() - 10]).unwrap_err();
        assert!(matches!(err, ProtocolError::Truncated { .. }));
    }

    #[test]
    fn test_job_config_json_roundtrip() {
        let cfg = JobConfig::new(
            FrameConfig::default(),
            EccConfig::new(Redundancy::High),
            42,
            1_000_000,
            [7u8; 32],
        );
        let json = serde_json::to_string(&cfg).unwrap();
        assert!(json.contains("\"parityShards\":48"));
        let back: JobConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.frame_config(), FrameConfig::default());
        assert_eq!(back.ecc_config().parity_shards, 48);
        assert_eq!(back.total_frames, 42);
        assert_eq!(back.file_hash, [7u8; 32]);
    }
}
