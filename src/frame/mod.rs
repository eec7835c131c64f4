use byteorder::{BigEndian, ByteOrder};
use rand::RngCore;
use thiserror::Error;

use crate::config::{
    self, EccConfig, FrameConfig, FRAME_HEADER_SIZE, GLOBAL_HEADER_SIZE, MAGIC,
};
use crate::ecc::{EccEncoder, EccError};
use crate::integrity;

#[derive(Error, Debug)]
pub enum FrameError {
    #[error("buffer too short: need {need} bytes, have {have}")]
    BufferTooShort { need: usize, have: usize },
    #[error("invalid magic: expected {expected:?}, got {got:?}")]
    InvalidMagic { expected: [u8; 4], got: [u8; 4] },
    #[error("frame {index} data region too large: {got} bytes > {max} max")]
    DataTooLarge { index: u32, got: usize, max: usize },
    #[error("frame {index} record too large for grid: {got} bytes > {max} max")]
    RecordTooLarge { index: u32, got: usize, max: usize },
    #[error("frame {index} shard protection failed: {source}")]
    Ecc { index: u32, source: EccError },
}

/// Whole-payload metadata, carried only inside frame 0's data region.
///
/// `original_size` is deliberately written as zero: the authenticated
/// encryption layer owns the authoritative size, and leaking it here would
/// reveal plaintext length. The decoder trusts `FrameHeader::data_size` only.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GlobalHeader {
    pub original_size: u64,
    pub total_frames: u32,
    pub reserved: [u8; 8],
}

impl GlobalHeader {
    pub fn encode(&self) -> [u8; GLOBAL_HEADER_SIZE] {
        let mut buf = [0u8; GLOBAL_HEADER_SIZE];
        BigEndian::write_u64(&mut buf[0..8], self.original_size);
        BigEndian::write_u32(&mut buf[8..12], self.total_frames);
        buf[12..20].copy_from_slice(&self.reserved);
        buf
    }

    pub fn decode(data: &[u8]) -> Result<Self, FrameError> {
        if data.len() < GLOBAL_HEADER_SIZE {
            return Err(FrameError::BufferTooShort {
                need: GLOBAL_HEADER_SIZE,
                have: data.len(),
            });
        }
        let mut reserved = [0u8; 8];
        reserved.copy_from_slice(&data[12..20]);
        Ok(GlobalHeader {
            original_size: BigEndian::read_u64(&data[0..8]),
            total_frames: BigEndian::read_u32(&data[8..12]),
            reserved,
        })
    }
}

// Header field offsets (18 bytes total)
const OFF_MAGIC: usize = 0;
const OFF_FRAME_INDEX: usize = 4;
const OFF_DATA_SIZE: usize = 8;
const OFF_DATA_CRC: usize = 10;
const OFF_HAS_GLOBAL: usize = 14;
const OFF_PARITY_SHARDS: usize = 15;
const OFF_GLOBAL_OFFSET: usize = 16;

/// Per-frame header, prepended to the data region before shard protection.
/// All integers are big-endian; the layout is a wire contract shared with
/// already-produced videos.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameHeader {
    pub magic: [u8; 4],
    pub frame_index: u32,
    pub data_size: u16,
    pub data_crc: u32,
    pub has_global: u8,
    /// 0 means the legacy default of 48 parity shards.
    pub parity_shards: u8,
    pub global_offset: u16,
}

impl FrameHeader {
    pub fn encode(&self) -> [u8; FRAME_HEADER_SIZE] {
        let mut buf = [0u8; FRAME_HEADER_SIZE];
        buf[OFF_MAGIC..OFF_MAGIC + 4].copy_from_slice(&self.magic);
        BigEndian::write_u32(&mut buf[OFF_FRAME_INDEX..], self.frame_index);
        BigEndian::write_u16(&mut buf[OFF_DATA_SIZE..], self.data_size);
        BigEndian::write_u32(&mut buf[OFF_DATA_CRC..], self.data_crc);
        buf[OFF_HAS_GLOBAL] = self.has_global;
        buf[OFF_PARITY_SHARDS] = self.parity_shards;
        BigEndian::write_u16(&mut buf[OFF_GLOBAL_OFFSET..], self.global_offset);
        buf
    }

    pub fn decode(data: &[u8]) -> Result<Self, FrameError> {
        if data.len() < FRAME_HEADER_SIZE {
            return Err(FrameError::BufferTooShort {
                need: FRAME_HEADER_SIZE,
                have: data.len(),
            });
        }
        let mut magic = [0u8; 4];
        magic.copy_from_slice(&data[OFF_MAGIC..OFF_MAGIC + 4]);
        Ok(FrameHeader {
            magic,
            frame_index: BigEndian::read_u32(&data[OFF_FRAME_INDEX..]),
            data_size: BigEndian::read_u16(&data[OFF_DATA_SIZE..]),
            data_crc: BigEndian::read_u32(&data[OFF_DATA_CRC..]),
            has_global: data[OFF_HAS_GLOBAL],
            parity_shards: data[OFF_PARITY_SHARDS],
            global_offset: BigEndian::read_u16(&data[OFF_GLOBAL_OFFSET..]),
        })
    }

    pub fn has_valid_magic(&self) -> bool {
        self.magic == MAGIC
    }

    /// Parity shard count with the legacy-zero interpretation applied.
    pub fn effective_parity_shards(&self) -> usize {
        if self.parity_shards == 0 {
            config::LEGACY_PARITY_SHARDS
        } else {
            self.parity_shards as usize
        }
    }
}

/// One immutable frame: header plus data region, ready to render.
pub struct Frame {
    pub config: FrameConfig,
    pub header: FrameHeader,
    /// Data region: `GlobalHeader ‖ payload` on frame 0, payload elsewhere.
    pub data: Vec<u8>,
}

impl Frame {
    pub fn new(
        config: FrameConfig,
        ecc: EccConfig,
        index: u32,
        payload: &[u8],
        total_frames: u32,
    ) -> Result<Self, FrameError> {
        let mut header = FrameHeader {
            magic: MAGIC,
            frame_index: index,
            parity_shards: ecc.parity_shards as u8,
            ..FrameHeader::default()
        };

        let data = if index == 0 {
            header.has_global = 1;
            header.global_offset = FRAME_HEADER_SIZE as u16;
            let global = GlobalHeader {
                original_size: 0, // size obscured; the crypto layer carries it
                total_frames,
                reserved: [0u8; 8],
            };
            let mut data = Vec::with_capacity(GLOBAL_HEADER_SIZE + payload.len());
            data.extend_from_slice(&global.encode());
            data.extend_from_slice(payload);
            data
        } else {
            payload.to_vec()
        };

        let max_data = config.bytes_per_frame().saturating_sub(FRAME_HEADER_SIZE);
        if data.len() > max_data || data.len() > u16::MAX as usize {
            return Err(FrameError::DataTooLarge {
                index,
                got: data.len(),
                max: max_data,
            });
        }

        header.data_size = data.len() as u16;
        header.data_crc = integrity::crc32(&data);

        Ok(Frame {
            config,
            header,
            data,
        })
    }

    /// Shard-protect the data region and serialize `header ‖ shards ‖ random
    /// padding` into macro-pixel cell values, row-major. `cells` is reused
    /// across frames and resized to the full grid.
    pub fn render(&self, ecc: &EccEncoder, cells: &mut Vec<u8>) -> Result<(), FrameError> {
        let shards = ecc.encode(&self.data).map_err(|source| FrameError::Ecc {
            index: self.header.frame_index,
            source,
        })?;

        let max_bytes = self.config.bytes_per_frame();
        let mut record = Vec::with_capacity(max_bytes);
        record.extend_from_slice(&self.header.encode());
        for shard in &shards {
            record.extend_from_slice(shard);
        }

        if record.len() > max_bytes {
            return Err(FrameError::RecordTooLarge {
                index: self.header.frame_index,
                got: record.len(),
                max: max_bytes,
            });
        }

        // Pad to the full grid with random bytes so unused cells are
        // indistinguishable from data.
        let pad_start = record.len();
        record.resize(max_bytes, 0);
        rand::thread_rng().fill_bytes(&mut record[pad_start..]);

        bytes_to_cells(&record, self.config, cells);
        Ok(())
    }
}

/// Unpack bytes into per-cell values, MSB first: 8 cells/byte in binary
/// mode, 4 cells/byte (high pair first) in 4-level mode. Trailing cells
/// beyond the last whole byte are zeroed.
pub fn bytes_to_cells(bytes: &[u8], config: FrameConfig, cells: &mut Vec<u8>) {
    let (cols, rows) = config.grid_size();
    let total = cols * rows;
    let per_byte = config.cells_per_byte();

    cells.clear();
    cells.resize(total, 0);

    for (i, cell) in cells.iter_mut().enumerate() {
        let byte_idx = i / per_byte;
        if byte_idx >= bytes.len() {
            break;
        }
        *cell = if config.gray_levels == 2 {
            let shift = 7 - (i % 8);
            (bytes[byte_idx] >> shift) & 0x01
        } else {
            let shift = 6 - (i % 4) * 2;
            (bytes[byte_idx] >> shift) & 0x03
        };
    }
}

/// Pack per-cell values back into bytes, dropping any partial trailing byte.
pub fn cells_to_bytes(cells: &[u8], gray_levels: usize) -> Vec<u8> {
    if gray_levels == 2 {
        cells
            .chunks_exact(8)
            .map(|c| {
                (c[0] << 7)
                    | (c[1] << 6)
                    | (c[2] << 5)
                    | (c[3] << 4)
                    | (c[4] << 3)
                    | (c[5] << 2)
                    | (c[6] << 1)
                    | c[7]
            })
            .collect()
    } else {
        cells
            .chunks_exact(4)
            .map(|c| (c[0] << 6) | (c[1] << 4) | (c[2] << 2) | c[3])
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Redundancy;

    #[test]
    fn test_frame_header_roundtrip() {
        let header = FrameHeader {
            magic: MAGIC,
            frame_index: 7,
            data_size: 262,
            data_crc: 0xDEADBEEF,
            has_global: 0,
            parity_shards: 8,
            global_offset: 0,
        };
        let bytes = header.encode();
        assert_eq!(bytes.len(), FRAME_HEADER_SIZE);
        assert_eq!(FrameHeader::decode(&bytes).unwrap(), header);
    }

    #[test]
    fn test_frame_header_big_endian_layout() {
        let header = FrameHeader {
            magic: MAGIC,
            frame_index: 0x01020304,
            data_size: 0x0506,
            ..FrameHeader::default()
        };
        let bytes = header.encode();
        assert_eq!(&bytes[..4], b"NCC1");
        assert_eq!(&bytes[4..8], &[0x01, 0x02, 0x03, 0x04]);
        assert_eq!(&bytes[8..10], &[0x05, 0x06]);
    }

    #[test]
    fn test_global_header_roundtrip() {
        let global = GlobalHeader {
            original_size: 0,
            total_frames: 42,
            reserved: [0u8; 8],
        };
        let decoded = GlobalHeader::decode(&global.encode()).unwrap();
        assert_eq!(decoded, global);
    }

    #[test]
    fn test_legacy_parity_default() {
        let header = FrameHeader::default();
        assert_eq!(header.effective_parity_shards(), 48);
        let header = FrameHeader {
            parity_shards: 8,
            ..FrameHeader::default()
        };
        assert_eq!(header.effective_parity_shards(), 8);
    }

    #[test]
    fn test_frame_zero_carries_global_header() {
        let cfg = FrameConfig::default();
        let ecc = EccConfig::new(Redundancy::Medium);
        let frame = Frame::new(cfg, ecc, 0, b"hello", 3).unwrap();
        assert_eq!(frame.header.has_global, 1);
        assert_eq!(frame.header.global_offset, FRAME_HEADER_SIZE as u16);
        assert_eq!(frame.header.data_size as usize, GLOBAL_HEADER_SIZE + 5);

        let global = GlobalHeader::decode(&frame.data).unwrap();
        assert_eq!(global.total_frames, 3);
        assert_eq!(global.original_size, 0);
        assert_eq!(&frame.data[GLOBAL_HEADER_SIZE..], b"hello");
    }

    #[test]
    fn test_later_frames_skip_global_header() {
        let cfg = FrameConfig::default();
        let ecc = EccConfig::new(Redundancy::Medium);
        let frame = Frame::new(cfg, ecc, 1, b"world", 3).unwrap();
        assert_eq!(frame.header.has_global, 0);
        assert_eq!(frame.data, b"world");
        assert_eq!(
            frame.header.data_crc,
            integrity::crc32(b"world")
        );
    }

    #[test]
    fn test_oversized_data_rejected() {
        let cfg = FrameConfig::default();
        let ecc = EccConfig::new(Redundancy::Medium);
        let too_big = vec![0u8; cfg.bytes_per_frame()];
        assert!(matches!(
            Frame::new(cfg, ecc, 1, &too_big, 2),
            Err(FrameError::DataTooLarge { .. })
        ));
    }

    #[test]
    fn test_cells_roundtrip_binary() {
        let cfg = FrameConfig::default();
        let bytes: Vec<u8> = (0..cfg.bytes_per_frame()).map(|i| (i * 31) as u8).collect();
        let mut cells = Vec::new();
        bytes_to_cells(&bytes, cfg, &mut cells);
        assert_eq!(cells_to_bytes(&cells, 2), bytes);
    }

    #[test]
    fn test_cells_roundtrip_four_level() {
        let cfg = FrameConfig::preset(crate::config::Preset::Dense);
        let bytes: Vec<u8> = (0..cfg.bytes_per_frame()).map(|i| (i * 13) as u8).collect();
        let mut cells = Vec::new();
        bytes_to_cells(&bytes, cfg, &mut cells);
        assert!(cells.iter().all(|&c| c < 4));
        assert_eq!(cells_to_bytes(&cells, 4), bytes);
    }

    #[test]
    fn test_msb_first_bit_order() {
        let cfg = FrameConfig::default();
        let mut cells = Vec::new();
        bytes_to_cells(&[0b1000_0001], cfg, &mut cells);
        assert_eq!(&cells[..8], &[1, 0, 0, 0, 0, 0, 0, 1]);
    }

    #[test]
    fn test_render_decodes_back_to_header() {
        let cfg = FrameConfig::default();
        let ecc_cfg = EccConfig::new(Redundancy::Medium);
        let ecc = EccEncoder::new(ecc_cfg).unwrap();
        let frame = Frame::new(cfg, ecc_cfg, 0, b"roundtrip payload", 1).unwrap();

        let mut cells = Vec::new();
        frame.render(&ecc, &mut cells).unwrap();
        let bytes = cells_to_bytes(&cells, cfg.gray_levels);

        let header = FrameHeader::decode(&bytes).unwrap();
        assert!(header.has_valid_magic());
        assert_eq!(header.data_size, frame.header.data_size);
        assert_eq!(header.data_crc, frame.header.data_crc);
    }

    #[test]
    fn test_render_padding_differs_between_runs() {
        let cfg = FrameConfig::default();
        let ecc_cfg = EccConfig::new(Redundancy::Medium);
        let ecc = EccEncoder::new(ecc_cfg).unwrap();
        let frame = Frame::new(cfg, ecc_cfg, 1, b"same payload", 2).unwrap();

        let mut first = Vec::new();
        let mut second = Vec::new();
        frame.render(&ecc, &mut first).unwrap();
        frame.render(&ecc, &mut second).unwrap();

        // The record prefix (header + shards) is identical, the random tail
        // is not.
        let shard_size = ecc.shard_size(frame.data.len());
        let record_cells =
            (FRAME_HEADER_SIZE + shard_size * ecc_cfg.total_shards()) * cfg.cells_per_byte();
        assert_eq!(first[..record_cells], second[..record_cells]);
        assert_ne!(first[record_cells..], second[record_cells..]);
    }
}
