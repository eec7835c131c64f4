use std::collections::HashMap;

use anyhow::{Context, Result};
use indicatif::ProgressBar;
use log::{info, warn};
use rayon::prelude::*;

use crate::calibration::{self, Calibration};
use crate::config::{EccConfig, FrameConfig, Preset, DATA_SHARDS, FRAME_HEADER_SIZE, GLOBAL_HEADER_SIZE};
use crate::ecc::EccEncoder;
use crate::frame::{self, FrameHeader, GlobalHeader};
use crate::integrity;
use crate::macropixel;
use crate::video::extractor::FrameExtractor;
use crate::video::Raster;

/// Macro sizes probed during universal recovery, most likely first.
const SCAN_SIZES: [usize; 6] = [10, 12, 16, 24, 8, 32];
/// Pixel offsets probed during universal recovery.
const SCAN_OFFSETS: [i32; 7] = [0, 1, -1, 2, -2, 3, -3];

/// One successfully decoded frame.
pub struct DecodedFrame {
    pub header: FrameHeader,
    pub global: Option<GlobalHeader>,
    pub payload: Vec<u8>,
    pub crc_ok: bool,
}

/// Per-raster decode outcome. A frame whose header magic survives neither
/// the fast path nor the full recovery scan is lost; its index surfaces as a
/// missing-result error during reassembly.
pub enum FrameOutcome {
    Decoded(Box<DecodedFrame>),
    Lost,
}

/// Decode rasters back into the payload byte stream, self-calibrating
/// brightness and geometry per frame.
pub struct FrameReconstructor {
    pub frame_cfg: FrameConfig,
}

impl FrameReconstructor {
    pub fn new(preset: Preset) -> Self {
        Self::with_config(FrameConfig::preset(preset))
    }

    pub fn with_config(frame_cfg: FrameConfig) -> Self {
        FrameReconstructor { frame_cfg }
    }

    /// Extract all frames from `input_path` and reassemble the payload in
    /// frame-index order.
    pub fn reconstruct_payload(&self, input_path: &str) -> Result<Vec<u8>> {
        let extractor = FrameExtractor::probe(input_path)?;

        let mut cfg = self.frame_cfg;
        if extractor.width != cfg.width || extractor.height != cfg.height {
            warn!(
                "configured {}x{} but stream is {}x{}, adopting observed geometry",
                cfg.width, cfg.height, extractor.width, extractor.height
            );
            cfg.width = extractor.width;
            cfg.height = extractor.height;
        }

        let mut stream = extractor.open()?;
        let progress = ProgressBar::new_spinner();

        // Sequential pipe reads, parallel per-batch decode: batch size
        // matches the rayon pool so all cores stay busy while memory stays
        // bounded to `threads` rasters.
        let batch_size = rayon::current_num_threads();
        let mut results: HashMap<u32, DecodedFrame> = HashMap::new();
        let mut lost_frames = 0usize;
        let mut crc_warnings = 0usize;
        let mut batch: Vec<Raster> = Vec::with_capacity(batch_size);

        loop {
            let raster = stream.next_frame().context("read frame from decoder")?;
            let eof = match raster {
                Some(raster) => {
                    batch.push(raster);
                    false
                }
                None => true,
            };

            if batch.len() >= batch_size || (eof && !batch.is_empty()) {
                let decoded: Vec<FrameOutcome> = batch
                    .par_iter()
                    .map(|raster| self.process_raster_with(&cfg, raster))
                    .collect();
                for outcome in decoded {
                    match outcome {
                        FrameOutcome::Decoded(frame) => {
                            if !frame.crc_ok {
                                crc_warnings += 1;
                                warn!(
                                    "frame {} CRC mismatch after shard correction",
                                    frame.header.frame_index
                                );
                            }
                            results.insert(frame.header.frame_index, *frame);
                        }
                        FrameOutcome::Lost => {
                            lost_frames += 1;
                            warn!("frame header unrecoverable, declaring frame lost");
                        }
                    }
                }
                progress.set_message(format!("{} frames decoded", results.len()));
                batch.clear();
            }
            if eof {
                break;
            }
        }
        let observed_frames = stream.finish()? as usize;
        progress.finish_and_clear();

        if crc_warnings > 0 {
            warn!("total CRC warnings: {}/{} frames", crc_warnings, observed_frames);
        }
        if lost_frames > 0 {
            warn!("{} of {} frames lost", lost_frames, observed_frames);
        }
        if let Some(frame0) = results.get(&0) {
            if let Some(global) = frame0.global {
                if global.total_frames as usize != observed_frames {
                    warn!(
                        "expected {} frames, found {}",
                        global.total_frames, observed_frames
                    );
                }
            }
        }

        let payload = reassemble(&results, observed_frames)?;
        info!("reassembled {} bytes from {} frames", payload.len(), observed_frames);
        Ok(payload)
    }

    /// Decode a single raster with this reconstructor's configuration.
    pub fn process_raster(&self, raster: &Raster) -> FrameOutcome {
        let mut cfg = self.frame_cfg;
        cfg.width = raster.width;
        cfg.height = raster.height;
        self.process_raster_with(&cfg, raster)
    }

    fn process_raster_with(&self, cfg: &FrameConfig, raster: &Raster) -> FrameOutcome {
        let calibration = calibration::measure(raster, cfg.calibration_height);
        let threshold = calibration.binary_threshold();
        let levels = calibration.level_thresholds();

        let mut bytes = sample_bytes(raster, cfg, threshold, levels, 0, 0);
        let mut effective_cfg = *cfg;

        let fast_path_ok = FrameHeader::decode(&bytes)
            .map(|h| h.has_valid_magic())
            .unwrap_or(false);
        if !fast_path_ok {
            match self.recover_header(cfg, raster, calibration) {
                Some((recovered, recovered_cfg)) => {
                    bytes = recovered;
                    effective_cfg = recovered_cfg;
                }
                None => return FrameOutcome::Lost,
            }
        }

        match decode_body(&effective_cfg, &bytes) {
            Ok(frame) => FrameOutcome::Decoded(Box::new(frame)),
            Err(e) => {
                warn!("frame body decode failed: {e:#}");
                FrameOutcome::Lost
            }
        }
    }

    /// Universal recovery: bounded scans over geometry, then luminance.
    /// First header-magic match wins and applies to this frame only.
    fn recover_header(
        &self,
        cfg: &FrameConfig,
        raster: &Raster,
        calibration: Calibration,
    ) -> Option<(Vec<u8>, FrameConfig)> {
        let threshold = calibration.binary_threshold();
        let levels = calibration.level_thresholds();

        // Spatial and macro-size scan.
        for size in SCAN_SIZES {
            let mut probe_cfg = *cfg;
            probe_cfg.macro_size = size;
            for &dy in &SCAN_OFFSETS {
                for &dx in &SCAN_OFFSETS {
                    let bytes = sample_bytes(raster, &probe_cfg, threshold, levels, dx, dy);
                    if probe_magic(&bytes) {
                        info!("recovery hit: macro size {size}, offset ({dx}, {dy})");
                        return Some((bytes, probe_cfg));
                    }
                }
            }
        }

        if cfg.gray_levels == 2 {
            // Threshold scan at base geometry.
            let mut t = 30u8;
            while t < 220 {
                if t != threshold {
                    let bytes = sample_bytes(raster, cfg, t, levels, 0, 0);
                    if probe_magic(&bytes) {
                        info!("recovery hit: threshold {t}");
                        return Some((bytes, *cfg));
                    }
                }
                t += 5;
            }
        } else {
            // Level scan: slide and stretch the quantization range.
            let base_t2 = levels[1] as i32;
            let mut base_range = levels[2] as i32 - levels[0] as i32;
            if base_range < 20 {
                base_range = 100;
            }

            let mut shift = -60i32;
            while shift <= 60 {
                for scale_tenths in 5..=15 {
                    let range = base_range as f64 * (scale_tenths as f64 / 10.0);
                    let t2 = base_t2 + shift;
                    let mut t1 = (t2 as f64 - range * 0.35) as i32;
                    let mut t2 = t2;
                    let mut t3 = (t2 as f64 + range * 0.35) as i32;
                    t1 = t1.max(0);
                    if t2 < t1 {
                        t2 = t1 + 5;
                    }
                    if t3 < t2 {
                        t3 = t2 + 5;
                    }
                    t3 = t3.min(255);

                    let probe = [t1.min(255) as u8, t2.min(255) as u8, t3 as u8];
                    let bytes = sample_bytes(raster, cfg, threshold, probe, 0, 0);
                    if probe_magic(&bytes) {
                        info!("recovery hit: level shift {shift}, scale {:.1}", scale_tenths as f64 / 10.0);
                        return Some((bytes, *cfg));
                    }
                }
                shift += 5;
            }
        }

        None
    }
}

/// Concatenate frame payloads in ascending frame-index order. Any hole in
/// the index sequence is fatal.
pub fn reassemble(
    results: &HashMap<u32, DecodedFrame>,
    observed_frames: usize,
) -> Result<Vec<u8>> {
    let mut payload = Vec::new();
    for i in 0..observed_frames as u32 {
        let frame = results
            .get(&i)
            .with_context(|| format!("missing result for frame {i}"))?;
        payload.extend_from_slice(&frame.payload);
    }
    Ok(payload)
}

fn probe_magic(bytes: &[u8]) -> bool {
    FrameHeader::decode(bytes)
        .map(|h| h.has_valid_magic())
        .unwrap_or(false)
}

/// Sample every grid cell (mean luminance over the cell interior, skipping
/// out-of-image pixels), quantize with the given thresholds, and pack the
/// cell values into bytes in encoder order.
fn sample_bytes(
    raster: &Raster,
    cfg: &FrameConfig,
    threshold: u8,
    levels: [u8; 3],
    dx: i32,
    dy: i32,
) -> Vec<u8> {
    let (cols, rows) = cfg.grid_size();
    let ms = cfg.macro_size;
    let band = cfg.calibration_height as i32;

    let mut cells = Vec::with_capacity(cols * rows);
    for y in 0..rows as i32 {
        for x in 0..cols as i32 {
            let px = x * ms as i32 + dx;
            let py = band + y * ms as i32 + dy;
            let gray = sample_cell(raster, px, py, ms);
            let value = if cfg.gray_levels == 2 {
                macropixel::quantize_binary(gray, threshold)
            } else {
                macropixel::quantize_levels(gray, levels)
            };
            cells.push(value);
        }
    }
    frame::cells_to_bytes(&cells, cfg.gray_levels)
}

fn sample_cell(raster: &Raster, px: i32, py: i32, size: usize) -> u8 {
    if px >= raster.width as i32 || py >= raster.height as i32 {
        return 0;
    }
    // A negative probe offset clips the window instead of widening it into
    // the neighboring cell's tile; the missing pixels are skipped, as on the
    // positive side.
    let w = size as i32 + px.min(0);
    let h = size as i32 + py.min(0);
    if w <= 0 || h <= 0 {
        return 0;
    }
    raster.mean_luma(px.max(0) as usize, py.max(0) as usize, w as usize, h as usize)
}

/// Decode a sampled byte stream: header, shard rebuild, CRC check, and the
/// frame-0 global/payload split.
fn decode_body(cfg: &FrameConfig, bytes: &[u8]) -> Result<DecodedFrame> {
    let header = FrameHeader::decode(bytes).context("decode frame header")?;
    if !header.has_valid_magic() {
        return Err(frame::FrameError::InvalidMagic {
            expected: crate::config::MAGIC,
            got: header.magic,
        }
        .into());
    }

    let bytes_in_frame = cfg.bytes_per_frame();
    let available = bytes.len().saturating_sub(FRAME_HEADER_SIZE);
    let usable = (bytes_in_frame.saturating_sub(FRAME_HEADER_SIZE)).min(available);
    let data_with_ecc = &bytes[FRAME_HEADER_SIZE..FRAME_HEADER_SIZE + usable];

    let ecc_cfg = EccConfig {
        data_shards: DATA_SHARDS,
        parity_shards: header.effective_parity_shards(),
    };
    let ecc = EccEncoder::new(ecc_cfg)
        .with_context(|| format!("create shard codec for frame {}", header.frame_index))?;

    let shard_size = ecc.shard_size(header.data_size as usize);
    let total_shards = ecc_cfg.total_shards();

    // Slice the shard region; shards whose source bytes fall outside the
    // observed image become zero buffers, still counted as present so Verify
    // flags the inconsistency.
    let mut shards: Vec<Vec<u8>> = Vec::with_capacity(total_shards);
    for i in 0..total_shards {
        let start = i * shard_size;
        let mut shard = vec![0u8; shard_size];
        if start < data_with_ecc.len() {
            let end = (start + shard_size).min(data_with_ecc.len());
            shard[..end - start].copy_from_slice(&data_with_ecc[start..end]);
        }
        shards.push(shard);
    }

    let clean = ecc.verify(&shards).unwrap_or(false);
    if !clean {
        let mut slots: Vec<Option<Vec<u8>>> = shards.into_iter().map(Some).collect();
        ecc.reconstruct(&mut slots)
            .with_context(|| format!("reconstruct shards for frame {}", header.frame_index))?;
        shards = slots.into_iter().map(|s| s.unwrap_or_default()).collect();
    }

    let out = ecc.join(&shards, DATA_SHARDS * shard_size);
    let data_len = (header.data_size as usize).min(out.len());

    if header.has_global == 1 && header.frame_index == 0 {
        if out.len() < GLOBAL_HEADER_SIZE {
            anyhow::bail!("frame 0 too short for global header: {} bytes", out.len());
        }
        let global = GlobalHeader::decode(&out[..GLOBAL_HEADER_SIZE])?;
        let crc_ok = integrity::verify_crc32(&out[..data_len], header.data_crc);
        Ok(DecodedFrame {
            header,
            global: Some(global),
            payload: out[GLOBAL_HEADER_SIZE..data_len].to_vec(),
            crc_ok,
        })
    } else {
        let crc_ok = integrity::verify_crc32(&out[..data_len], header.data_crc);
        Ok(DecodedFrame {
            header,
            global: None,
            payload: out[..data_len].to_vec(),
            crc_ok,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Redundancy;
    use crate::ecc::EccEncoder;
    use crate::frame::Frame;

    /// Paint a frame's cells plus calibration band into an rgb24 raster,
    /// independently of the production RGBA path.
    fn raster_from_frame(cfg: FrameConfig, frame: &Frame, ecc: &EccEncoder) -> Raster {
        let mut cells = Vec::new();
        frame.render(ecc, &mut cells).unwrap();
        raster_from_cells(cfg, &cells)
    }

    fn raster_from_cells(cfg: FrameConfig, cells: &[u8]) -> Raster {
        let mut raster = Raster::new(cfg.width, cfg.height);
        let section = cfg.width / 4;
        for y in 0..cfg.calibration_height {
            for x in 0..cfg.width {
                let white = (x >= section && x < 2 * section) || x >= 3 * section;
                let val = if white { 255 } else { 0 };
                let off = (y * cfg.width + x) * 3;
                raster.pix[off..off + 3].fill(val);
            }
        }
        let (cols, _) = cfg.grid_size();
        for (i, &cell) in cells.iter().enumerate() {
            let gray = macropixel::cell_to_gray(cell, cfg.gray_levels);
            let x0 = (i % cols) * cfg.macro_size;
            let y0 = cfg.calibration_height + (i / cols) * cfg.macro_size;
            for dy in 0..cfg.macro_size {
                for dx in 0..cfg.macro_size {
                    let off = ((y0 + dy) * cfg.width + x0 + dx) * 3;
                    raster.pix[off..off + 3].fill(gray);
                }
            }
        }
        raster
    }

    fn decode_one(preset: Preset, raster: &Raster) -> DecodedFrame {
        match FrameReconstructor::new(preset).process_raster(raster) {
            FrameOutcome::Decoded(frame) => *frame,
            FrameOutcome::Lost => panic!("frame unexpectedly lost"),
        }
    }

    /// Small geometry so tests that walk the full recovery scan stay fast.
    fn small_cfg() -> FrameConfig {
        FrameConfig {
            width: 640,
            height: 368,
            macro_size: 16,
            fps: 30,
            calibration_height: 16,
            gray_levels: 2,
        }
    }

    #[test]
    fn test_clean_roundtrip_binary() {
        let cfg = FrameConfig::preset(Preset::Default);
        let ecc_cfg = EccConfig::new(Redundancy::Medium);
        let ecc = EccEncoder::new(ecc_cfg).unwrap();
        let frame = Frame::new(cfg, ecc_cfg, 0, b"Hello, NCC1", 1).unwrap();
        let raster = raster_from_frame(cfg, &frame, &ecc);

        let decoded = decode_one(Preset::Default, &raster);
        assert!(decoded.crc_ok);
        assert_eq!(decoded.payload, b"Hello, NCC1");
        assert_eq!(decoded.global.unwrap().total_frames, 1);
    }

    #[test]
    fn test_clean_roundtrip_four_level() {
        let cfg = FrameConfig::preset(Preset::Dense);
        let ecc_cfg = EccConfig::new(Redundancy::Medium);
        let ecc = EccEncoder::new(ecc_cfg).unwrap();
        let payload: Vec<u8> = (0..=255).collect();
        let frame = Frame::new(cfg, ecc_cfg, 1, &payload, 2).unwrap();
        let raster = raster_from_frame(cfg, &frame, &ecc);

        let decoded = decode_one(Preset::Dense, &raster);
        assert!(decoded.crc_ok);
        assert_eq!(decoded.payload, payload);
        assert!(decoded.global.is_none());
    }

    #[test]
    fn test_recovery_from_pixel_shift() {
        let cfg = FrameConfig::preset(Preset::Default);
        let ecc_cfg = EccConfig::new(Redundancy::Medium);
        let ecc = EccEncoder::new(ecc_cfg).unwrap();
        let frame = Frame::new(cfg, ecc_cfg, 0, b"shifted", 1).unwrap();
        let raster = raster_from_frame(cfg, &frame, &ecc);

        // Shift the whole image 2 px right and 1 px down.
        let mut shifted = Raster::new(cfg.width, cfg.height);
        for y in 1..cfg.height {
            for x in 2..cfg.width {
                let src = ((y - 1) * cfg.width + x - 2) * 3;
                let dst = (y * cfg.width + x) * 3;
                shifted.pix[dst..dst + 3].copy_from_slice(&raster.pix[src..src + 3]);
            }
        }

        let decoded = decode_one(Preset::Default, &shifted);
        assert_eq!(decoded.payload, b"shifted");
    }

    #[test]
    fn test_recovery_from_luminance_shift() {
        let cfg = FrameConfig::preset(Preset::Default);
        let ecc_cfg = EccConfig::new(Redundancy::Medium);
        let ecc = EccEncoder::new(ecc_cfg).unwrap();
        let frame = Frame::new(cfg, ecc_cfg, 0, b"dimmed", 1).unwrap();
        let mut raster = raster_from_frame(cfg, &frame, &ecc);

        // Monotone affine squeeze: L' = 0.6 L + 40. The band is squeezed
        // identically, so calibration should still track it.
        for px in raster.pix.iter_mut() {
            *px = (*px as f64 * 0.6 + 40.0) as u8;
        }

        let decoded = decode_one(Preset::Default, &raster);
        assert_eq!(decoded.payload, b"dimmed");
    }

    #[test]
    fn test_flat_frame_is_lost() {
        let cfg = small_cfg();
        let mut raster = Raster::new(cfg.width, cfg.height);
        raster.pix.fill(128);

        let recon = FrameReconstructor::with_config(cfg);
        assert!(matches!(recon.process_raster(&raster), FrameOutcome::Lost));
    }

    #[test]
    fn test_zeroed_magic_is_lost() {
        let cfg = small_cfg();
        let ecc_cfg = EccConfig::new(Redundancy::Medium);
        let ecc = EccEncoder::new(ecc_cfg).unwrap();
        let frame = Frame::new(cfg, ecc_cfg, 0, b"doomed", 1).unwrap();

        let mut cells = Vec::new();
        frame.render(&ecc, &mut cells).unwrap();
        // Zero the first 32 cells = the 4 magic bytes.
        for cell in cells.iter_mut().take(32) {
            *cell = 0;
        }
        let raster = raster_from_cells(cfg, &cells);

        let recon = FrameReconstructor::with_config(cfg);
        assert!(matches!(recon.process_raster(&raster), FrameOutcome::Lost));
    }

    #[test]
    fn test_corrupted_body_keeps_data_with_crc_warning() {
        let cfg = FrameConfig::preset(Preset::Default);
        let ecc_cfg = EccConfig::new(Redundancy::Medium);
        let ecc = EccEncoder::new(ecc_cfg).unwrap();
        let payload = vec![0x5Au8; 100];
        let frame = Frame::new(cfg, ecc_cfg, 1, &payload, 2).unwrap();

        let mut cells = Vec::new();
        frame.render(&ecc, &mut cells).unwrap();
        // Flip one data cell well past the header (byte 30, bit 0).
        let cell_idx = 30 * 8;
        cells[cell_idx] ^= 1;
        let raster = raster_from_cells(cfg, &cells);

        let decoded = decode_one(Preset::Default, &raster);
        assert!(!decoded.crc_ok);
        assert_eq!(decoded.payload.len(), payload.len());
    }
}
