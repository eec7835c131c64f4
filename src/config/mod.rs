use std::str::FromStr;

/// Frame magic: first four bytes of every frame header.
pub const MAGIC: [u8; 4] = *b"NCC1";

/// Encrypted-payload magic, inside the secure header.
pub const SECURE_MAGIC: [u8; 4] = *b"NCC2";

// Frame structure sizes
pub const FRAME_HEADER_SIZE: usize = 18;
pub const GLOBAL_HEADER_SIZE: usize = 20;
pub const CALIBRATION_HEIGHT: usize = 16;

// Capacity math leaves this many bytes unused per frame to absorb
// shard-padding rounding.
pub const CAPACITY_SAFETY_MARGIN: usize = 10;

// Erasure coding
pub const DATA_SHARDS: usize = 16;
/// `ParityShards = 0` in a decoded header means this legacy default.
pub const LEGACY_PARITY_SHARDS: usize = 48;

// Modulation levels
pub const BINARY_LEVELS: [u8; 2] = [32, 224];
pub const GRAY_LEVELS: [u8; 4] = [32, 96, 160, 224];

// Cluster
pub const BATCH_SIZE: usize = 200;

/// Redundancy level, resolving to an RS parity shard count.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Redundancy {
    Low,
    Medium,
    High,
}

impl FromStr for Redundancy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "low" => Ok(Redundancy::Low),
            "medium" => Ok(Redundancy::Medium),
            "high" => Ok(Redundancy::High),
            other => Err(format!("unknown redundancy level: {other}")),
        }
    }
}

/// Frame geometry preset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Preset {
    /// 720p, 16 px macro-pixels, binary.
    Default,
    /// Same geometry as `Default` but fast muxer flags.
    Fast,
    /// 1080p, 24 px macro-pixels, binary, low FPS. Survives YouTube transcodes.
    Youtube,
    /// 720p, 10 px macro-pixels, 4-level grayscale. Highest capacity.
    Dense,
}

impl FromStr for Preset {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "default" => Ok(Preset::Default),
            "fast" => Ok(Preset::Fast),
            "youtube" => Ok(Preset::Youtube),
            "dense" => Ok(Preset::Dense),
            other => Err(format!("unknown preset: {other}")),
        }
    }
}

/// Reed-Solomon shard counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EccConfig {
    pub data_shards: usize,
    pub parity_shards: usize,
}

impl EccConfig {
    pub fn new(redundancy: Redundancy) -> Self {
        let parity_shards = match redundancy {
            Redundancy::Low => 4,
            Redundancy::Medium => 8,
            Redundancy::High => LEGACY_PARITY_SHARDS,
        };
        EccConfig {
            data_shards: DATA_SHARDS,
            parity_shards,
        }
    }

    pub fn total_shards(&self) -> usize {
        self.data_shards + self.parity_shards
    }
}

impl Default for EccConfig {
    fn default() -> Self {
        EccConfig::new(Redundancy::Medium)
    }
}

/// Geometry and modulation parameters for one encode/decode run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameConfig {
    pub width: usize,
    pub height: usize,
    pub macro_size: usize,
    pub fps: u32,
    pub calibration_height: usize,
    /// 2 = binary, 4 = four-level grayscale.
    pub gray_levels: usize,
}

impl FrameConfig {
    pub fn preset(preset: Preset) -> Self {
        match preset {
            Preset::Default | Preset::Fast => FrameConfig {
                width: 1280,
                height: 720,
                macro_size: 16,
                fps: 30,
                calibration_height: CALIBRATION_HEIGHT,
                gray_levels: 2,
            },
            Preset::Youtube => FrameConfig {
                width: 1920,
                height: 1080,
                macro_size: 24,
                fps: 15,
                calibration_height: CALIBRATION_HEIGHT,
                gray_levels: 2,
            },
            Preset::Dense => FrameConfig {
                width: 1280,
                height: 720,
                macro_size: 10,
                fps: 30,
                calibration_height: CALIBRATION_HEIGHT,
                gray_levels: 4,
            },
        }
    }

    /// Macro-pixel grid dimensions below the calibration band.
    pub fn grid_size(&self) -> (usize, usize) {
        let cols = self.width / self.macro_size;
        let rows = (self.height - self.calibration_height) / self.macro_size;
        (cols, rows)
    }

    /// How many cells one byte occupies: 8 in binary mode, 4 in 4-level mode.
    pub fn cells_per_byte(&self) -> usize {
        if self.gray_levels == 2 {
            8
        } else {
            4
        }
    }

    /// Raw grid payload in bytes (header + shards + padding all fit here).
    pub fn bytes_per_frame(&self) -> usize {
        let (cols, rows) = self.grid_size();
        cols * rows / self.cells_per_byte()
    }

    /// Usable data bytes per frame after the frame header, RS expansion, the
    /// frame-0 global header, and the rounding safety margin.
    pub fn capacity_per_frame(&self, ecc: EccConfig, is_first_frame: bool) -> usize {
        let bytes_in_frame = self.bytes_per_frame();
        if bytes_in_frame <= FRAME_HEADER_SIZE {
            return 0;
        }
        let available_for_ecc = bytes_in_frame - FRAME_HEADER_SIZE;

        // RS splits into ceil(len / data_shards)-sized shards; derive the
        // capacity from the largest shard size that fits.
        let max_shard_size = available_for_ecc / ecc.total_shards();
        let mut capacity = max_shard_size * ecc.data_shards;

        if is_first_frame {
            capacity = capacity.saturating_sub(GLOBAL_HEADER_SIZE);
        }
        capacity.saturating_sub(CAPACITY_SAFETY_MARGIN)
    }
}

impl Default for FrameConfig {
    fn default() -> Self {
        FrameConfig::preset(Preset::Default)
    }
}

/// Number of frames needed for a payload given frame-0 and subsequent
/// capacities. Always at least one frame.
pub fn total_frames(payload_len: usize, capacity_first: usize, capacity_rest: usize) -> usize {
    let remaining = payload_len.saturating_sub(capacity_first);
    if remaining == 0 {
        1
    } else {
        1 + remaining.div_ceil(capacity_rest)
    }
}

/// Worker-pool size: all cores minus two, floor of one.
pub fn default_threads() -> usize {
    let cpus = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1);
    cpus.saturating_sub(2).max(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_grid() {
        let cfg = FrameConfig::default();
        let (cols, rows) = cfg.grid_size();
        assert_eq!(cols, 80);
        assert_eq!(rows, 44);
        assert_eq!(cfg.bytes_per_frame(), 440);
    }

    #[test]
    fn test_capacity_medium() {
        let cfg = FrameConfig::default();
        let ecc = EccConfig::new(Redundancy::Medium);
        // 440 - 18 = 422 usable; 422 / 24 shards = 17; 17 * 16 = 272.
        assert_eq!(cfg.capacity_per_frame(ecc, false), 262);
        assert_eq!(cfg.capacity_per_frame(ecc, true), 242);
    }

    #[test]
    fn test_capacity_high_redundancy_positive() {
        let cfg = FrameConfig::default();
        let ecc = EccConfig::new(Redundancy::High);
        assert_eq!(ecc.parity_shards, 48);
        assert!(cfg.capacity_per_frame(ecc, true) > 0);
    }

    #[test]
    fn test_capacity_never_negative() {
        let cfg = FrameConfig {
            width: 64,
            height: 64,
            macro_size: 16,
            fps: 30,
            calibration_height: CALIBRATION_HEIGHT,
            gray_levels: 2,
        };
        let ecc = EccConfig::new(Redundancy::High);
        assert_eq!(cfg.capacity_per_frame(ecc, true), 0);
    }

    #[test]
    fn test_total_frames() {
        assert_eq!(total_frames(0, 242, 262), 1);
        assert_eq!(total_frames(242, 242, 262), 1);
        assert_eq!(total_frames(243, 242, 262), 2);
        assert_eq!(total_frames(242 + 262, 242, 262), 2);
        assert_eq!(total_frames(242 + 262 + 1, 242, 262), 3);
    }

    #[test]
    fn test_preset_parse() {
        assert_eq!("youtube".parse::<Preset>().unwrap(), Preset::Youtube);
        assert!("4k".parse::<Preset>().is_err());
        assert_eq!("high".parse::<Redundancy>().unwrap(), Redundancy::High);
    }
}
