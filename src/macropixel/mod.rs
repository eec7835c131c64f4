//! Macro-pixel modulation: cell values to grayscale luminance and back.
//!
//! Binary mode carries 1 bit per cell at levels {32, 224}; 4-level mode
//! carries 2 bits per cell at {32, 96, 160, 224}. The 64-unit spacing leaves
//! at least ±32 units of tolerance before a sample crosses into the
//! neighboring level.

use crate::config::{BINARY_LEVELS, GRAY_LEVELS};

/// Map a 1-bit value to its luminance level.
pub fn bit_to_gray(bit: u8) -> u8 {
    BINARY_LEVELS[(bit & 0x01) as usize]
}

/// Map a 2-bit value (0-3) to its luminance level.
pub fn pair_to_gray(bits: u8) -> u8 {
    GRAY_LEVELS[(bits & 0x03) as usize]
}

/// Map a cell value to luminance for the given mode.
pub fn cell_to_gray(value: u8, gray_levels: usize) -> u8 {
    if gray_levels == 2 {
        bit_to_gray(value)
    } else {
        pair_to_gray(value)
    }
}

/// Quantize a luminance sample against a single binary threshold.
pub fn quantize_binary(gray: u8, threshold: u8) -> u8 {
    u8::from(gray >= threshold)
}

/// Quantize a luminance sample into a 2-bit value using three ascending
/// thresholds: below `thresholds[0]` is 0, below `[1]` is 1, below `[2]`
/// is 2, else 3.
pub fn quantize_levels(gray: u8, thresholds: [u8; 3]) -> u8 {
    if gray < thresholds[0] {
        0
    } else if gray < thresholds[1] {
        1
    } else if gray < thresholds[2] {
        2
    } else {
        3
    }
}
