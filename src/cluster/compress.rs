//! Pixel compression for cluster transport. Macro-pixel rasters are
//! extremely repetitive; fastest-level zstd shrinks them ~40x while staying
//! cheap enough to run per frame.

use std::io;

/// zstd speed level 1 (fastest); throughput matters more than ratio here.
const LEVEL: i32 = 1;

pub fn compress_pixels(rgba: &[u8]) -> Vec<u8> {
    // Compressing a memory slice cannot fail short of allocation failure.
    zstd::encode_all(rgba, LEVEL).expect("zstd compression of in-memory buffer")
}

pub fn decompress_pixels(compressed: &[u8]) -> io::Result<Vec<u8>> {
    zstd::decode_all(compressed)
}
