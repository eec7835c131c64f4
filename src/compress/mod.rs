//! Payload compression, applied before encryption and reversed last on
//! decode.

use std::io;

/// Default zstd level: balanced; the video codec dominates total cost anyway.
const LEVEL: i32 = 3;

pub fn compress(data: &[u8]) -> io::Result<Vec<u8>> {
    zstd::encode_all(data, LEVEL)
}

pub fn decompress(data: &[u8]) -> io::Result<Vec<u8>> {
    zstd::decode_all(data)
}
