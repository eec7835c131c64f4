//! ncc: store arbitrary binary payloads inside lossy video containers.
//!
//! Payloads are compressed, optionally authenticated and encrypted, split
//! across frames protected by a systematic Reed-Solomon code, and rendered
//! as grayscale macro-pixel grids with an in-band calibration band. The
//! decoder self-calibrates brightness and geometry per frame and survives
//! generational H.264/VP9/AV1 transcoding at the configured macro-pixel
//! granularity.

pub mod calibration;
pub mod chunker;
pub mod cluster;
pub mod compress;
pub mod config;
pub mod crypto;
pub mod ecc;
pub mod frame;
pub mod integrity;
pub mod macropixel;
pub mod pipeline;
pub mod reconstruct;
pub mod video;

pub use config::{EccConfig, FrameConfig, Preset, Redundancy};
pub use pipeline::decode::decode_file;
pub use pipeline::encode::{encode_file, encode_with_cluster};
pub use pipeline::hook::{NoopHook, PipelineHook};
pub use pipeline::{roundtrip, RoundtripResult};
