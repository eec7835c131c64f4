use std::path::{Path, PathBuf};

use anyhow::Result;

/// A hook invoked between encoding and decoding in a [`roundtrip`](super::roundtrip).
///
/// Implement this trait to inject custom logic between the encode and decode
/// steps: uploading the encoded video to a lossy host and downloading it
/// back, or running it through an extra transcode to measure survivability.
pub trait PipelineHook {
    /// Called after encoding completes. `encoded_path` is the local path of
    /// the freshly written video. Return the path the decoder should read
    /// from; this may be the same file, or a transformed copy.
    fn after_encode(&self, encoded_path: &Path) -> Result<PathBuf>;
}

/// A no-op hook that passes the encoded path through unchanged.
pub struct NoopHook;

impl PipelineHook for NoopHook {
    fn after_encode(&self, encoded_path: &Path) -> Result<PathBuf> {
        Ok(encoded_path.to_path_buf())
    }
}
