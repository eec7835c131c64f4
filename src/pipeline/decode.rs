use std::path::Path;

use anyhow::{Context, Result};
use log::info;

use crate::compress;
use crate::config::Preset;
use crate::crypto;
use crate::reconstruct::FrameReconstructor;

/// Full decode pipeline: video -> frames -> [decrypt] -> decompress -> file.
pub fn decode_file(
    input_path: &str,
    output_path: &Path,
    password: Option<&str>,
    preset: Preset,
) -> Result<()> {
    if std::fs::metadata(input_path).is_err() {
        anyhow::bail!("file not found: {input_path}");
    }

    let reconstructor = FrameReconstructor::new(preset);
    let mut payload = reconstructor
        .reconstruct_payload(input_path)
        .context("reconstruct payload from video")?;

    if let Some(password) = password {
        payload = crypto::decrypt(&payload, password)?;
        info!("payload decrypted and authenticated");
    }

    let data = compress::decompress(&payload).context("decompress payload")?;
    info!("decompressed to {} bytes", data.len());

    std::fs::write(output_path, &data)
        .with_context(|| format!("write output file {}", output_path.display()))?;
    info!("file recovered: {}", output_path.display());
    Ok(())
}
