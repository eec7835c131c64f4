use std::collections::HashMap;
use std::io::{BufWriter, Write};
use std::path::Path;

use anyhow::{Context, Result};
use indicatif::{ProgressBar, ProgressStyle};
use log::info;

use crate::chunker::FramePlan;
use crate::cluster::compress::decompress_pixels;
use crate::cluster::master::Master;
use crate::cluster::protocol::{FrameJob, JobConfig};
use crate::compress;
use crate::config::{Preset, Redundancy};
use crate::crypto;
use crate::integrity;
use crate::video::encoder::VideoEncoder;

/// Read and prepare a payload: compress, then encrypt when a password is
/// given.
fn prepare_payload(input_path: &Path, password: Option<&str>) -> Result<Vec<u8>> {
    let meta = std::fs::metadata(input_path)
        .with_context(|| format!("file not found: {}", input_path.display()))?;
    if meta.is_dir() {
        anyhow::bail!(
            "'{}' is a directory, not a file; archive it first",
            input_path.display()
        );
    }
    if meta.len() == 0 {
        anyhow::bail!("input file is empty: {}", input_path.display());
    }

    let data = std::fs::read(input_path).context("read input file")?;
    info!("read {} bytes", data.len());

    let mut payload = compress::compress(&data).context("compress payload")?;
    info!("compressed to {} bytes", payload.len());

    if let Some(password) = password {
        payload = crypto::encrypt(&payload, password).context("encrypt payload")?;
        info!("encrypted, {} bytes", payload.len());
    }
    Ok(payload)
}

/// Full encode pipeline: file -> compress -> [encrypt] -> frames -> video.
pub fn encode_file(
    input_path: &Path,
    output_path: &str,
    password: Option<&str>,
    redundancy: Redundancy,
    preset: Preset,
    threads: usize,
) -> Result<()> {
    let payload = prepare_payload(input_path, password)?;

    let encoder = VideoEncoder::new(redundancy, threads, preset);
    encoder
        .encode_to_file(output_path, &payload)
        .context("encode video")?;

    info!("video saved: {output_path}");
    Ok(())
}

/// Cluster encode: same pipeline, but rendering is distributed to HTTP
/// workers and this process only performs the ordered write to the muxer.
///
/// Blocks on stdin between server start and distribution so the operator
/// can attach workers first.
pub fn encode_with_cluster(
    input_path: &Path,
    output_path: &str,
    password: Option<&str>,
    redundancy: Redundancy,
    preset: Preset,
    port: u16,
) -> Result<()> {
    let payload = prepare_payload(input_path, password)?;

    let encoder = VideoEncoder::new(redundancy, 0, preset);
    let plan = FramePlan::new(encoder.frame_cfg, encoder.ecc_cfg, payload.len());
    info!(
        "total frames: {} (capacity first={} rest={})",
        plan.total_frames, plan.capacity_first, plan.capacity_rest
    );

    let job_config = JobConfig::new(
        encoder.frame_cfg,
        encoder.ecc_cfg,
        plan.total_frames,
        payload.len() as u64,
        integrity::sha256(&payload),
    );
    let (master, results_rx) = Master::new(port, job_config);

    for span in plan.spans(payload.len()) {
        master.add_job(FrameJob {
            frame_index: span.index,
            data: payload[span.start..span.end].to_vec(),
        });
    }
    master.finish_adding_jobs();
    master.start_async()?;

    println!("waiting for workers; run on other machines:");
    println!("  ncc worker --master http://<this-host>:{port}");
    println!("press ENTER to start distributing jobs...");
    let mut line = String::new();
    std::io::stdin().read_line(&mut line).ok();

    master.start_distribution();
    info!("distribution started ({} workers attached)", master.active_workers());

    // Ordered write: buffer out-of-order results, stream ascending indices.
    let (mut child, stdin) = encoder.spawn_muxer(output_path)?;
    let mut writer = BufWriter::with_capacity(4 << 20, stdin);
    let frame_bytes = encoder.frame_cfg.width * encoder.frame_cfg.height * 4;

    let progress = ProgressBar::new(plan.total_frames as u64);
    progress.set_style(
        ProgressStyle::default_bar()
            .template("[{elapsed_precise}] {bar:40.cyan/blue} {pos}/{len} frames ({eta})")
            .unwrap()
            .progress_chars("##-"),
    );

    let mut pending: HashMap<u32, Vec<u8>> = HashMap::new();
    let mut next_index: u32 = 0;
    while (next_index as usize) < plan.total_frames {
        let result = results_rx
            .recv()
            .context("result channel closed before all frames arrived")?;
        if !result.error.is_empty() {
            anyhow::bail!("worker error frame {}: {}", result.frame_index, result.error);
        }
        pending.insert(result.frame_index, result.compressed_pixels);

        while let Some(compressed) = pending.remove(&next_index) {
            let pixels = decompress_pixels(&compressed)
                .with_context(|| format!("decompress frame {next_index}"))?;
            if pixels.len() < frame_bytes {
                anyhow::bail!(
                    "frame {next_index} pixel data too small: got {}, need {frame_bytes}",
                    pixels.len()
                );
            }
            writer
                .write_all(&pixels[..frame_bytes])
                .with_context(|| format!("write frame {next_index} to ffmpeg"))?;
            progress.inc(1);
            next_index += 1;
        }
    }
    progress.finish_and_clear();

    writer.flush().context("flush muxer pipe")?;
    drop(writer); // EOF
    let status = child.wait().context("ffmpeg process failed")?;
    if !status.success() {
        anyhow::bail!("ffmpeg exited with status: {}", status);
    }

    info!("video saved: {output_path}");
    Ok(())
}
