//! Cluster worker: fetches job batches from the master, renders frames on a
//! local pool, and streams compressed rasters back.
//!
//! Three cooperating loops: a fetcher with linear backoff, renderer threads
//! each owning an RS codec and a reusable RGBA raster, and a sender that
//! flushes results every 500 ms or at a full batch. The raster is safe to
//! reuse because each result is compressed (copied) before the next frame
//! overwrites the buffer.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use anyhow::{Context, Result};
use crossbeam_channel::{bounded, select, tick, Receiver, Sender};
use log::{info, warn};
use reqwest::blocking::Client;

use crate::calibration;
use crate::config::BATCH_SIZE;
use crate::ecc::EccEncoder;
use crate::frame::Frame;
use crate::video;

use super::compress;
use super::protocol::{self, FrameJob, FrameResult, JobConfig, WorkerInfo};

/// Give up after this many consecutive fetch failures.
const MAX_FETCH_RETRIES: u32 = 10;

pub struct Worker {
    master_url: String,
    threads: usize,
}

impl Worker {
    pub fn new(master_url: &str, threads: usize) -> Self {
        let threads = if threads == 0 {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        } else {
            threads
        };
        Worker {
            master_url: master_url.trim_end_matches('/').to_string(),
            threads,
        }
    }

    pub fn run(&self) -> Result<()> {
        let client = Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .context("build http client")?;

        info!("connecting to master: {}", self.master_url);
        let config: JobConfig = client
            .get(format!("{}/config", self.master_url))
            .send()
            .context("fetch config")?
            .error_for_status()
            .context("fetch config")?
            .json()
            .context("decode config")?;
        info!(
            "connected: {}x{}, {} total frames, {} threads",
            config.width, config.height, config.total_frames, self.threads
        );

        self.register(&client);

        let (job_tx, job_rx) = bounded::<FrameJob>(BATCH_SIZE * 2);
        let (result_tx, result_rx) = bounded::<FrameResult>(BATCH_SIZE * 2);
        let stop = AtomicBool::new(false);
        let processed = AtomicU64::new(0);

        std::thread::scope(|scope| {
            scope.spawn(|| self.fetch_loop(&client, job_tx, &stop));

            for _ in 0..self.threads {
                let job_rx = job_rx.clone();
                let result_tx = result_tx.clone();
                let config = &config;
                let processed = &processed;
                scope.spawn(move || process_loop(config, job_rx, result_tx, processed));
            }
            drop(job_rx);
            drop(result_tx);

            scope.spawn(|| self.send_loop(&client, result_rx));
        });

        info!("work completed: {} frames rendered", processed.load(Ordering::Relaxed));
        Ok(())
    }

    fn register(&self, client: &Client) {
        let info = WorkerInfo::local(self.threads);
        // Registration is advisory; the master counts us when it succeeds.
        if let Err(e) = client
            .post(format!("{}/register", self.master_url))
            .json(&info)
            .send()
        {
            warn!("register failed: {e}");
        }
    }

    /// Poll `/batch` until the master reports completion, feeding jobs into
    /// the channel. Backoff is linear in the consecutive failure count.
    fn fetch_loop(&self, client: &Client, job_tx: Sender<FrameJob>, stop: &AtomicBool) {
        let url = format!("{}/batch", self.master_url);
        let mut retries: u32 = 0;

        while !stop.load(Ordering::Acquire) {
            // Flow control: leave room for a whole batch before fetching.
            if job_tx.len() > job_tx.capacity().unwrap_or(usize::MAX) - BATCH_SIZE {
                std::thread::sleep(Duration::from_millis(100));
                continue;
            }

            let response = match client.get(&url).send() {
                Ok(response) => response,
                Err(e) => {
                    retries += 1;
                    if retries > MAX_FETCH_RETRIES {
                        warn!("too many fetch errors, stopping: {e}");
                        stop.store(true, Ordering::Release);
                        break;
                    }
                    std::thread::sleep(Duration::from_secs(retries as u64));
                    continue;
                }
            };

            match response.status().as_u16() {
                204 => break, // all jobs handed out
                202 => {
                    // Master not distributing yet, or queue momentarily empty.
                    std::thread::sleep(Duration::from_millis(500));
                    continue;
                }
                200 => {}
                code => {
                    warn!("unexpected batch status {code}");
                    std::thread::sleep(Duration::from_secs(1));
                    continue;
                }
            }

            retries = 0;
            let body = match response.bytes() {
                Ok(body) => body,
                Err(e) => {
                    warn!("read batch body: {e}");
                    continue;
                }
            };
            let batch = match protocol::decode_jobs(&body) {
                Ok(batch) => batch,
                Err(e) => {
                    warn!("decode batch: {e}");
                    continue;
                }
            };
            for job in batch {
                if job_tx.send(job).is_err() {
                    return; // renderers gone
                }
            }
        }
        // Dropping job_tx closes the channel and winds down the renderers.
    }

    /// Batch results and post them, flushing every 500 ms or at a full batch.
    fn send_loop(&self, client: &Client, result_rx: Receiver<FrameResult>) {
        let url = format!("{}/batch", self.master_url);
        let ticker = tick(Duration::from_millis(500));
        let mut buffer: Vec<FrameResult> = Vec::new();

        loop {
            select! {
                recv(result_rx) -> msg => match msg {
                    Ok(result) => {
                        buffer.push(result);
                        if buffer.len() >= BATCH_SIZE {
                            flush_results(client, &url, &mut buffer);
                        }
                    }
                    Err(_) => {
                        flush_results(client, &url, &mut buffer);
                        return;
                    }
                },
                recv(ticker) -> _ => flush_results(client, &url, &mut buffer),
            }
        }
    }
}

fn flush_results(client: &Client, url: &str, buffer: &mut Vec<FrameResult>) {
    if buffer.is_empty() {
        return;
    }
    let body = match protocol::encode_results(buffer) {
        Ok(body) => body,
        Err(e) => {
            warn!("encode result batch: {e}");
            buffer.clear();
            return;
        }
    };

    for attempt in 1..=5 {
        match client
            .post(url)
            .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
            .body(body.clone())
            .send()
        {
            Ok(response) if response.status().is_success() => break,
            Ok(response) => warn!("send batch status {} (retry {attempt})", response.status()),
            Err(e) => warn!("send batch error (retry {attempt}): {e}"),
        }
        std::thread::sleep(Duration::from_millis(500));
    }
    buffer.clear();
}

/// Renderer: one RS codec and one raster buffer per thread, reused across
/// frames.
fn process_loop(
    config: &JobConfig,
    job_rx: Receiver<FrameJob>,
    result_tx: Sender<FrameResult>,
    processed: &AtomicU64,
) {
    let frame_cfg = config.frame_config();
    let ecc_cfg = config.ecc_config();
    let ecc = match EccEncoder::new(ecc_cfg) {
        Ok(ecc) => ecc,
        Err(e) => {
            warn!("renderer init failed: {e}");
            return;
        }
    };

    let mut raster = vec![0u8; frame_cfg.width * frame_cfg.height * 4];
    calibration::render_band_rgba(&mut raster, frame_cfg.width, frame_cfg.calibration_height);
    let mut cells = Vec::new();

    for job in job_rx.iter() {
        let index = job.frame_index;
        let result = Frame::new(
            frame_cfg,
            ecc_cfg,
            index,
            &job.data,
            config.total_frames as u32,
        )
        .and_then(|frame| frame.render(&ecc, &mut cells))
        .map(|()| {
            // Every data cell is redrawn, so the raster needs no clearing.
            video::draw_cells_rgba(&frame_cfg, &cells, &mut raster);
            FrameResult {
                frame_index: index,
                compressed_pixels: compress::compress_pixels(&raster),
                width: frame_cfg.width as u32,
                height: frame_cfg.height as u32,
                error: String::new(),
            }
        })
        .unwrap_or_else(|e| FrameResult {
            frame_index: index,
            compressed_pixels: Vec::new(),
            width: 0,
            height: 0,
            error: e.to_string(),
        });

        processed.fetch_add(1, Ordering::Relaxed);
        if result_tx.send(result).is_err() {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{EccConfig, FrameConfig, Redundancy};
    use crate::reconstruct::{FrameOutcome, FrameReconstructor};
    use crate::video::Raster;

    fn test_config(total_frames: usize) -> JobConfig {
        JobConfig::new(
            FrameConfig::default(),
            EccConfig::new(Redundancy::Medium),
            total_frames,
            0,
            [0u8; 32],
        )
    }

    #[test]
    fn test_process_loop_renders_decodable_frames() {
        let config = test_config(2);
        let (job_tx, job_rx) = bounded(4);
        let (result_tx, result_rx) = bounded(4);
        let processed = AtomicU64::new(0);

        job_tx
            .send(FrameJob {
                frame_index: 0,
                data: b"cluster payload".to_vec(),
            })
            .unwrap();
        job_tx
            .send(FrameJob {
                frame_index: 1,
                data: b" second frame".to_vec(),
            })
            .unwrap();
        drop(job_tx);

        process_loop(&config, job_rx, result_tx, &processed);
        assert_eq!(processed.load(Ordering::Relaxed), 2);

        let frame_cfg = config.frame_config();
        let reconstructor = FrameReconstructor::new(crate::config::Preset::Default);
        let mut payloads = std::collections::HashMap::new();
        for result in result_rx.iter() {
            assert!(result.error.is_empty(), "{}", result.error);
            let rgba = compress::decompress_pixels(&result.compressed_pixels).unwrap();
            assert_eq!(rgba.len(), frame_cfg.width * frame_cfg.height * 4);

            // The reconstructor reads rgb24; strip alpha.
            let mut raster = Raster::new(frame_cfg.width, frame_cfg.height);
            for (dst, src) in raster.pix.chunks_exact_mut(3).zip(rgba.chunks_exact(4)) {
                dst.copy_from_slice(&src[..3]);
            }

            match reconstructor.process_raster(&raster) {
                FrameOutcome::Decoded(frame) => {
                    payloads.insert(frame.header.frame_index, frame.payload);
                }
                FrameOutcome::Lost => panic!("worker-rendered frame did not decode"),
            }
        }

        assert_eq!(payloads[&0], b"cluster payload");
        assert_eq!(payloads[&1], b" second frame");
    }

    #[test]
    fn test_process_loop_reports_oversized_frame_as_error() {
        let config = test_config(1);
        let (job_tx, job_rx) = bounded(1);
        let (result_tx, result_rx) = bounded(1);
        let processed = AtomicU64::new(0);

        let frame_cfg = config.frame_config();
        job_tx
            .send(FrameJob {
                frame_index: 0,
                data: vec![0u8; frame_cfg.bytes_per_frame()],
            })
            .unwrap();
        drop(job_tx);

        process_loop(&config, job_rx, result_tx, &processed);
        let result = result_rx.recv().unwrap();
        assert!(!result.error.is_empty());
        assert!(result.compressed_pixels.is_empty());
    }
}
