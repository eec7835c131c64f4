use std::io::Write;
use std::process::{Child, ChildStdin, Command, Stdio};

use anyhow::{Context, Result};
use crossbeam_channel::{bounded, unbounded, Receiver, Sender};
use indicatif::{ProgressBar, ProgressStyle};
use log::info;

use crate::calibration;
use crate::chunker::FramePlan;
use crate::config::{EccConfig, FrameConfig, Preset, Redundancy};
use crate::ecc::EccEncoder;
use crate::frame::Frame;

/// Encode a payload into an H.264/MP4 video via an ffmpeg raw-RGBA pipe.
///
/// Rendering is spread over a worker pool; a collector reorders results and
/// streams them to the muxer in ascending frame order. Backpressure comes
/// from the bounded job channel and ultimately from the muxer's pipe.
pub struct VideoEncoder {
    pub frame_cfg: FrameConfig,
    pub ecc_cfg: EccConfig,
    pub threads: usize,
    pub preset: Preset,
}

struct FrameJob<'a> {
    index: u32,
    data: &'a [u8],
}

struct RenderedFrame {
    index: u32,
    cells: Vec<u8>,
}

impl VideoEncoder {
    pub fn new(redundancy: Redundancy, threads: usize, preset: Preset) -> Self {
        let threads = if threads == 0 {
            crate::config::default_threads()
        } else {
            threads
        };
        VideoEncoder {
            frame_cfg: FrameConfig::preset(preset),
            ecc_cfg: EccConfig::new(redundancy),
            threads,
            preset,
        }
    }

    /// Encode `payload` (already compressed/encrypted) into `output_path`.
    pub fn encode_to_file(&self, output_path: &str, payload: &[u8]) -> Result<()> {
        let plan = FramePlan::new(self.frame_cfg, self.ecc_cfg, payload.len());
        info!(
            "encoding {} bytes into {} frames ({}x{} @ {} fps, {} threads)",
            payload.len(),
            plan.total_frames,
            self.frame_cfg.width,
            self.frame_cfg.height,
            self.frame_cfg.fps,
            self.threads
        );

        let (mut child, stdin) = self.spawn_muxer(output_path)?;
        let write_result = self.render_frames(payload, &plan, stdin);

        // Stdin is dropped inside render_frames (EOF); the muxer then
        // finalizes the container.
        let status = child.wait().context("ffmpeg process failed")?;
        write_result?;
        if !status.success() {
            anyhow::bail!("ffmpeg exited with status: {}", status);
        }

        info!("video encoding complete: {}", output_path);
        Ok(())
    }

    /// Dispatch render jobs, collect results in order, stream to the muxer.
    fn render_frames(&self, payload: &[u8], plan: &FramePlan, stdin: ChildStdin) -> Result<()> {
        let total_frames = plan.total_frames;
        let channel_cap = (4 * self.threads).min(total_frames).max(1);

        let (job_tx, job_rx) = bounded::<FrameJob>(channel_cap);
        let (result_tx, result_rx) = bounded::<Result<RenderedFrame>>(channel_cap);
        // Cell buffers cycle worker -> collector -> pool. Allocation only
        // happens while the pool is warming up.
        let (pool_tx, pool_rx) = unbounded::<Vec<u8>>();

        std::thread::scope(|scope| -> Result<()> {
            for _ in 0..self.threads {
                let job_rx = job_rx.clone();
                let result_tx = result_tx.clone();
                let pool_rx = pool_rx.clone();
                let frame_cfg = self.frame_cfg;
                let ecc_cfg = self.ecc_cfg;
                let total = total_frames as u32;
                scope.spawn(move || {
                    let ecc = match EccEncoder::new(ecc_cfg) {
                        Ok(ecc) => ecc,
                        Err(e) => {
                            let _ = result_tx.send(Err(anyhow::Error::from(e)));
                            return;
                        }
                    };
                    for job in job_rx.iter() {
                        let mut cells = pool_rx.try_recv().unwrap_or_default();
                        let rendered = Frame::new(frame_cfg, ecc_cfg, job.index, job.data, total)
                            .and_then(|frame| {
                                frame.render(&ecc, &mut cells)?;
                                Ok(RenderedFrame {
                                    index: job.index,
                                    cells,
                                })
                            })
                            .map_err(|e| {
                                anyhow::Error::from(e)
                                    .context(format!("render frame {}", job.index))
                            });
                        if result_tx.send(rendered).is_err() {
                            break; // collector gone
                        }
                    }
                });
            }
            drop(result_tx);

            scope.spawn(move || {
                for i in 0..total_frames {
                    let span = plan.span(i, payload.len());
                    let job = FrameJob {
                        index: span.index,
                        data: &payload[span.start..span.end],
                    };
                    if job_tx.send(job).is_err() {
                        break; // encode aborted
                    }
                }
            });
            drop(job_rx);

            self.collect_and_write(result_rx, pool_tx, stdin, total_frames)
        })
    }

    /// Single consumer: buffers out-of-order results and writes strictly
    /// ascending frame indices to the muxer pipe.
    fn collect_and_write(
        &self,
        result_rx: Receiver<Result<RenderedFrame>>,
        pool_tx: Sender<Vec<u8>>,
        mut stdin: ChildStdin,
        total_frames: usize,
    ) -> Result<()> {
        let width = self.frame_cfg.width;
        let height = self.frame_cfg.height;
        let band_height = self.frame_cfg.calibration_height;

        // The calibration band never changes; render it once and reuse.
        let mut raster = vec![0u8; width * height * 4];
        calibration::render_band_rgba(&mut raster, width, band_height);
        let band: Vec<u8> = raster[..band_height * width * 4].to_vec();

        let progress = ProgressBar::new(total_frames as u64);
        progress.set_style(
            ProgressStyle::default_bar()
                .template("[{elapsed_precise}] {bar:40.cyan/blue} {pos}/{len} frames ({eta})")
                .unwrap()
                .progress_chars("##-"),
        );

        let mut pending: std::collections::HashMap<u32, Vec<u8>> = std::collections::HashMap::new();
        let mut next_index: u32 = 0;

        for result in result_rx.iter() {
            let rendered = result?;
            pending.insert(rendered.index, rendered.cells);

            while let Some(cells) = pending.remove(&next_index) {
                raster[..band.len()].copy_from_slice(&band);
                super::draw_cells_rgba(&self.frame_cfg, &cells, &mut raster);
                stdin
                    .write_all(&raster)
                    .with_context(|| format!("write frame {next_index} to ffmpeg"))?;
                let _ = pool_tx.send(cells);
                progress.inc(1);
                next_index += 1;
            }
        }
        progress.finish_and_clear();

        if (next_index as usize) < total_frames {
            anyhow::bail!(
                "encode stopped early: wrote {} of {} frames",
                next_index,
                total_frames
            );
        }
        drop(stdin); // EOF tells the muxer to finalize
        Ok(())
    }

    /// Start the external muxer reading raw RGBA frames on stdin.
    pub fn spawn_muxer(&self, output_path: &str) -> Result<(Child, ChildStdin)> {
        let mut args: Vec<String> = vec![
            "-y".into(),
            "-f".into(),
            "rawvideo".into(),
            "-pixel_format".into(),
            "rgba".into(),
            "-video_size".into(),
            format!("{}x{}", self.frame_cfg.width, self.frame_cfg.height),
            "-framerate".into(),
            self.frame_cfg.fps.to_string(),
            "-i".into(),
            "pipe:0".into(),
            "-c:v".into(),
            "libx264".into(),
        ];
        if self.preset == Preset::Fast {
            args.extend(["-preset".into(), "ultrafast".into(), "-crf".into(), "23".into()]);
        } else {
            args.extend(["-preset".into(), "slow".into(), "-crf".into(), "23".into()]);
        }
        args.extend([
            "-pix_fmt".into(),
            "yuv420p".into(),
            "-movflags".into(),
            "+faststart".into(),
            output_path.into(),
        ]);

        let mut child = Command::new("ffmpeg")
            .args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .context("failed to spawn ffmpeg process, is ffmpeg installed?")?;

        let stdin = child.stdin.take().expect("stdin was requested as piped");
        Ok((child, stdin))
    }
}
