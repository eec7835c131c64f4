use std::io::Read;
use std::process::{Child, ChildStdout, Command, Stdio};

use anyhow::{Context, Result};
use log::info;

use crate::video::Raster;

/// Pull decoded frames out of a video container via the external decoder.
///
/// The stream geometry is probed first so the decoder side can adopt the
/// observed dimensions even when they differ from the encode configuration.
/// Frames arrive as raw rgb24 over a pipe, in the container's natural order.
pub struct FrameExtractor {
    pub width: usize,
    pub height: usize,
    input_path: String,
}

impl FrameExtractor {
    pub fn probe(input_path: &str) -> Result<Self> {
        let output = Command::new("ffprobe")
            .args([
                "-v",
                "error",
                "-select_streams",
                "v:0",
                "-show_entries",
                "stream=width,height",
                "-of",
                "csv=s=x:p=0",
                input_path,
            ])
            .output()
            .context("failed to run ffprobe, is ffmpeg installed?")?;
        if !output.status.success() {
            anyhow::bail!(
                "ffprobe failed for {}: {}",
                input_path,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }

        let text = String::from_utf8_lossy(&output.stdout);
        let dims = text.trim().lines().next().unwrap_or("");
        let (w, h) = dims
            .split_once('x')
            .with_context(|| format!("unexpected ffprobe output: {dims:?}"))?;
        let width: usize = w.trim().parse().context("parse stream width")?;
        let height: usize = h.trim().parse().context("parse stream height")?;

        info!("probed {}: {}x{}", input_path, width, height);
        Ok(FrameExtractor {
            width,
            height,
            input_path: input_path.to_string(),
        })
    }

    /// Start the external decoder and stream frames.
    pub fn open(&self) -> Result<FrameStream> {
        let mut child = Command::new("ffmpeg")
            .args([
                "-i",
                &self.input_path,
                "-f",
                "rawvideo",
                "-pixel_format",
                "rgb24",
                "-vsync",
                "0",
                "pipe:1",
            ])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .context("failed to spawn ffmpeg for decoding")?;

        let stdout = child.stdout.take().expect("stdout was requested as piped");
        Ok(FrameStream {
            child,
            stdout,
            width: self.width,
            height: self.height,
            frames_read: 0,
        })
    }
}

/// A running decode pipe. Frames are read one at a time; `finish` reaps the
/// external process.
pub struct FrameStream {
    child: Child,
    stdout: ChildStdout,
    width: usize,
    height: usize,
    frames_read: u64,
}

impl FrameStream {
    /// Read the next frame, or `None` at clean end of stream.
    pub fn next_frame(&mut self) -> Result<Option<Raster>> {
        let mut raster = Raster::new(self.width, self.height);
        if read_exact_or_eof(&mut self.stdout, &mut raster.pix)? {
            self.frames_read += 1;
            Ok(Some(raster))
        } else {
            Ok(None)
        }
    }

    /// Wait for the external decoder and report its exit status.
    pub fn finish(mut self) -> Result<u64> {
        let status = self.child.wait().context("ffmpeg decode process failed")?;
        if !status.success() {
            anyhow::bail!("ffmpeg decode exited with status: {}", status);
        }
        info!("decoded {} frames", self.frames_read);
        Ok(self.frames_read)
    }
}

/// Read exactly `buf.len()` bytes, returning Ok(false) on clean EOF.
fn read_exact_or_eof(reader: &mut impl Read, buf: &mut [u8]) -> std::io::Result<bool> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => {
                if filled == 0 {
                    return Ok(false); // Clean EOF
                } else {
                    return Err(std::io::Error::new(
                        std::io::ErrorKind::UnexpectedEof,
                        "partial frame read",
                    ));
                }
            }
            Ok(n) => filled += n,
            Err(ref e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_exact_or_eof_full() {
        let data = vec![7u8; 12];
        let mut cursor = std::io::Cursor::new(data);
        let mut buf = vec![0u8; 12];
        assert!(read_exact_or_eof(&mut cursor, &mut buf).unwrap());
        assert_eq!(buf, vec![7u8; 12]);
        assert!(!read_exact_or_eof(&mut cursor, &mut buf).unwrap());
    }

    #[test]
    fn test_read_exact_or_eof_partial_is_error() {
        let data = vec![7u8; 5];
        let mut cursor = std::io::Cursor::new(data);
        let mut buf = vec![0u8; 12];
        assert!(read_exact_or_eof(&mut cursor, &mut buf).is_err());
    }
}
