use std::path::{Path, PathBuf};
use std::process::Command;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use ncc::config::{Preset, Redundancy};
use ncc::{NoopHook, pipeline};

/// ncc: encode arbitrary files into transcode-resistant video and back.
#[derive(Parser)]
#[command(name = "ncc", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Encode a file into a video
    Encode {
        /// Input file path
        #[arg(short, long)]
        input: PathBuf,

        /// Output video path (default: <input>_ncc.mp4)
        #[arg(short, long)]
        output: Option<String>,

        /// Encrypt the payload with a password
        #[arg(short, long)]
        password: Option<String>,

        /// Redundancy level: low, medium, high
        #[arg(short, long, default_value = "medium")]
        redundancy: String,

        /// Preset: default, fast, youtube, dense
        #[arg(long, default_value = "default")]
        preset: String,

        /// Render threads (0 = all cores minus two)
        #[arg(short, long, default_value_t = 0)]
        threads: usize,
    },

    /// Decode a video back into the original file
    Decode {
        /// Input video path
        #[arg(short, long)]
        input: String,

        /// Output file path (default: <input>_recovered.bin)
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Decryption password (required if the payload was encrypted)
        #[arg(short, long)]
        password: Option<String>,

        /// Preset used at encode time
        #[arg(long, default_value = "default")]
        preset: String,
    },

    /// Loopback consistency check: encode to a temp video, decode, compare
    Analyze {
        /// Input file path
        #[arg(short, long)]
        input: PathBuf,

        #[arg(short, long)]
        password: Option<String>,

        #[arg(short, long, default_value = "medium")]
        redundancy: String,

        #[arg(long, default_value = "default")]
        preset: String,
    },

    /// Verify the external toolchain is available
    Check,

    /// Serve frame-render jobs to cluster workers and mux their results
    Master {
        /// Input file path
        #[arg(short, long)]
        input: PathBuf,

        /// Output video path (default: <input>_ncc.mp4)
        #[arg(short, long)]
        output: Option<String>,

        #[arg(short, long)]
        password: Option<String>,

        #[arg(short, long, default_value = "medium")]
        redundancy: String,

        #[arg(long, default_value = "default")]
        preset: String,

        /// Port to listen on
        #[arg(long, default_value_t = 9090)]
        port: u16,
    },

    /// Fetch and render frames for a cluster master
    Worker {
        /// Master base URL, e.g. http://localhost:9090
        #[arg(short, long)]
        master: String,

        /// Render threads (0 = all cores)
        #[arg(short, long, default_value_t = 0)]
        threads: usize,
    },
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Encode {
            input,
            output,
            password,
            redundancy,
            preset,
            threads,
        } => {
            let output = output.unwrap_or_else(|| derived_output(&input, "_ncc.mp4"));
            pipeline::encode::encode_file(
                &input,
                &output,
                password.as_deref(),
                parse_redundancy(&redundancy)?,
                parse_preset(&preset)?,
                threads,
            )
        }

        Commands::Decode {
            input,
            output,
            password,
            preset,
        } => {
            let output = output
                .unwrap_or_else(|| PathBuf::from(derived_output(Path::new(&input), "_recovered.bin")));
            pipeline::decode::decode_file(
                &input,
                &output,
                password.as_deref(),
                parse_preset(&preset)?,
            )
        }

        Commands::Analyze {
            input,
            password,
            redundancy,
            preset,
        } => run_analyze(
            &input,
            password.as_deref(),
            parse_redundancy(&redundancy)?,
            parse_preset(&preset)?,
        ),

        Commands::Check => run_check(),

        Commands::Master {
            input,
            output,
            password,
            redundancy,
            preset,
            port,
        } => {
            let output = output.unwrap_or_else(|| derived_output(&input, "_ncc.mp4"));
            pipeline::encode::encode_with_cluster(
                &input,
                &output,
                password.as_deref(),
                parse_redundancy(&redundancy)?,
                parse_preset(&preset)?,
                port,
            )
        }

        Commands::Worker { master, threads } => {
            ncc::cluster::worker::Worker::new(&master, threads).run()
        }
    }
}

fn parse_redundancy(s: &str) -> Result<Redundancy> {
    s.parse().map_err(anyhow::Error::msg)
}

fn parse_preset(s: &str) -> Result<Preset> {
    s.parse().map_err(anyhow::Error::msg)
}

/// `<input without extension><suffix>` in the input's directory.
fn derived_output(input: &Path, suffix: &str) -> String {
    let stem = input.with_extension("");
    format!("{}{}", stem.display(), suffix)
}

fn run_analyze(
    input: &Path,
    password: Option<&str>,
    redundancy: Redundancy,
    preset: Preset,
) -> Result<()> {
    let dir = std::env::temp_dir().join(format!("ncc-analyze-{}", std::process::id()));
    std::fs::create_dir_all(&dir)?;
    let encoded = dir.join("loopback.mp4");
    let decoded = dir.join("loopback.bin");

    let result = pipeline::roundtrip(
        input,
        encoded.to_str().expect("temp path is utf8"),
        &decoded,
        password,
        redundancy,
        preset,
        0,
        &NoopHook,
    );
    std::fs::remove_dir_all(&dir).ok();

    let result = result?;
    println!("original: {}", result.original_hash);
    println!("decoded:  {}", result.decoded_hash);
    if result.matched {
        println!("payload survives the loopback bit-exact");
        Ok(())
    } else {
        anyhow::bail!("loopback mismatch: decoded output differs from input");
    }
}

fn run_check() -> Result<()> {
    let output = Command::new("ffmpeg")
        .arg("-version")
        .output()
        .context("ffmpeg not found on PATH")?;
    if !output.status.success() {
        anyhow::bail!("ffmpeg -version failed");
    }
    let stdout = String::from_utf8_lossy(&output.stdout);
    println!("ffmpeg found: {}", stdout.lines().next().unwrap_or(""));

    let output = Command::new("ffprobe")
        .arg("-version")
        .output()
        .context("ffprobe not found on PATH")?;
    if !output.status.success() {
        anyhow::bail!("ffprobe -version failed");
    }
    let stdout = String::from_utf8_lossy(&output.stdout);
    println!("ffprobe found: {}", stdout.lines().next().unwrap_or(""));
    Ok(())
}
