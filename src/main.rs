//! CLI entry point for seqcam
//!
//! Run a capture session against the simulated camera:
//! ```bash
//! seqcam run --frames 20 --fps 60
//! ```
//!
//! Check a configuration file:
//! ```bash
//! seqcam --config config/seqcam.toml check-config
//! ```

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use seqcam::config::{SeqcamConfig, DEFAULT_CONFIG_PATH};
use seqcam::logging;
use seqcam::run::{run_frames, RunOptions};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "seqcam")]
#[command(about = "Sequence-buffer camera acquisition", long_about = None)]
struct Cli {
    /// Configuration file (TOML)
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Capture frames from the simulated camera, then tear down
    Run {
        /// Frames to capture before stopping
        #[arg(long, default_value_t = 10)]
        frames: u64,

        /// Simulated sensor area of interest
        #[arg(long, default_value_t = 640)]
        width: u32,
        #[arg(long, default_value_t = 480)]
        height: u32,

        /// Simulated frame rate
        #[arg(long, default_value_t = 30.0)]
        fps: f64,

        /// Seconds to wait for each frame
        #[arg(long, default_value_t = 5)]
        frame_wait_secs: u64,
    },

    /// Load and validate the configuration, then print it
    CheckConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = SeqcamConfig::load_from(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;
    config.validate()?;

    match cli.command {
        Commands::Run {
            frames,
            width,
            height,
            fps,
            frame_wait_secs,
        } => {
            logging::init_from_config(&config).map_err(anyhow::Error::msg)?;
            let options = RunOptions {
                frames,
                width,
                height,
                fps,
                frame_wait: Duration::from_secs(frame_wait_secs),
            };
            run(&config, &options).await
        }
        Commands::CheckConfig => {
            println!("# effective configuration ({})", cli.config.display());
            print!("{}", config.to_toml()?);
            Ok(())
        }
    }
}

async fn run(config: &SeqcamConfig, options: &RunOptions) -> Result<()> {
    println!(
        "seqcam: {} buffers, {} bpp, {} mode, {}x{} @ {} fps",
        config.camera.buffer_count,
        config.camera.bits_per_pixel,
        config.camera.mode.as_str(),
        options.width,
        options.height,
        options.fps
    );

    let summary = run_frames(config, options, |frame| {
        println!(
            "frame {:>5}  buffer {:>2}  seq {:>2}  {} bytes  stamp {}",
            frame.frame_number,
            frame.index,
            frame.sequence,
            frame.bytes,
            frame
                .stamp
                .map_or_else(|| "-".to_string(), |s| s.to_string())
        );
    })
    .await?;

    let stats = summary.delivery;
    println!();
    println!(
        "delivered {}  skipped {}  wraparounds {}  lock failures {}",
        stats.delivered, stats.skipped, stats.wraparounds, stats.lock_failures
    );
    if let Some(status) = &summary.status {
        for (fault, count) in status.faults() {
            println!("capture fault {fault}: {count}");
        }
    }
    println!("teardown: {}", summary.teardown);

    if !summary.teardown.is_clean() {
        anyhow::bail!("teardown incomplete: {}", summary.teardown);
    }
    Ok(())
}
