//! stonewatch CLI - detect the last move in a capture, or evaluate a batch
//! of labeled screenshots.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use stonewatch::{batch, hint, DetectorConfig, Detector};

/// Last-move detection for 19x19 Go client screenshots
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "stonewatch.toml")]
    config: PathBuf,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Detect the last move in a single screenshot
    Detect {
        /// Screenshot to analyze
        image: PathBuf,

        /// Move number, when known (parity fixes the color)
        #[arg(short, long)]
        move_number: Option<u32>,

        /// Free OCR text to extract the move number from, e.g. "第 127 手"
        #[arg(long)]
        hint_text: Option<String>,

        /// Directory to write the diagnostics JSON into
        #[arg(long)]
        diagnostics: Option<PathBuf>,
    },

    /// Run detection over a directory of labeled screenshots
    Batch {
        /// Directory of `<move>-<coord>-<color>.png` files
        dir: PathBuf,
    },
}

fn main() -> Result<()> {
    let args = Args::parse();

    let log_level = if args.verbose { Level::DEBUG } else { Level::INFO };
    let _subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .compact()
        .init();

    info!("stonewatch v{}", env!("CARGO_PKG_VERSION"));

    let config = DetectorConfig::load_or_create(&args.config)?;
    let detector = Detector::new(config);

    match args.command {
        Command::Detect {
            image,
            move_number,
            hint_text,
            diagnostics,
        } => {
            let img = image::open(&image)
                .with_context(|| format!("Failed to open {:?}", image))?
                .to_rgb8();

            let hint = move_number
                .or_else(|| hint_text.as_deref().and_then(hint::extract_move_number));

            let detection = detector.detect(&img, hint, None)?;
            info!(
                "move {} {} at {} (confidence {:.2})",
                detection.move_number,
                detection.color.as_str(),
                detection.coord_text,
                detection.confidence
            );
            println!("{}", serde_json::to_string_pretty(&detection)?);

            if let Some(dir) = diagnostics {
                let case_id = image
                    .file_stem()
                    .and_then(|s| s.to_str())
                    .unwrap_or("detection");
                let path = detection.diagnostics.dump(&dir, case_id)?;
                info!("diagnostics written to {:?}", path);
            }
        }
        Command::Batch { dir } => {
            let stats = batch::run_batch(&dir, &detector)?;
            println!("{}", serde_json::to_string_pretty(&stats)?);
        }
    }

    Ok(())
}
