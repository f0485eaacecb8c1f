//! annotation-qc - batch agreement check over a directory of annotator tables
//!
//! **Usage:**
//! ```bash
//! annotation-qc annotations/ --config qc.toml --output-dir out/
//! ```
//!
//! `annotations/` holds one sub-directory per annotator, each with any number
//! of CSV files. Writes `quality_report.json` and `flagged_items.csv`.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;

use annotation_qc::{pipeline, QualityConfig};

/// Multi-annotator agreement and quality control
#[derive(Parser, Debug)]
#[command(name = "annotation-qc")]
#[command(about = "Measure agreement between annotators and flag unreliable annotations")]
#[command(version)]
struct Args {
    /// Directory with one sub-directory of CSV files per annotator
    input_dir: PathBuf,

    /// TOML configuration file
    #[arg(short, long, value_name = "FILE", env = "ANNOTATION_QC_CONFIG")]
    config: Option<PathBuf>,

    /// Directory for quality_report.json and flagged_items.csv
    #[arg(short, long, value_name = "DIR", default_value = ".")]
    output_dir: PathBuf,

    /// Override match_threshold
    #[arg(long, value_name = "IOU")]
    match_threshold: Option<f64>,

    /// Override the label map file
    #[arg(long, value_name = "FILE")]
    label_map: Option<PathBuf>,

    /// Worker threads (0 = available cores)
    #[arg(short, long)]
    workers: Option<usize>,

    /// Debug logging (RUST_LOG takes precedence)
    #[arg(short, long)]
    verbose: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();

    let default_filter = if args.verbose {
        "annotation_qc=debug"
    } else {
        "annotation_qc=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_filter)),
        )
        .init();

    let mut config = match &args.config {
        Some(path) => QualityConfig::from_toml_file(path)
            .with_context(|| format!("Failed to load config {}", path.display()))?,
        None => QualityConfig::default(),
    };
    if let Some(threshold) = args.match_threshold {
        config.match_threshold = threshold;
    }
    if let Some(workers) = args.workers {
        config.workers = workers;
    }
    if let Some(label_map) = args.label_map {
        config.label_map = Some(label_map);
    }
    config.validate().context("Invalid configuration")?;

    info!("Reading annotations from {}", args.input_dir.display());
    let report = pipeline::run_dir(&args.input_dir, &config)
        .with_context(|| format!("Quality analysis of {} failed", args.input_dir.display()))?;

    std::fs::create_dir_all(&args.output_dir)
        .with_context(|| format!("Failed to create {}", args.output_dir.display()))?;
    report
        .write_json(args.output_dir.join("quality_report.json"))
        .context("Failed to write quality report")?;
    report
        .write_flagged_csv(args.output_dir.join("flagged_items.csv"))
        .context("Failed to write flagged items")?;

    print!("{}", report.summary_text());
    Ok(())
}
