use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use food_volume::{OnnxVolumePredictor, PipelineConfig};
use serde_json::json;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "predict-volume")]
#[command(about = "Estimate the volume of food items in a photograph")]
struct Cli {
    /// Image to analyze
    image: PathBuf,

    /// JSON pipeline configuration
    #[arg(long)]
    config: Option<PathBuf>,

    /// Emit logs as JSON
    #[arg(long)]
    json_logs: bool,

    /// Include stage timings and dropped instance count
    #[arg(long)]
    report: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.json_logs);

    let config = match &cli.config {
        Some(path) => PipelineConfig::from_json_file(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => PipelineConfig::default(),
    }
    .with_env_overrides();

    let predictor = OnnxVolumePredictor::from_config(&config).context("loading models")?;
    let report = predictor
        .predict_with_report(cli.image.as_path())
        .with_context(|| format!("predicting {}", cli.image.display()))?;

    info!(
        predictions = report.predictions.len(),
        total_ms = report.timings.total_ms,
        "done"
    );

    let output = if cli.report {
        json!({
            "volume_predictions": report.predictions,
            "dropped": report.dropped,
            "timings": report.timings,
        })
    } else {
        json!({ "volume_predictions": report.predictions })
    };
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

fn init_tracing(json_logs: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json_logs {
        builder.json().init();
    } else {
        builder.init();
    }
}
