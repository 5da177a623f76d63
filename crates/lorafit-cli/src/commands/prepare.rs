//! `lorafit prepare`: run the dataset stage on its own.
//!
//! Loads, splits, tokenizes and length-filters the dataset exactly as
//! `train` would, writes the examples as JSON Lines and prints length
//! statistics.  Useful for checking label masking and the effect of
//! `--seq-min` / `--seq-max` before a long run.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Args;

use super::DatasetArgs;
use crate::config::AppConfig;

#[derive(Debug, Clone, Args)]
pub struct PrepareArgs {
    #[command(flatten)]
    pub data: DatasetArgs,

    /// Directory for train.jsonl / val.jsonl.
    #[arg(long, default_value = "./prepared")]
    pub out_dir: PathBuf,
}

pub async fn run(args: PrepareArgs, config: &AppConfig) -> Result<()> {
    let cfg = args.data.resolve(config).await?;
    let out_dir = args.out_dir;
    let report = tokio::task::spawn_blocking(move || lorafit_train::prepare(&cfg, &out_dir))
        .await
        .context("Preparation task panicked")??;

    println!("train: {}", report.train);
    if report.val.count > 0 {
        println!("val:   {}", report.val);
    }
    println!("filtered out by length: {}", report.filtered_out);
    for file in &report.files {
        println!("  {}", file.display());
    }
    Ok(())
}
