use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

mod commands;
mod config;

use commands::prepare::PrepareArgs;
use commands::train::TrainArgs;
use config::load_config;

/// lorafit: LoRA fine-tuning for Llama-family models
#[derive(Debug, Parser)]
#[command(name = "lorafit", version, about, long_about = None, arg_required_else_help = true)]
struct Cli {
    /// Path to a custom configuration file (TOML).
    #[arg(long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Log format: "pretty" (default) or "json".
    #[arg(long, global = true, default_value = "pretty", value_name = "FORMAT")]
    log_format: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Fine-tune LoRA adapters on an instruction dataset.
    Train(Box<TrainArgs>),

    /// Tokenize and filter a dataset without training, printing length stats.
    Prepare(PrepareArgs),

    /// List available prompt templates.
    Templates,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    init_tracing(&cli.log_format);

    let cfg = load_config(cli.config.as_ref()).context("Failed to load configuration")?;

    match cli.command {
        Commands::Train(args) => {
            commands::train::run(*args, &cfg).await?;
        }
        Commands::Prepare(args) => {
            commands::prepare::run(args, &cfg).await?;
        }
        Commands::Templates => {
            commands::templates::run(&cfg)?;
        }
    }

    Ok(())
}

fn init_tracing(log_format: &str) {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let registry = tracing_subscriber::registry().with(env_filter);

    if log_format == "json" {
        registry.with(fmt::layer().json()).init();
    } else {
        registry.with(fmt::layer().pretty()).init();
    }
}
