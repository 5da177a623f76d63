//! `lorafit train`: fine-tune LoRA adapters on an instruction dataset.
//!
//! Base models and datasets that are not local paths are downloaded from
//! Hugging Face first.  Multi-process launches pass `--world-size` and
//! `--local-rank` (or the `WORLD_SIZE` / `LOCAL_RANK` environment variables);
//! each rank trains on its own shard of the data and only rank 0 writes.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Args;
use tracing::info;

use lorafit_core::DistributedContext;
use lorafit_train::{LoraConfig, SchedulerKind};

use super::DatasetArgs;
use crate::config::AppConfig;

#[derive(Debug, Clone, Args)]
pub struct TrainArgs {
    #[command(flatten)]
    pub data: DatasetArgs,

    /// Where checkpoints and the final adapter are written.
    #[arg(long, default_value = "./lora-alpaca")]
    pub output_dir: PathBuf,

    /// Examples per optimizer step.
    #[arg(long, default_value_t = 128)]
    pub batch_size: usize,

    /// Examples per forward/backward pass.
    #[arg(long, default_value_t = 8)]
    pub micro_batch_size: usize,

    #[arg(long, default_value_t = 1)]
    pub num_epochs: usize,

    #[arg(long, default_value_t = 3e-4)]
    pub learning_rate: f64,

    /// Decay after warmup: cosine, linear or constant.
    #[arg(long, default_value = "cosine")]
    pub lr_scheduler: SchedulerKind,

    #[arg(long, default_value_t = 100)]
    pub warmup_steps: usize,

    #[arg(long, default_value_t = 16)]
    pub lora_r: usize,

    #[arg(long, default_value_t = 16)]
    pub lora_alpha: usize,

    #[arg(long, default_value_t = 0.05)]
    pub lora_dropout: f32,

    /// Comma-separated projection names to adapt.
    #[arg(long, value_delimiter = ',', default_value = "gate_proj,down_proj,up_proj")]
    pub lora_target_modules: Vec<String>,

    /// Sort micro-batches by length within shuffled groups.
    #[arg(long)]
    pub group_by_length: bool,

    /// Tracking project recorded in trainer_log.jsonl.
    #[arg(long)]
    pub wandb_project: Option<String>,

    /// Tracking run name recorded in trainer_log.jsonl.
    #[arg(long)]
    pub wandb_run_name: Option<String>,

    /// Checkpoint directory or final adapter directory to continue from.
    #[arg(long)]
    pub resume_from_checkpoint: Option<PathBuf>,

    /// Accepted for compatibility; all activations are kept.
    #[arg(long)]
    pub gradient_checkpointing: bool,

    /// Log model and activation sizes and wait for Enter before training.
    #[arg(long)]
    pub debug: bool,

    /// Prefer GPU acceleration (CUDA/Metal).
    #[arg(long)]
    pub gpu: bool,

    #[arg(long, env = "WORLD_SIZE", default_value_t = 1)]
    pub world_size: usize,

    #[arg(long, env = "LOCAL_RANK", default_value_t = 0)]
    pub local_rank: usize,
}

pub async fn run(args: TrainArgs, config: &AppConfig) -> Result<()> {
    let distributed =
        DistributedContext::new(args.world_size, args.local_rank).context("Invalid process placement")?;
    let lora = LoraConfig {
        r: args.lora_r,
        alpha: args.lora_alpha,
        dropout: args.lora_dropout,
        target_modules: args.lora_target_modules.clone(),
    };
    lora.validate()?;

    let base = args.data.resolve(config).await?;
    let cfg = lorafit_train::FinetuneConfig {
        output_dir: args.output_dir,
        batch_size: args.batch_size,
        micro_batch_size: args.micro_batch_size,
        num_epochs: args.num_epochs,
        learning_rate: args.learning_rate,
        lr_scheduler: args.lr_scheduler,
        warmup_steps: args.warmup_steps,
        lora,
        group_by_length: args.group_by_length,
        wandb_project: args.wandb_project.filter(|s| !s.is_empty()),
        wandb_run_name: args.wandb_run_name.filter(|s| !s.is_empty()),
        resume_from_checkpoint: args.resume_from_checkpoint,
        gradient_checkpointing: args.gradient_checkpointing,
        debug: args.debug,
        prefer_gpu: args.gpu || config.device.prefer_gpu,
        distributed,
        ..base
    };

    // Training is synchronous and long-running; keep it off the async workers.
    let stats = tokio::task::spawn_blocking(move || lorafit_train::run(&cfg))
        .await
        .context("Training task panicked")??;

    info!(
        steps = stats.total_steps,
        final_loss = stats.final_loss,
        best_eval_loss = ?stats.best_eval_loss,
        tokens_per_sec = %format!("{:.1}", stats.tokens_per_sec),
        "Fine-tuning finished"
    );
    Ok(())
}
