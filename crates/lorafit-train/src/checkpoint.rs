//! Checkpoint layout, adapter persistence and resume.
//!
//! ```text
//! <output_dir>/
//!   checkpoint-<step>/
//!     training_state.safetensors   adapter weights for resuming
//!     trainer_state.json           step, epoch, best metric, log history
//!     adapter_model.safetensors    adapter weights in PEFT layout
//!     adapter_config.json
//!   adapter_model.safetensors      final adapter
//!   adapter_config.json
//!   tokenizer.json
//!   trainer_log.jsonl
//! ```

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::lora::{AdapterConfig, LoraConfig};
use crate::model::{named_vars, LoraModel};

pub const ADAPTER_WEIGHTS: &str = "adapter_model.safetensors";
pub const ADAPTER_CONFIG: &str = "adapter_config.json";
pub const TRAINING_STATE: &str = "training_state.safetensors";
pub const TRAINER_STATE: &str = "trainer_state.json";
pub const CHECKPOINT_PREFIX: &str = "checkpoint-";
pub const TRAINER_LOG: &str = "trainer_log.jsonl";

// ── Trainer state ─────────────────────────────────────────────────────────────

/// One entry of the log history: a training step or an evaluation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub step: usize,
    pub epoch: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub loss: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub learning_rate: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub grad_norm: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub eval_loss: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub train_runtime: Option<f64>,
    pub timestamp: DateTime<Utc>,
}

impl LogEntry {
    pub fn new(step: usize, epoch: f64) -> Self {
        Self {
            step,
            epoch,
            loss: None,
            learning_rate: None,
            grad_norm: None,
            eval_loss: None,
            train_runtime: None,
            timestamp: Utc::now(),
        }
    }
}

/// Progress that survives a restart.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrainerState {
    pub global_step: usize,
    pub epoch: f64,
    pub max_steps: usize,
    pub best_metric: Option<f64>,
    pub best_model_checkpoint: Option<PathBuf>,
    pub log_history: Vec<LogEntry>,
}

impl TrainerState {
    pub fn save(&self, dir: &Path) -> Result<()> {
        let path = dir.join(TRAINER_STATE);
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(&path, json).with_context(|| format!("Cannot write {}", path.display()))
    }

    pub fn load(dir: &Path) -> Result<Self> {
        let path = dir.join(TRAINER_STATE);
        let json = std::fs::read_to_string(&path).with_context(|| format!("Cannot read {}", path.display()))?;
        serde_json::from_str(&json).with_context(|| format!("Cannot parse {}", path.display()))
    }

    /// Most recent evaluation loss in the history.
    pub fn last_eval_loss(&self) -> Option<f64> {
        self.log_history.iter().rev().find_map(|e| e.eval_loss)
    }
}

// ── Adapter weights ───────────────────────────────────────────────────────────

/// Write every adapter tensor to a safetensors file.
pub fn save_adapter_weights(model: &LoraModel, path: &Path) -> Result<()> {
    model
        .adapters()
        .save(path)
        .with_context(|| format!("Failed to save adapter weights to {}", path.display()))
}

/// Load adapter tensors from `path` into `model`.
///
/// Every adapter variable must be present with the same shape, and the file
/// may not hold tensors the model does not have.
pub fn load_adapter_weights(model: &LoraModel, path: &Path) -> Result<()> {
    let mut tensors = candle_core::safetensors::load(path, model.device())
        .with_context(|| format!("Cannot read {}", path.display()))?;

    let vars = named_vars(model.adapters())?;
    for (name, var) in &vars {
        let tensor = tensors
            .remove(name)
            .with_context(|| format!("{} has no tensor named {name}", path.display()))?;
        if tensor.dims() != var.dims() {
            bail!(
                "Shape mismatch for {name} in {}: file has {:?}, adapter expects {:?}",
                path.display(),
                tensor.dims(),
                var.dims()
            );
        }
        var.set(&tensor.to_dtype(var.dtype())?)?;
    }

    if !tensors.is_empty() {
        let mut extra: Vec<String> = tensors.into_keys().collect();
        extra.sort();
        bail!("{} holds tensors the adapter does not have: {}", path.display(), extra.join(", "));
    }
    info!(path = %path.display(), tensors = vars.len(), "Adapter weights loaded");
    Ok(())
}

/// Write `adapter_model.safetensors` and `adapter_config.json` into `dir`.
pub fn save_adapter(model: &LoraModel, dir: &Path) -> Result<()> {
    std::fs::create_dir_all(dir).with_context(|| format!("Cannot create {}", dir.display()))?;
    save_adapter_weights(model, &dir.join(ADAPTER_WEIGHTS))?;
    let config = model.lora_config().to_adapter_config(model.base_model());
    let path = dir.join(ADAPTER_CONFIG);
    std::fs::write(&path, serde_json::to_string_pretty(&config)?)
        .with_context(|| format!("Cannot write {}", path.display()))?;
    Ok(())
}

/// Write the full resumable state into `dir`.
pub fn save_training_state(model: &LoraModel, state: &TrainerState, dir: &Path) -> Result<()> {
    std::fs::create_dir_all(dir).with_context(|| format!("Cannot create {}", dir.display()))?;
    save_adapter_weights(model, &dir.join(TRAINING_STATE))?;
    state.save(dir)
}

// ── Resume ────────────────────────────────────────────────────────────────────

/// What a resume path turned out to hold.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResumePlan {
    /// `training_state.safetensors` plus `trainer_state.json`.
    Full(PathBuf),
    /// Only `adapter_model.safetensors`; training restarts from step 0.
    AdapterOnly(PathBuf),
    NotFound(PathBuf),
}

impl ResumePlan {
    pub fn for_path(path: &Path) -> Self {
        if path.join(TRAINING_STATE).is_file() && path.join(TRAINER_STATE).is_file() {
            Self::Full(path.to_path_buf())
        } else if path.join(ADAPTER_WEIGHTS).is_file() {
            Self::AdapterOnly(path.join(ADAPTER_WEIGHTS))
        } else {
            Self::NotFound(path.to_path_buf())
        }
    }

    /// Load what the plan names into `model`, returning the restored trainer
    /// state for a full checkpoint.
    ///
    /// An `adapter_config.json` next to the weights must describe the same
    /// adapter (rank, alpha, targets) as `model`.
    pub fn apply(&self, model: &LoraModel) -> Result<Option<TrainerState>> {
        match self {
            Self::Full(dir) => {
                info!(checkpoint = %dir.display(), "Restarting from full checkpoint");
                check_adapter_config(dir, model.lora_config())?;
                load_adapter_weights(model, &dir.join(TRAINING_STATE))?;
                let state = TrainerState::load(dir)?;
                info!(global_step = state.global_step, best_metric = ?state.best_metric, "Trainer state restored");
                Ok(Some(state))
            }
            Self::AdapterOnly(path) => {
                info!(checkpoint = %path.display(), "Restarting from adapter weights");
                if let Some(dir) = path.parent() {
                    check_adapter_config(dir, model.lora_config())?;
                }
                load_adapter_weights(model, path)?;
                Ok(None)
            }
            Self::NotFound(path) => {
                warn!(checkpoint = %path.display(), "Checkpoint not found, training from scratch");
                Ok(None)
            }
        }
    }
}

/// Fail when `dir/adapter_config.json` exists and was written for a
/// different adapter shape or scale than `current`.
fn check_adapter_config(dir: &Path, current: &LoraConfig) -> Result<()> {
    let path = dir.join(ADAPTER_CONFIG);
    if !path.is_file() {
        return Ok(());
    }
    let text = std::fs::read_to_string(&path).with_context(|| format!("Cannot read {}", path.display()))?;
    let saved: AdapterConfig =
        serde_json::from_str(&text).with_context(|| format!("Malformed {}", path.display()))?;
    let saved = LoraConfig::from(&saved);

    let mut saved_targets = saved.target_modules.clone();
    let mut current_targets = current.target_modules.clone();
    saved_targets.sort();
    current_targets.sort();
    if saved.r != current.r || saved.alpha != current.alpha || saved_targets != current_targets {
        bail!(
            "{} was trained with r={} alpha={} targets=[{}], but this run uses r={} alpha={} targets=[{}]",
            path.display(),
            saved.r,
            saved.alpha,
            saved.target_modules.join(", "),
            current.r,
            current.alpha,
            current.target_modules.join(", ")
        );
    }
    Ok(())
}

// ── Rotation ──────────────────────────────────────────────────────────────────

pub fn checkpoint_dir(output_dir: &Path, step: usize) -> PathBuf {
    output_dir.join(format!("{CHECKPOINT_PREFIX}{step}"))
}

/// `checkpoint-<step>` directories under `output_dir`, oldest first.
pub fn list_checkpoints(output_dir: &Path) -> Result<Vec<PathBuf>> {
    if !output_dir.is_dir() {
        return Ok(Vec::new());
    }
    let mut found: Vec<(usize, PathBuf)> = std::fs::read_dir(output_dir)
        .with_context(|| format!("Cannot read {}", output_dir.display()))?
        .filter_map(|e| e.ok())
        .filter(|e| e.path().is_dir())
        .filter_map(|e| {
            let name = e.file_name().to_string_lossy().to_string();
            let step = name.strip_prefix(CHECKPOINT_PREFIX)?.parse().ok()?;
            Some((step, e.path()))
        })
        .collect();
    found.sort();
    Ok(found.into_iter().map(|(_, p)| p).collect())
}

/// Delete the oldest checkpoints so at most `limit` remain, never deleting
/// `best`.  Returns the deleted directories.
pub fn rotate_checkpoints(output_dir: &Path, limit: usize, best: Option<&Path>) -> Result<Vec<PathBuf>> {
    let checkpoints = list_checkpoints(output_dir)?;
    let mut excess = checkpoints.len().saturating_sub(limit.max(1));
    let mut deleted = Vec::new();
    for dir in checkpoints {
        if excess == 0 {
            break;
        }
        if best == Some(dir.as_path()) {
            continue;
        }
        info!(checkpoint = %dir.display(), "Deleting older checkpoint");
        std::fs::remove_dir_all(&dir).with_context(|| format!("Cannot delete {}", dir.display()))?;
        deleted.push(dir);
        excess -= 1;
    }
    Ok(deleted)
}
