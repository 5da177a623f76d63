//! Hooks the trainer calls at log, save and end-of-training points.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Serialize;
use tracing::{info, warn};

use crate::checkpoint::{load_adapter_weights, save_adapter, save_training_state, LogEntry, TrainerState, ADAPTER_WEIGHTS};
use crate::model::LoraModel;

/// Observer of a training run.  Every method defaults to doing nothing.
pub trait TrainerCallback {
    fn on_log(&mut self, _state: &TrainerState, _entry: &LogEntry) -> Result<()> {
        Ok(())
    }

    /// `checkpoint` is the `checkpoint-<step>` directory being written.
    fn on_save(&mut self, _model: &LoraModel, _state: &TrainerState, _checkpoint: &Path) -> Result<()> {
        Ok(())
    }

    fn on_train_end(&mut self, _model: &LoraModel, _state: &TrainerState) -> Result<()> {
        Ok(())
    }
}

// ── SaveAdapterCallback ───────────────────────────────────────────────────────

/// Writes the resumable training state and the PEFT-layout adapter into
/// every checkpoint directory.
#[derive(Debug, Default)]
pub struct SaveAdapterCallback;

impl TrainerCallback for SaveAdapterCallback {
    fn on_save(&mut self, model: &LoraModel, state: &TrainerState, checkpoint: &Path) -> Result<()> {
        save_training_state(model, state, checkpoint)?;
        save_adapter(model, checkpoint)?;
        info!(checkpoint = %checkpoint.display(), step = state.global_step, "Checkpoint saved");
        Ok(())
    }
}

// ── LoadBestAdapterCallback ───────────────────────────────────────────────────

/// At the end of training, reloads the adapter of the checkpoint with the
/// lowest evaluation loss.
#[derive(Debug, Default)]
pub struct LoadBestAdapterCallback;

impl TrainerCallback for LoadBestAdapterCallback {
    fn on_train_end(&mut self, model: &LoraModel, state: &TrainerState) -> Result<()> {
        let Some(best) = &state.best_model_checkpoint else {
            warn!("No best checkpoint recorded, keeping the final adapter");
            return Ok(());
        };
        info!(
            checkpoint = %best.display(),
            score = ?state.best_metric,
            "Loading best adapter"
        );
        load_adapter_weights(model, &best.join(ADAPTER_WEIGHTS))
            .with_context(|| format!("Failed to reload best checkpoint {}", best.display()))
    }
}

// ── LogHistoryCallback ────────────────────────────────────────────────────────

#[derive(Serialize)]
struct TaggedEntry<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    project: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    run: Option<&'a str>,
    #[serde(flatten)]
    entry: &'a LogEntry,
}

/// Appends every log entry to a JSON Lines file, tagged with the tracking
/// project and run names when they are set.
pub struct LogHistoryCallback {
    path: PathBuf,
    writer: BufWriter<File>,
    project: Option<String>,
    run: Option<String>,
}

impl LogHistoryCallback {
    pub fn create(path: &Path, project: Option<String>, run: Option<String>) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).with_context(|| format!("Cannot create {}", parent.display()))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("Cannot open {} for appending", path.display()))?;
        Ok(Self { path: path.to_path_buf(), writer: BufWriter::new(file), project, run })
    }
}

impl TrainerCallback for LogHistoryCallback {
    fn on_log(&mut self, _state: &TrainerState, entry: &LogEntry) -> Result<()> {
        let tagged = TaggedEntry { project: self.project.as_deref(), run: self.run.as_deref(), entry };
        let line = serde_json::to_string(&tagged)?;
        writeln!(self.writer, "{line}").with_context(|| format!("Cannot write {}", self.path.display()))?;
        self.writer.flush()?;
        Ok(())
    }
}
