//! Supervised fine-tuning loop.
//!
//! Each optimizer step consumes `gradient_accumulation_steps` micro-batches.
//! The loss of every micro-batch is divided by the number of micro-batches in
//! its accumulation window before `backward`, and the per-variable gradients
//! are summed across the window, so one step sees the mean gradient.  The
//! last window of an epoch may be shorter.
//!
//! Evaluation, checkpointing and rotation happen on optimizer-step
//! boundaries.  Only the main process runs `on_save` callbacks and rotation.

use std::path::PathBuf;
use std::time::Instant;

use anyhow::{ensure, Context, Result};
use candle_core::backprop::GradStore;
use candle_core::Tensor;
use candle_nn::optim::{AdamW, Optimizer, ParamsAdamW};
use indicatif::{ProgressBar, ProgressStyle};
use tracing::{info, warn};

use lorafit_core::{PaddingSide, TokenizedExample};

use crate::callbacks::TrainerCallback;
use crate::checkpoint::{checkpoint_dir, rotate_checkpoints, LogEntry, TrainerState};
use crate::collator::{collate, epoch_batches, PAD_TO_MULTIPLE_OF};
use crate::model::LoraModel;
use crate::schedule::{LrSchedule, SchedulerKind};

// ── Config ────────────────────────────────────────────────────────────────────

/// Hyper-parameters of the training loop.
#[derive(Debug, Clone)]
pub struct TrainingArgs {
    pub output_dir: PathBuf,
    pub micro_batch_size: usize,
    pub gradient_accumulation_steps: usize,
    pub num_epochs: usize,
    pub learning_rate: f64,
    pub lr_scheduler: SchedulerKind,
    pub warmup_steps: usize,
    /// Optimizer steps between training log entries.
    pub logging_steps: usize,
    /// Optimizer steps between evaluations; ignored without a validation set.
    pub eval_steps: usize,
    pub save_steps: usize,
    /// Checkpoints kept on disk; the best one is never deleted.
    pub save_total_limit: usize,
    pub group_by_length: bool,
    /// Global L2 norm gradients are clipped to.
    pub max_grad_norm: Option<f64>,
    pub seed: u64,
    pub pad_token_id: u32,
    pub padding_side: PaddingSide,
    pub is_main_process: bool,
    pub show_progress: bool,
}

impl Default for TrainingArgs {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("./lora-alpaca"),
            micro_batch_size: 8,
            gradient_accumulation_steps: 16,
            num_epochs: 1,
            learning_rate: 3e-4,
            lr_scheduler: SchedulerKind::Cosine,
            warmup_steps: 100,
            logging_steps: 1,
            eval_steps: 200,
            save_steps: 1000,
            save_total_limit: 2,
            group_by_length: false,
            max_grad_norm: Some(1.0),
            seed: 42,
            pad_token_id: 0,
            padding_side: PaddingSide::Right,
            is_main_process: true,
            show_progress: true,
        }
    }
}

// ── Training statistics ───────────────────────────────────────────────────────

/// Summary returned after training completes.
#[derive(Debug, Clone)]
pub struct TrainingStats {
    pub total_steps: usize,
    pub final_loss: f64,
    pub best_eval_loss: Option<f64>,
    pub elapsed_secs: f64,
    pub tokens_per_sec: f64,
}

// ── Trainer ───────────────────────────────────────────────────────────────────

pub struct Trainer<'m> {
    model: &'m LoraModel,
    args: TrainingArgs,
    state: TrainerState,
    callbacks: Vec<Box<dyn TrainerCallback>>,
}

impl<'m> Trainer<'m> {
    pub fn new(model: &'m LoraModel, args: TrainingArgs) -> Self {
        Self { model, args, state: TrainerState::default(), callbacks: Vec::new() }
    }

    pub fn add_callback(&mut self, callback: Box<dyn TrainerCallback>) {
        self.callbacks.push(callback);
    }

    /// Continue from a restored state; steps already taken are skipped.
    pub fn with_state(mut self, state: TrainerState) -> Self {
        self.state = state;
        self
    }

    pub fn state(&self) -> &TrainerState {
        &self.state
    }

    pub fn args(&self) -> &TrainingArgs {
        &self.args
    }

    /// Run the full loop over `train`, evaluating on `val` when it is non-empty.
    pub fn train(&mut self, train: &[TokenizedExample], val: &[TokenizedExample]) -> Result<TrainingStats> {
        ensure!(!train.is_empty(), "Training set is empty");
        let micro = self.args.micro_batch_size.max(1);
        let accum = self.args.gradient_accumulation_steps.max(1);
        let lengths: Vec<usize> = train.iter().map(TokenizedExample::len).collect();
        let n_batches = train.len().div_ceil(micro);
        let steps_per_epoch = n_batches.div_ceil(accum);
        let max_steps = steps_per_epoch * self.args.num_epochs;
        self.state.max_steps = max_steps;

        let schedule = LrSchedule {
            kind: self.args.lr_scheduler,
            peak_lr: self.args.learning_rate,
            warmup_steps: self.args.warmup_steps,
            total_steps: max_steps,
        };
        let model = self.model;
        let vars = model.trainable_vars();
        let params = ParamsAdamW { lr: schedule.lr_at(self.state.global_step), weight_decay: 0.0, ..Default::default() };
        let mut optimizer = AdamW::new(vars.to_vec(), params).context("Failed to create AdamW optimiser")?;

        let start_epoch = self.state.global_step / steps_per_epoch.max(1);
        let skip_steps = self.state.global_step % steps_per_epoch.max(1);
        if self.state.global_step > 0 {
            info!(
                global_step = self.state.global_step,
                epoch = start_epoch,
                skipped_micro_batches = skip_steps * accum,
                "Skipping steps already trained"
            );
        }

        info!(
            examples = train.len(),
            val_examples = val.len(),
            epochs = self.args.num_epochs,
            micro_batch_size = micro,
            gradient_accumulation_steps = accum,
            max_steps,
            lr = self.args.learning_rate,
            scheduler = %self.args.lr_scheduler,
            "Training"
        );

        let pb = if self.args.show_progress && self.args.is_main_process {
            progress_bar(max_steps as u64, "training")
        } else {
            ProgressBar::hidden()
        };
        pb.set_position(self.state.global_step.min(max_steps) as u64);

        let start = Instant::now();
        let mut total_tokens = 0usize;
        let mut last_loss = f64::NAN;
        let mut accumulated: Vec<Option<Tensor>> = vec![None; vars.len()];
        let mut window_loss = 0.0f64;

        for epoch in start_epoch..self.args.num_epochs {
            let batches = epoch_batches(&lengths, micro, self.args.group_by_length, self.args.seed + epoch as u64);
            let skip = if epoch == start_epoch { skip_steps * accum } else { 0 };

            for (i, indices) in batches.iter().enumerate().skip(skip) {
                let window_start = (i / accum) * accum;
                let window_len = accum.min(n_batches - window_start);

                let examples: Vec<&TokenizedExample> = indices.iter().map(|&j| &train[j]).collect();
                let batch = collate(&examples, self.args.pad_token_id, self.args.padding_side, PAD_TO_MULTIPLE_OF)?;
                total_tokens += batch.num_tokens();

                let (loss, _) = model.loss(&batch, true).context("Forward pass failed")?;
                window_loss += loss.to_scalar::<f32>()? as f64 / window_len as f64;
                let mut grads = (loss / window_len as f64)?.backward().context("Backward pass failed")?;
                for (slot, var) in accumulated.iter_mut().zip(vars) {
                    if let Some(g) = grads.get(var.as_tensor()) {
                        *slot = Some(match slot.take() {
                            Some(acc) => (acc + g)?,
                            None => g.clone(),
                        });
                    }
                }

                if i + 1 < window_start + window_len {
                    continue;
                }

                for (slot, var) in accumulated.iter_mut().zip(vars) {
                    if let Some(g) = slot.take() {
                        grads.insert(var.as_tensor(), g);
                    }
                }
                let grad_norm = clip_grad_norm(&mut grads, model, self.args.max_grad_norm)?;
                let lr = schedule.lr_at(self.state.global_step);
                optimizer.set_learning_rate(lr);
                optimizer.step(&grads).context("Optimizer step failed")?;

                self.state.global_step += 1;
                self.state.epoch = epoch as f64 + (i + 1) as f64 / n_batches as f64;
                last_loss = window_loss;
                window_loss = 0.0;

                pb.set_message(format!(
                    "epoch {}/{} loss {:.4} lr {:.2e}",
                    epoch + 1,
                    self.args.num_epochs,
                    last_loss,
                    lr
                ));
                pb.inc(1);

                self.on_step_end(last_loss, lr, grad_norm, val)?;
            }

            info!(epoch = epoch + 1, loss = last_loss, "Epoch complete");
        }

        let elapsed = start.elapsed().as_secs_f64();
        pb.finish_with_message(format!("done in {}, final loss {last_loss:.4}", format_duration(elapsed as u64)));

        let mut summary = LogEntry::new(self.state.global_step, self.state.epoch);
        summary.train_runtime = Some(elapsed);
        summary.loss = last_loss.is_finite().then_some(last_loss);
        self.log(summary)?;

        for cb in &mut self.callbacks {
            cb.on_train_end(self.model, &self.state)?;
        }

        let tokens_per_sec = if elapsed > 0.0 { total_tokens as f64 / elapsed } else { 0.0 };
        info!(
            steps = self.state.global_step,
            final_loss = last_loss,
            best_eval_loss = ?self.state.best_metric,
            elapsed = %format_duration(elapsed as u64),
            tokens_per_sec = %format!("{tokens_per_sec:.1}"),
            "Training complete"
        );

        Ok(TrainingStats {
            total_steps: self.state.global_step,
            final_loss: last_loss,
            best_eval_loss: self.state.best_metric,
            elapsed_secs: elapsed,
            tokens_per_sec,
        })
    }

    /// Token-weighted mean loss over `val`, in fixed order and without dropout.
    pub fn evaluate(&self, val: &[TokenizedExample]) -> Result<f64> {
        ensure!(!val.is_empty(), "Validation set is empty");
        let mut loss_sum = 0.0f64;
        let mut tokens = 0usize;
        for chunk in val.chunks(self.args.micro_batch_size.max(1)) {
            let examples: Vec<&TokenizedExample> = chunk.iter().collect();
            let batch = collate(&examples, self.args.pad_token_id, self.args.padding_side, PAD_TO_MULTIPLE_OF)?;
            let (loss, count) = self.model.loss(&batch, false).context("Evaluation forward pass failed")?;
            loss_sum += loss.to_scalar::<f32>()? as f64 * count as f64;
            tokens += count;
        }
        if tokens == 0 {
            warn!("Validation set has no trainable labels");
            return Ok(0.0);
        }
        Ok(loss_sum / tokens as f64)
    }

    // ── Step hooks ────────────────────────────────────────────────────────────

    fn on_step_end(&mut self, loss: f64, lr: f64, grad_norm: Option<f64>, val: &[TokenizedExample]) -> Result<()> {
        let step = self.state.global_step;

        if self.args.logging_steps > 0 && step % self.args.logging_steps == 0 {
            let mut entry = LogEntry::new(step, self.state.epoch);
            entry.loss = Some(loss);
            entry.learning_rate = Some(lr);
            entry.grad_norm = grad_norm;
            self.log(entry)?;
        }

        if !val.is_empty() && self.args.eval_steps > 0 && step % self.args.eval_steps == 0 {
            let eval_loss = self.evaluate(val)?;
            info!(step, eval_loss, "Evaluation");
            let mut entry = LogEntry::new(step, self.state.epoch);
            entry.eval_loss = Some(eval_loss);
            self.log(entry)?;
        }

        if self.args.save_steps > 0 && step % self.args.save_steps == 0 {
            self.save_checkpoint()?;
        }
        Ok(())
    }

    fn log(&mut self, entry: LogEntry) -> Result<()> {
        for cb in &mut self.callbacks {
            cb.on_log(&self.state, &entry)?;
        }
        self.state.log_history.push(entry);
        Ok(())
    }

    fn save_checkpoint(&mut self) -> Result<()> {
        let dir = checkpoint_dir(&self.args.output_dir, self.state.global_step);
        if let Some(eval_loss) = self.state.last_eval_loss() {
            if self.state.best_metric.map_or(true, |best| eval_loss < best) {
                self.state.best_metric = Some(eval_loss);
                self.state.best_model_checkpoint = Some(dir.clone());
            }
        }
        if !self.args.is_main_process {
            return Ok(());
        }
        for cb in &mut self.callbacks {
            cb.on_save(self.model, &self.state, &dir)?;
        }
        rotate_checkpoints(
            &self.args.output_dir,
            self.args.save_total_limit,
            self.state.best_model_checkpoint.as_deref(),
        )?;
        Ok(())
    }
}

// ── Helpers ───────────────────────────────────────────────────────────────────

/// Global L2 norm of the adapter gradients, scaling them down in place when
/// it exceeds `max_norm`.
fn clip_grad_norm(grads: &mut GradStore, model: &LoraModel, max_norm: Option<f64>) -> Result<Option<f64>> {
    let mut sum_sq = 0.0f64;
    for var in model.trainable_vars() {
        if let Some(g) = grads.get(var.as_tensor()) {
            sum_sq += g.sqr()?.sum_all()?.to_dtype(candle_core::DType::F32)?.to_scalar::<f32>()? as f64;
        }
    }
    let norm = sum_sq.sqrt();
    let Some(max_norm) = max_norm else {
        return Ok(Some(norm));
    };
    if norm > max_norm {
        let scale = max_norm / (norm + 1e-6);
        for var in model.trainable_vars() {
            if let Some(g) = grads.get(var.as_tensor()) {
                let clipped = (g * scale)?;
                grads.insert(var.as_tensor(), clipped);
            }
        }
    }
    Ok(Some(norm))
}

fn progress_bar(total: u64, label: &str) -> ProgressBar {
    let pb = ProgressBar::new(total);
    pb.set_style(
        ProgressStyle::with_template("{spinner:.cyan} [{elapsed_precise}] {bar:40.cyan/blue} {pos}/{len} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("█▓░"),
    );
    pb.set_message(label.to_string());
    pb
}

pub(crate) fn format_duration(secs: u64) -> String {
    if secs < 60 {
        format!("{secs}s")
    } else if secs < 3600 {
        format!("{}m {:02}s", secs / 60, secs % 60)
    } else {
        format!("{}h {:02}m {:02}s", secs / 3600, (secs % 3600) / 60, secs % 60)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_nn::VarMap;
    use tempfile::TempDir;

    use crate::callbacks::SaveAdapterCallback;
    use crate::checkpoint::list_checkpoints;
    use crate::lora::LoraConfig;
    use crate::model::tiny_model;

    fn lora() -> LoraConfig {
        LoraConfig {
            r: 4,
            alpha: 8,
            dropout: 0.0,
            target_modules: vec!["q_proj".into(), "v_proj".into(), "up_proj".into()],
        }
    }

    fn dataset(n: usize) -> Vec<TokenizedExample> {
        (0..n)
            .map(|i| {
                let len = 4 + i % 5;
                let ids: Vec<u32> = (0..len).map(|j| ((i + j * 3) % 21 + 3) as u32).collect();
                let mut labels: Vec<i64> = ids.iter().map(|&x| x as i64).collect();
                labels[0] = lorafit_core::IGNORE_INDEX;
                TokenizedExample { attention_mask: vec![1; ids.len()], input_ids: ids, labels }
            })
            .collect()
    }

    fn args(dir: &TempDir) -> TrainingArgs {
        TrainingArgs {
            output_dir: dir.path().to_path_buf(),
            micro_batch_size: 2,
            gradient_accumulation_steps: 2,
            num_epochs: 2,
            learning_rate: 1e-2,
            lr_scheduler: SchedulerKind::Constant,
            warmup_steps: 0,
            show_progress: false,
            ..Default::default()
        }
    }

    fn train_entries(state: &TrainerState) -> usize {
        state.log_history.iter().filter(|e| e.learning_rate.is_some()).count()
    }

    #[test]
    fn counts_optimizer_steps_with_short_last_window() {
        let dir = TempDir::new().unwrap();
        let base = VarMap::new();
        let model = tiny_model(&base, &lora());
        let mut trainer = Trainer::new(&model, args(&dir));
        // 10 examples / 2 = 5 micro-batches, windows of 2 => 3 steps per epoch
        let stats = trainer.train(&dataset(10), &[]).unwrap();
        assert_eq!(stats.total_steps, 6);
        assert_eq!(trainer.state().max_steps, 6);
        assert_eq!(train_entries(trainer.state()), 6);
        assert!((trainer.state().epoch - 2.0).abs() < 1e-9);
        assert!(trainer.state().log_history.last().unwrap().train_runtime.is_some());
    }

    #[test]
    fn training_lowers_loss() {
        let dir = TempDir::new().unwrap();
        let base = VarMap::new();
        let model = tiny_model(&base, &lora());
        let data = dataset(4);
        let mut a = args(&dir);
        a.num_epochs = 15;
        a.gradient_accumulation_steps = 1;
        let mut trainer = Trainer::new(&model, a);
        let before = trainer.evaluate(&data).unwrap();
        trainer.train(&data, &[]).unwrap();
        let after = trainer.evaluate(&data).unwrap();
        assert!(after < before, "eval loss went from {before} to {after}");
    }

    #[test]
    fn saves_rotates_and_tracks_best() {
        let dir = TempDir::new().unwrap();
        let base = VarMap::new();
        let model = tiny_model(&base, &lora());
        let mut a = args(&dir);
        a.eval_steps = 1;
        a.save_steps = 1;
        let mut trainer = Trainer::new(&model, a);
        trainer.add_callback(Box::new(SaveAdapterCallback));
        trainer.train(&dataset(8), &dataset(3)).unwrap();

        let state = trainer.state();
        let min_eval = state.log_history.iter().filter_map(|e| e.eval_loss).fold(f64::INFINITY, f64::min);
        assert_eq!(state.best_metric, Some(min_eval));

        let kept = list_checkpoints(dir.path()).unwrap();
        assert!(kept.len() <= 2, "{kept:?}");
        let best = state.best_model_checkpoint.clone().unwrap();
        assert!(kept.contains(&best));
        assert!(kept.contains(&checkpoint_dir(dir.path(), state.global_step)));
    }

    #[test]
    fn non_main_process_writes_nothing() {
        let dir = TempDir::new().unwrap();
        let base = VarMap::new();
        let model = tiny_model(&base, &lora());
        let mut a = args(&dir);
        a.save_steps = 1;
        a.is_main_process = false;
        let mut trainer = Trainer::new(&model, a);
        trainer.add_callback(Box::new(SaveAdapterCallback));
        trainer.train(&dataset(4), &[]).unwrap();
        assert!(list_checkpoints(dir.path()).unwrap().is_empty());
    }

    #[test]
    fn restored_state_skips_finished_steps() {
        let dir = TempDir::new().unwrap();
        let base = VarMap::new();
        let model = tiny_model(&base, &lora());
        let restored = TrainerState { global_step: 4, ..Default::default() };
        let mut trainer = Trainer::new(&model, args(&dir)).with_state(restored);
        let stats = trainer.train(&dataset(10), &[]).unwrap();
        assert_eq!(stats.total_steps, 6);
        assert_eq!(train_entries(trainer.state()), 2);
    }

    #[test]
    fn evaluate_requires_examples() {
        let dir = TempDir::new().unwrap();
        let base = VarMap::new();
        let model = tiny_model(&base, &lora());
        assert!(Trainer::new(&model, args(&dir)).evaluate(&[]).is_err());
    }

    #[test]
    fn durations_are_readable() {
        assert_eq!(format_duration(42), "42s");
        assert_eq!(format_duration(125), "2m 05s");
        assert_eq!(format_duration(3725), "1h 02m 05s");
    }
}
