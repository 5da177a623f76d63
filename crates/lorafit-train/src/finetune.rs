//! End-to-end fine-tuning driver.
//!
//! [`run`] wires the pieces together in this order: tokenizer, prompt
//! pipeline, dataset (load, split, tokenize, filter, shard), model and
//! adapters, optional resume, trainer, final save.  [`prepare`] stops after
//! the dataset stage and writes the tokenized examples instead.

use std::fs::File;
use std::io::{BufRead, BufWriter, IsTerminal, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use serde::Serialize;
use tracing::{info, warn};

use lorafit_core::device::device_name;
use lorafit_core::{
    filter_by_length, select_device, training_dtype, DistributedContext, PromptPipeline, PromptTemplate,
    TokenizedExample, Tokenizer,
};

use crate::callbacks::{LoadBestAdapterCallback, LogHistoryCallback, SaveAdapterCallback};
use crate::checkpoint::{save_adapter, ResumePlan, TRAINER_LOG};
use crate::dataset::{load_records, shard, train_val_split, DATA_SEED};
use crate::lora::LoraConfig;
use crate::model::LoraModel;
use crate::schedule::SchedulerKind;
use crate::trainer::{Trainer, TrainingArgs, TrainingStats};

// ── Config ────────────────────────────────────────────────────────────────────

/// Every per-run setting of a fine-tuning job.
#[derive(Debug, Clone)]
pub struct FinetuneConfig {
    /// Local directory holding `config.json`, `tokenizer.json` and weights.
    pub base_model: PathBuf,
    /// Name recorded in `adapter_config.json`; usually the hub repo id.
    pub base_model_name: String,
    pub data_path: PathBuf,
    pub output_dir: PathBuf,
    /// Examples per optimizer step, across accumulation and processes.
    pub batch_size: usize,
    pub micro_batch_size: usize,
    pub num_epochs: usize,
    pub learning_rate: f64,
    pub cutoff_len: usize,
    pub val_set_size: usize,
    pub lr_scheduler: SchedulerKind,
    pub warmup_steps: usize,
    pub lora: LoraConfig,
    pub train_on_inputs: bool,
    pub add_eos_token: bool,
    pub group_by_length: bool,
    pub wandb_project: Option<String>,
    pub wandb_run_name: Option<String>,
    pub resume_from_checkpoint: Option<PathBuf>,
    pub prompt_template_name: String,
    pub template_dir: Option<PathBuf>,
    pub gradient_checkpointing: bool,
    pub seq_min: usize,
    pub seq_max: usize,
    pub debug: bool,
    pub prefer_gpu: bool,
    pub distributed: DistributedContext,
}

impl Default for FinetuneConfig {
    fn default() -> Self {
        Self {
            base_model: PathBuf::new(),
            base_model_name: String::new(),
            data_path: PathBuf::from("yahma/alpaca-cleaned"),
            output_dir: PathBuf::from("./lora-alpaca"),
            batch_size: 128,
            micro_batch_size: 8,
            num_epochs: 1,
            learning_rate: 3e-4,
            cutoff_len: 4096,
            val_set_size: 0,
            lr_scheduler: SchedulerKind::Cosine,
            warmup_steps: 100,
            lora: LoraConfig::default(),
            train_on_inputs: false,
            add_eos_token: false,
            group_by_length: false,
            wandb_project: None,
            wandb_run_name: None,
            resume_from_checkpoint: None,
            prompt_template_name: "alpaca".into(),
            template_dir: None,
            gradient_checkpointing: false,
            seq_min: 0,
            seq_max: 4096,
            debug: false,
            prefer_gpu: true,
            distributed: DistributedContext::default(),
        }
    }
}

impl FinetuneConfig {
    fn log_params(&self) {
        info!(
            template = %self.prompt_template_name,
            base_model = %self.base_model_name,
            data_path = %self.data_path.display(),
            output_dir = %self.output_dir.display(),
            batch_size = self.batch_size,
            micro_batch_size = self.micro_batch_size,
            num_epochs = self.num_epochs,
            learning_rate = self.learning_rate,
            cutoff_len = self.cutoff_len,
            val_set_size = self.val_set_size,
            lr_scheduler = %self.lr_scheduler,
            warmup_steps = self.warmup_steps,
            lora_r = self.lora.r,
            lora_alpha = self.lora.alpha,
            lora_dropout = self.lora.dropout,
            lora_target_modules = %self.lora.target_modules.join(","),
            train_on_inputs = self.train_on_inputs,
            add_eos_token = self.add_eos_token,
            group_by_length = self.group_by_length,
            wandb_project = ?self.wandb_project,
            wandb_run_name = ?self.wandb_run_name,
            resume_from_checkpoint = ?self.resume_from_checkpoint,
            gradient_checkpointing = self.gradient_checkpointing,
            seq_min = self.seq_min,
            seq_max = self.seq_max,
            debug = self.debug,
            "Fine-tuning parameters"
        );
    }

    fn training_args(&self, gradient_accumulation_steps: usize, has_val: bool, tokenizer: &Tokenizer) -> TrainingArgs {
        TrainingArgs {
            output_dir: self.output_dir.clone(),
            micro_batch_size: self.micro_batch_size,
            gradient_accumulation_steps,
            num_epochs: self.num_epochs,
            learning_rate: self.learning_rate,
            lr_scheduler: self.lr_scheduler,
            warmup_steps: self.warmup_steps,
            eval_steps: if has_val { 200 } else { 0 },
            group_by_length: self.group_by_length,
            pad_token_id: tokenizer.pad_token_id().unwrap_or(0),
            padding_side: tokenizer.padding_side(),
            is_main_process: self.distributed.is_main_process(),
            ..TrainingArgs::default()
        }
    }
}

// ── Dataset stage ─────────────────────────────────────────────────────────────

/// Tokenized training and validation examples.
#[derive(Debug, Clone)]
pub struct TokenizedSplit {
    pub train: Vec<TokenizedExample>,
    pub val: Vec<TokenizedExample>,
    /// Training examples dropped by the `seq_min..=seq_max` filter.
    pub filtered_out: usize,
}

/// Load the base-model tokenizer and configure it for training.
pub fn load_tokenizer(model_dir: &Path) -> Result<Tokenizer> {
    let mut tokenizer = Tokenizer::from_model_dir(model_dir)
        .with_context(|| format!("Failed to load tokenizer from {}", model_dir.display()))?;
    tokenizer.prepare_for_training();
    Ok(tokenizer)
}

pub fn build_pipeline(cfg: &FinetuneConfig, tokenizer: Arc<Tokenizer>) -> Result<PromptPipeline> {
    let template = PromptTemplate::load(&cfg.prompt_template_name, cfg.template_dir.as_deref())
        .with_context(|| format!("Cannot load prompt template '{}'", cfg.prompt_template_name))?;
    let pipeline = PromptPipeline::new(
        tokenizer,
        Arc::new(template),
        cfg.cutoff_len,
        cfg.train_on_inputs,
        cfg.add_eos_token,
    )?;
    Ok(pipeline)
}

/// Load, split, tokenize and length-filter the dataset.  The validation set
/// is not filtered.
pub fn tokenize_dataset(cfg: &FinetuneConfig, pipeline: &PromptPipeline) -> Result<TokenizedSplit> {
    let records = load_records(&cfg.data_path)?;
    info!(records = records.len(), path = %cfg.data_path.display(), "Dataset loaded");
    let split = train_val_split(records, cfg.val_set_size, DATA_SEED)?;

    let train = pipeline.map_records(&split.train).context("Failed to tokenize training records")?;
    let val = pipeline.map_records(&split.val).context("Failed to tokenize validation records")?;

    let before = train.len();
    let train = filter_by_length(train, cfg.seq_min, cfg.seq_max);
    let filtered_out = before - train.len();
    info!(
        kept = train.len(),
        filtered_out,
        seq_min = cfg.seq_min,
        seq_max = cfg.seq_max,
        "Training examples filtered by length"
    );
    Ok(TokenizedSplit { train, val, filtered_out })
}

// ── Train ─────────────────────────────────────────────────────────────────────

/// Run a full fine-tuning job and write the adapter to `cfg.output_dir`.
pub fn run(cfg: &FinetuneConfig) -> Result<TrainingStats> {
    let ctx = cfg.distributed;
    if ctx.is_main_process() {
        cfg.log_params();
    }
    let accum = ctx.gradient_accumulation_steps(cfg.batch_size, cfg.micro_batch_size);
    info!(
        ddp = ctx.is_distributed(),
        world_size = ctx.world_size(),
        local_rank = ctx.local_rank(),
        gradient_accumulation_steps = accum,
        "Process placement"
    );

    let tokenizer = Arc::new(load_tokenizer(&cfg.base_model)?);
    let pipeline = build_pipeline(cfg, Arc::clone(&tokenizer))?;
    let data = tokenize_dataset(cfg, &pipeline)?;
    let train = shard(data.train, &ctx);

    let device = select_device(cfg.prefer_gpu, ctx.device_index())?;
    let dtype = training_dtype(&device);
    info!(device = device_name(&device), ?dtype, "Placement");

    let mut model = LoraModel::from_pretrained(&cfg.base_model, &cfg.lora, &device, dtype)
        .with_context(|| format!("Failed to load base model from {}", cfg.base_model.display()))?;
    if !cfg.base_model_name.is_empty() {
        model.set_base_model(&cfg.base_model_name);
    }

    let restored = match &cfg.resume_from_checkpoint {
        Some(path) => ResumePlan::for_path(path).apply(&model)?,
        None => None,
    };

    if ctx.is_main_process() {
        info!("{}", model.param_summary());
    }
    if cfg.gradient_checkpointing {
        warn!("Gradient checkpointing is not supported by this backend; all activations are kept");
    }
    if cfg.debug {
        model.log_size();
        model.log_activations_once();
        wait_for_enter()?;
    }

    let has_val = !data.val.is_empty();
    let mut trainer = Trainer::new(&model, cfg.training_args(accum, has_val, &tokenizer));
    if let Some(state) = restored {
        trainer = trainer.with_state(state);
    }
    if ctx.is_main_process() {
        trainer.add_callback(Box::new(SaveAdapterCallback));
        trainer.add_callback(Box::new(LogHistoryCallback::create(
            &cfg.output_dir.join(TRAINER_LOG),
            cfg.wandb_project.clone(),
            cfg.wandb_run_name.clone(),
        )?));
        if has_val {
            trainer.add_callback(Box::new(LoadBestAdapterCallback));
        }
    }

    let stats = trainer.train(&train, &data.val)?;

    if ctx.is_main_process() {
        save_adapter(&model, &cfg.output_dir)?;
        tokenizer.save(&cfg.output_dir)?;
        info!(output_dir = %cfg.output_dir.display(), "Adapter and tokenizer saved");
    }
    Ok(stats)
}

fn wait_for_enter() -> Result<()> {
    let stdin = std::io::stdin();
    if !stdin.is_terminal() {
        return Ok(());
    }
    eprint!("Before training, press Enter to continue...");
    std::io::stderr().flush()?;
    let mut line = String::new();
    stdin.lock().read_line(&mut line)?;
    Ok(())
}

// ── Prepare ───────────────────────────────────────────────────────────────────

/// Length statistics of a set of tokenized examples.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct LengthStats {
    pub count: usize,
    pub min: usize,
    pub max: usize,
    pub mean: f64,
    /// Positions that contribute to the loss, summed over all examples.
    pub trainable_tokens: usize,
    pub total_tokens: usize,
}

impl LengthStats {
    pub fn of(examples: &[TokenizedExample]) -> Self {
        if examples.is_empty() {
            return Self::default();
        }
        let total_tokens: usize = examples.iter().map(TokenizedExample::len).sum();
        Self {
            count: examples.len(),
            min: examples.iter().map(TokenizedExample::len).min().unwrap_or(0),
            max: examples.iter().map(TokenizedExample::len).max().unwrap_or(0),
            mean: total_tokens as f64 / examples.len() as f64,
            trainable_tokens: examples.iter().map(TokenizedExample::trainable_labels).sum(),
            total_tokens,
        }
    }
}

impl std::fmt::Display for LengthStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} examples, length min {} / mean {:.1} / max {}, {} of {} tokens trainable",
            self.count, self.min, self.mean, self.max, self.trainable_tokens, self.total_tokens
        )
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PrepareReport {
    pub train: LengthStats,
    pub val: LengthStats,
    pub filtered_out: usize,
    pub files: Vec<PathBuf>,
}

/// Run the dataset stage only and write `train.jsonl` (and `val.jsonl` when
/// a validation split exists) into `out_dir`.
pub fn prepare(cfg: &FinetuneConfig, out_dir: &Path) -> Result<PrepareReport> {
    let tokenizer = Arc::new(load_tokenizer(&cfg.base_model)?);
    let pipeline = build_pipeline(cfg, tokenizer)?;
    let data = tokenize_dataset(cfg, &pipeline)?;

    std::fs::create_dir_all(out_dir).with_context(|| format!("Cannot create {}", out_dir.display()))?;
    let mut files = vec![write_jsonl(&out_dir.join("train.jsonl"), &data.train)?];
    if !data.val.is_empty() {
        files.push(write_jsonl(&out_dir.join("val.jsonl"), &data.val)?);
    }

    let report = PrepareReport {
        train: LengthStats::of(&data.train),
        val: LengthStats::of(&data.val),
        filtered_out: data.filtered_out,
        files,
    };
    info!(train = %report.train, val = %report.val, filtered_out = report.filtered_out, "Dataset prepared");
    Ok(report)
}

fn write_jsonl(path: &Path, examples: &[TokenizedExample]) -> Result<PathBuf> {
    let file = File::create(path).with_context(|| format!("Cannot create {}", path.display()))?;
    let mut writer = BufWriter::new(file);
    for ex in examples {
        serde_json::to_writer(&mut writer, ex)?;
        writer.write_all(b"\n")?;
    }
    writer.flush()?;
    Ok(path.to_path_buf())
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_nn::VarMap;
    use tempfile::TempDir;

    use crate::checkpoint::{ADAPTER_CONFIG, ADAPTER_WEIGHTS};
    use crate::model::tiny_model;
    use lorafit_core::IGNORE_INDEX;

    const WORDS: &[&str] = &["Say", "hi", "Hi", "!", "Count", "to", "three", "one", "two", "Name", "a", "color", "red"];

    fn write_tokenizer(dir: &Path) {
        let mut vocab = serde_json::Map::new();
        for (i, tok) in ["<unk>", "<s>", "</s>"].iter().chain(WORDS.iter()).enumerate() {
            vocab.insert(tok.to_string(), serde_json::json!(i));
        }
        let special = |id: u32, content: &str| {
            serde_json::json!({
                "id": id, "content": content, "single_word": false, "lstrip": false,
                "rstrip": false, "normalized": false, "special": true
            })
        };
        let json = serde_json::json!({
            "version": "1.0",
            "truncation": null,
            "padding": null,
            "added_tokens": [special(1, "<s>"), special(2, "</s>")],
            "normalizer": null,
            "pre_tokenizer": { "type": "Whitespace" },
            "post_processor": {
                "type": "TemplateProcessing",
                "single": [
                    { "SpecialToken": { "id": "<s>", "type_id": 0 } },
                    { "Sequence": { "id": "A", "type_id": 0 } }
                ],
                "pair": [
                    { "SpecialToken": { "id": "<s>", "type_id": 0 } },
                    { "Sequence": { "id": "A", "type_id": 0 } },
                    { "Sequence": { "id": "B", "type_id": 1 } }
                ],
                "special_tokens": {
                    "<s>": { "id": "<s>", "ids": [1], "tokens": ["<s>"] }
                }
            },
            "decoder": null,
            "model": { "type": "WordLevel", "vocab": vocab, "unk_token": "<unk>" }
        });
        std::fs::write(dir.join("tokenizer.json"), json.to_string()).unwrap();
    }

    /// A loadable model directory: tokenizer, config and random base weights.
    fn write_model_dir(dir: &Path) {
        write_tokenizer(dir);
        let config = serde_json::json!({
            "hidden_size": 16,
            "intermediate_size": 32,
            "vocab_size": 24,
            "num_hidden_layers": 2,
            "num_attention_heads": 4,
            "num_key_value_heads": 2,
            "rms_norm_eps": 1e-5,
            "rope_theta": 10000.0,
            "max_position_embeddings": 64,
            "tie_word_embeddings": false
        });
        std::fs::write(dir.join("config.json"), config.to_string()).unwrap();
        let base = VarMap::new();
        let _ = tiny_model(&base, &LoraConfig::default());
        base.save(dir.join("model.safetensors")).unwrap();
    }

    fn write_dataset(path: &Path) {
        let rows = [
            r#"{"instruction": "Say hi", "input": "", "output": "Hi !"}"#,
            r#"{"instruction": "Count to three", "output": "one two three"}"#,
            r#"{"instruction": "Name a color", "input": "red", "output": "red"}"#,
            r#"{"instruction": "Say hi", "input": "two", "output": "hi hi"}"#,
            r#"{"instruction": "Count to two", "output": "one two"}"#,
            r#"{"instruction": "Name a color", "output": "red !"}"#,
        ];
        std::fs::write(path, rows.join("\n")).unwrap();
    }

    fn config(root: &TempDir) -> FinetuneConfig {
        let model_dir = root.path().join("model");
        std::fs::create_dir_all(&model_dir).unwrap();
        write_model_dir(&model_dir);
        let data = root.path().join("data.jsonl");
        write_dataset(&data);
        FinetuneConfig {
            base_model: model_dir,
            base_model_name: "tiny/llama".into(),
            data_path: data,
            output_dir: root.path().join("out"),
            batch_size: 4,
            micro_batch_size: 2,
            cutoff_len: 64,
            warmup_steps: 0,
            lora: LoraConfig { r: 2, alpha: 4, dropout: 0.0, target_modules: vec!["q_proj".into(), "v_proj".into()] },
            prefer_gpu: false,
            ..FinetuneConfig::default()
        }
    }

    #[test]
    fn prepare_writes_masked_examples() {
        let root = TempDir::new().unwrap();
        let mut cfg = config(&root);
        cfg.val_set_size = 2;
        let out = root.path().join("prepared");
        let report = prepare(&cfg, &out).unwrap();

        assert_eq!(report.train.count, 4);
        assert_eq!(report.val.count, 2);
        assert_eq!(report.files.len(), 2);
        assert!(report.train.trainable_tokens < report.train.total_tokens);

        let text = std::fs::read_to_string(out.join("train.jsonl")).unwrap();
        let examples: Vec<TokenizedExample> = text.lines().map(|l| serde_json::from_str(l).unwrap()).collect();
        assert_eq!(examples.len(), 4);
        for ex in &examples {
            assert_eq!(ex.labels.len(), ex.input_ids.len());
            assert_eq!(ex.labels[0], IGNORE_INDEX);
            assert_eq!(*ex.input_ids.last().unwrap(), 2);
        }
    }

    #[test]
    fn training_args_follow_the_tokenizer() {
        let root = TempDir::new().unwrap();
        let cfg = config(&root);
        let tokenizer = load_tokenizer(&cfg.base_model).unwrap();
        let args = cfg.training_args(16, false, &tokenizer);
        assert_eq!(args.pad_token_id, 0);
        assert_eq!(args.padding_side, tokenizer.padding_side());
        assert_eq!(args.padding_side, lorafit_core::PaddingSide::Right);
        assert_eq!(args.gradient_accumulation_steps, 16);
        assert_eq!(args.eval_steps, 0);
    }

    #[test]
    fn prepare_filters_training_examples_only() {
        let root = TempDir::new().unwrap();
        let mut cfg = config(&root);
        cfg.val_set_size = 1;
        cfg.seq_max = 1;
        let report = prepare(&cfg, &root.path().join("prepared")).unwrap();
        assert_eq!(report.train.count, 0);
        assert_eq!(report.filtered_out, 5);
        assert_eq!(report.val.count, 1);
    }

    #[test]
    fn unknown_template_fails_before_tokenizing() {
        let root = TempDir::new().unwrap();
        let mut cfg = config(&root);
        cfg.prompt_template_name = "no-such-template".into();
        assert!(prepare(&cfg, &root.path().join("prepared")).is_err());
    }

    #[test]
    fn run_writes_adapter_tokenizer_and_log() {
        let root = TempDir::new().unwrap();
        let mut cfg = config(&root);
        cfg.val_set_size = 2;
        cfg.wandb_project = Some("lorafit-test".into());
        let stats = run(&cfg).unwrap();
        // 4 training examples, micro 2, accumulation 2 => one step
        assert_eq!(stats.total_steps, 1);

        for file in [ADAPTER_WEIGHTS, ADAPTER_CONFIG, "tokenizer.json", TRAINER_LOG] {
            assert!(cfg.output_dir.join(file).is_file(), "missing {file}");
        }
        let adapter: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(cfg.output_dir.join(ADAPTER_CONFIG)).unwrap()).unwrap();
        assert_eq!(adapter["base_model_name_or_path"], "tiny/llama");

        let log = std::fs::read_to_string(cfg.output_dir.join(TRAINER_LOG)).unwrap();
        assert!(log.lines().all(|l| l.contains("\"project\":\"lorafit-test\"")));
    }

    #[test]
    fn run_resumes_from_saved_adapter() {
        let root = TempDir::new().unwrap();
        let cfg = config(&root);
        run(&cfg).unwrap();

        let mut resumed = cfg.clone();
        resumed.output_dir = root.path().join("out2");
        resumed.resume_from_checkpoint = Some(cfg.output_dir.clone());
        run(&resumed).unwrap();
        assert!(resumed.output_dir.join(ADAPTER_WEIGHTS).is_file());
    }

    #[test]
    fn length_stats_summarise() {
        let ex = |n: usize, masked: usize| {
            let mut labels = vec![1i64; n];
            labels[..masked].fill(IGNORE_INDEX);
            TokenizedExample { input_ids: vec![1; n], attention_mask: vec![1; n], labels }
        };
        let stats = LengthStats::of(&[ex(4, 1), ex(8, 3)]);
        assert_eq!((stats.count, stats.min, stats.max), (2, 4, 8));
        assert_eq!(stats.mean, 6.0);
        assert_eq!(stats.trainable_tokens, 8);
        assert_eq!(LengthStats::of(&[]), LengthStats::default());
    }
}
