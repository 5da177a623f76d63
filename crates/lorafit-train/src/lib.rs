//! # lorafit-train
//!
//! LoRA fine-tuning of Llama-family models on instruction datasets.
//!
//! The base model is loaded in BF16 (CUDA) or F32 (CPU) and frozen.  Low-rank
//! adapter pairs `A`/`B` are attached to the selected projections of every
//! decoder layer and are the only trainable parameters:
//!
//! ```text
//! y = W·x + (alpha / r) · B·A·dropout(x)
//! ```
//!
//! Adapters are written in the PEFT layout (`adapter_model.safetensors` +
//! `adapter_config.json`) so they can be loaded by other tooling.
//!
//! ## Usage
//!
//! ```text
//! lorafit train \
//!   --base-model     huggyllama/llama-7b \
//!   --data-path      yahma/alpaca-cleaned \
//!   --output-dir     ./lora-alpaca \
//!   --val-set-size   2000 \
//!   --lora-target-modules q_proj,v_proj
//! ```
//!
//! | Module | Contents |
//! |--------|----------|
//! | [`dataset`] | Record loading, seeded train/val split, per-rank sharding |
//! | [`lora`] | Adapter config and the LoRA linear layer |
//! | [`model`] | Llama decoder with adapters, causal-LM loss |
//! | [`collator`] | Padding collation and micro-batch ordering |
//! | [`schedule`] | Warmup + cosine / linear / constant learning rate |
//! | [`trainer`] | Accumulating AdamW loop, evaluation, checkpoint rotation |
//! | [`callbacks`] | Save, load-best and log-history hooks |
//! | [`checkpoint`] | On-disk layout, adapter persistence, resume |
//! | [`finetune`] | End-to-end driver and dataset preparation |

pub mod callbacks;
pub mod checkpoint;
pub mod collator;
pub mod dataset;
pub mod finetune;
pub mod lora;
pub mod model;
pub mod schedule;
pub mod trainer;

pub use finetune::{prepare, run, FinetuneConfig, LengthStats, PrepareReport};
pub use lora::LoraConfig;
pub use model::LoraModel;
pub use schedule::SchedulerKind;
pub use trainer::{Trainer, TrainingArgs, TrainingStats};
