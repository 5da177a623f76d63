//! Llama-family causal LM with LoRA adapters.
//!
//! `candle_transformers::models::llama::Llama` only returns last-position
//! logits, so training needs its own forward pass producing logits for every
//! position.  This module builds one from the same `config.json` and weight
//! names.
//!
//! ## Two parameter stores
//!
//! * **Base weights** come from a `VarBuilder` over memory-mapped safetensors
//!   in the training dtype (BF16 on CUDA, F32 on CPU).  They are plain tensors,
//!   so the optimiser never sees them.
//! * **Adapter weights** live in their own [`VarMap`] in F32, named the way
//!   PEFT names them: `base_model.model.model.layers.{i}.mlp.down_proj.lora_A.weight`.
//!
//! Attention scores, softmax and the loss are computed in F32.  Norms,
//! softmax and RoPE use candle's composed-op variants so gradients flow back
//! through them to the adapters.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{Context, Result};
use candle_core::{DType, Device, Module, Tensor, Var, D};
use candle_nn::{Embedding, Linear, VarBuilder, VarMap};
use candle_transformers::models::llama::{Config as LlamaConfig, LlamaConfig as HfLlamaConfig};
use tracing::{debug, info, warn};

use lorafit_core::IGNORE_INDEX;

use crate::collator::Batch;
use crate::lora::{LoraConfig, Projection};

/// Prefix PEFT puts in front of every adapted module path.
pub const ADAPTER_PREFIX: &str = "base_model.model";

const MASK_VALUE: f64 = -1e9;

// ── Building blocks ───────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
struct RmsNorm {
    weight: Tensor,
    eps: f32,
}

impl RmsNorm {
    fn load(size: usize, eps: f64, vb: VarBuilder) -> candle_core::Result<Self> {
        let weight = vb.get_with_hints(size, "weight", candle_nn::Init::Const(1.0))?;
        Ok(Self { weight, eps: eps as f32 })
    }

    fn forward(&self, x: &Tensor) -> candle_core::Result<Tensor> {
        candle_nn::ops::rms_norm_slow(x, &self.weight, self.eps)
    }
}

#[derive(Debug, Clone)]
struct RotaryEmbedding {
    inv_freq: Tensor,
}

impl RotaryEmbedding {
    fn new(head_dim: usize, theta: f32, device: &Device) -> candle_core::Result<Self> {
        let inv_freq: Vec<f32> = (0..head_dim)
            .step_by(2)
            .map(|i| 1.0 / theta.powf(i as f32 / head_dim as f32))
            .collect();
        let n = inv_freq.len();
        Ok(Self { inv_freq: Tensor::from_vec(inv_freq, (1, n), device)? })
    }

    /// `(cos, sin)`, each `[seq_len, head_dim / 2]`.
    fn cos_sin(&self, seq_len: usize, dtype: DType) -> candle_core::Result<(Tensor, Tensor)> {
        let device = self.inv_freq.device();
        let t = Tensor::arange(0u32, seq_len as u32, device)?
            .to_dtype(DType::F32)?
            .reshape((seq_len, 1))?;
        let freqs = t.broadcast_mul(&self.inv_freq)?;
        Ok((freqs.cos()?.to_dtype(dtype)?, freqs.sin()?.to_dtype(dtype)?))
    }

    fn bytes(&self) -> usize {
        self.inv_freq.elem_count() * self.inv_freq.dtype().size_in_bytes()
    }
}

#[derive(Debug, Clone)]
struct Attention {
    q_proj: Projection,
    k_proj: Projection,
    v_proj: Projection,
    o_proj: Projection,
    num_heads: usize,
    num_kv_heads: usize,
    head_dim: usize,
}

impl Attention {
    fn load(cfg: &LlamaConfig, base_vb: &VarBuilder, adapter_vb: &VarBuilder, lora: &LoraConfig) -> candle_core::Result<Self> {
        let hidden = cfg.hidden_size;
        let head_dim = hidden / cfg.num_attention_heads;
        let kv_dim = head_dim * cfg.num_key_value_heads;
        Ok(Self {
            q_proj: Projection::load("q_proj", hidden, hidden, base_vb, adapter_vb, lora)?,
            k_proj: Projection::load("k_proj", hidden, kv_dim, base_vb, adapter_vb, lora)?,
            v_proj: Projection::load("v_proj", hidden, kv_dim, base_vb, adapter_vb, lora)?,
            o_proj: Projection::load("o_proj", hidden, hidden, base_vb, adapter_vb, lora)?,
            num_heads: cfg.num_attention_heads,
            num_kv_heads: cfg.num_key_value_heads,
            head_dim,
        })
    }

    fn forward_t(&self, x: &Tensor, cos: &Tensor, sin: &Tensor, bias: &Tensor, train: bool) -> candle_core::Result<Tensor> {
        let (b, t, _) = x.dims3()?;
        let heads = |p: &Projection, n: usize| -> candle_core::Result<Tensor> {
            p.forward_t(x, train)?
                .reshape((b, t, n, self.head_dim))?
                .transpose(1, 2)?
                .contiguous()
        };
        let q = candle_nn::rotary_emb::rope_slow(&heads(&self.q_proj, self.num_heads)?, cos, sin)?;
        let k = candle_nn::rotary_emb::rope_slow(&heads(&self.k_proj, self.num_kv_heads)?, cos, sin)?;
        let v = heads(&self.v_proj, self.num_kv_heads)?;

        let n_rep = self.num_heads / self.num_kv_heads;
        let k = candle_transformers::utils::repeat_kv(k, n_rep)?.contiguous()?;
        let v = candle_transformers::utils::repeat_kv(v, n_rep)?.contiguous()?;

        let q = q.to_dtype(DType::F32)?;
        let k = k.to_dtype(DType::F32)?;
        let v = v.to_dtype(DType::F32)?;
        let scores = (q.matmul(&k.t()?)? / (self.head_dim as f64).sqrt())?.broadcast_add(bias)?;
        let probs = candle_nn::ops::softmax(&scores, D::Minus1)?;
        let y = probs
            .matmul(&v)?
            .to_dtype(x.dtype())?
            .transpose(1, 2)?
            .reshape((b, t, self.num_heads * self.head_dim))?;
        self.o_proj.forward_t(&y, train)
    }
}

#[derive(Debug, Clone)]
struct Mlp {
    gate_proj: Projection,
    up_proj: Projection,
    down_proj: Projection,
}

impl Mlp {
    fn load(cfg: &LlamaConfig, base_vb: &VarBuilder, adapter_vb: &VarBuilder, lora: &LoraConfig) -> candle_core::Result<Self> {
        let (h, i) = (cfg.hidden_size, cfg.intermediate_size);
        Ok(Self {
            gate_proj: Projection::load("gate_proj", h, i, base_vb, adapter_vb, lora)?,
            up_proj: Projection::load("up_proj", h, i, base_vb, adapter_vb, lora)?,
            down_proj: Projection::load("down_proj", i, h, base_vb, adapter_vb, lora)?,
        })
    }

    fn forward_t(&self, x: &Tensor, train: bool) -> candle_core::Result<Tensor> {
        let gate = self.gate_proj.forward_t(x, train)?.silu()?;
        let up = self.up_proj.forward_t(x, train)?;
        self.down_proj.forward_t(&(gate * up)?, train)
    }
}

#[derive(Debug, Clone)]
struct DecoderLayer {
    input_layernorm: RmsNorm,
    self_attn: Attention,
    post_attention_layernorm: RmsNorm,
    mlp: Mlp,
}

impl DecoderLayer {
    fn load(cfg: &LlamaConfig, base_vb: VarBuilder, adapter_vb: VarBuilder, lora: &LoraConfig) -> candle_core::Result<Self> {
        Ok(Self {
            input_layernorm: RmsNorm::load(cfg.hidden_size, cfg.rms_norm_eps, base_vb.pp("input_layernorm"))?,
            self_attn: Attention::load(cfg, &base_vb.pp("self_attn"), &adapter_vb.pp("self_attn"), lora)?,
            post_attention_layernorm: RmsNorm::load(
                cfg.hidden_size,
                cfg.rms_norm_eps,
                base_vb.pp("post_attention_layernorm"),
            )?,
            mlp: Mlp::load(cfg, &base_vb.pp("mlp"), &adapter_vb.pp("mlp"), lora)?,
        })
    }

    fn forward_t(&self, x: &Tensor, cos: &Tensor, sin: &Tensor, bias: &Tensor, train: bool) -> candle_core::Result<Tensor> {
        let h = self.self_attn.forward_t(&self.input_layernorm.forward(x)?, cos, sin, bias, train)?;
        let x = (x + h)?;
        let h = self.mlp.forward_t(&self.post_attention_layernorm.forward(&x)?, train)?;
        x + h
    }

    fn base_params(&self) -> usize {
        let a = &self.self_attn;
        let m = &self.mlp;
        [&a.q_proj, &a.k_proj, &a.v_proj, &a.o_proj, &m.gate_proj, &m.up_proj, &m.down_proj]
            .iter()
            .map(|p| p.base_params())
            .sum::<usize>()
            + self.input_layernorm.weight.elem_count()
            + self.post_attention_layernorm.weight.elem_count()
    }
}

// ── Model ─────────────────────────────────────────────────────────────────────

/// Parameter counts, as PEFT's `print_trainable_parameters` reports them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParamSummary {
    pub trainable: usize,
    pub total: usize,
}

impl ParamSummary {
    pub fn trainable_percent(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            100.0 * self.trainable as f64 / self.total as f64
        }
    }
}

impl std::fmt::Display for ParamSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "trainable params: {} || all params: {} || trainable%: {}",
            self.trainable,
            self.total,
            self.trainable_percent()
        )
    }
}

/// A Llama model whose targeted projections carry trainable adapters.
pub struct LoraModel {
    embed_tokens: Embedding,
    layers: Vec<DecoderLayer>,
    norm: RmsNorm,
    lm_head: Linear,
    tied_embeddings: bool,
    rotary: RotaryEmbedding,
    adapters: VarMap,
    trainable: Vec<Var>,
    lora: LoraConfig,
    base_model: String,
    device: Device,
    dtype: DType,
    log_activations: AtomicBool,
}

impl LoraModel {
    // ── Constructors ──────────────────────────────────────────────────────────

    /// Load `config.json` and safetensors weights from `model_dir` and attach
    /// fresh adapters.
    pub fn from_pretrained(model_dir: &Path, lora: &LoraConfig, device: &Device, dtype: DType) -> Result<Self> {
        let config = read_llama_config(model_dir)?;
        let weights = collect_safetensor_paths(model_dir)?;

        info!(
            model_dir = %model_dir.display(),
            num_hidden_layers = config.num_hidden_layers,
            hidden_size = config.hidden_size,
            vocab_size = config.vocab_size,
            shards = weights.len(),
            ?dtype,
            "Loading base model"
        );

        // SAFETY: the weight files are not modified while the model is alive.
        let base_vb = unsafe { VarBuilder::from_mmaped_safetensors(&weights, dtype, device) }
            .context("Failed to memory-map base weights")?;
        Self::new(config, base_vb, lora, &model_dir.display().to_string(), device)
    }

    /// Build from an arbitrary base `VarBuilder`.
    pub fn new(config: LlamaConfig, base_vb: VarBuilder, lora: &LoraConfig, base_model: &str, device: &Device) -> Result<Self> {
        lora.validate()?;
        if config.rope_scaling.is_some() {
            warn!("rope_scaling in config.json is ignored; positions use plain RoPE");
        }
        if config.hidden_size % config.num_attention_heads != 0
            || config.num_attention_heads % config.num_key_value_heads != 0
        {
            anyhow::bail!(
                "Inconsistent attention shape: hidden_size {} / heads {} / kv heads {}",
                config.hidden_size,
                config.num_attention_heads,
                config.num_key_value_heads
            );
        }

        let dtype = base_vb.dtype();
        let adapters = VarMap::new();
        let adapter_vb = VarBuilder::from_varmap(&adapters, DType::F32, device);
        let adapter_layers = adapter_vb.pp(ADAPTER_PREFIX).pp("model.layers");

        let embed_tokens = candle_nn::embedding(config.vocab_size, config.hidden_size, base_vb.pp("model.embed_tokens"))
            .context("Failed to load token embeddings")?;
        let layers = (0..config.num_hidden_layers)
            .map(|i| {
                DecoderLayer::load(&config, base_vb.pp(format!("model.layers.{i}")), adapter_layers.pp(i), lora)
                    .with_context(|| format!("Failed to load decoder layer {i}"))
            })
            .collect::<Result<Vec<_>>>()?;
        let norm = RmsNorm::load(config.hidden_size, config.rms_norm_eps, base_vb.pp("model.norm"))?;
        let lm_head = if config.tie_word_embeddings {
            Linear::new(embed_tokens.embeddings().clone(), None)
        } else {
            candle_nn::linear_no_bias(config.hidden_size, config.vocab_size, base_vb.pp("lm_head"))
                .context("Failed to load lm_head")?
        };
        let head_dim = config.hidden_size / config.num_attention_heads;
        let rotary = RotaryEmbedding::new(head_dim, config.rope_theta, device)?;

        let trainable: Vec<Var> = named_vars(&adapters)?.into_iter().map(|(_, v)| v).collect();
        debug!(adapter_tensors = trainable.len(), "Adapters attached");

        Ok(Self {
            embed_tokens,
            layers,
            norm,
            lm_head,
            tied_embeddings: config.tie_word_embeddings,
            rotary,
            adapters,
            trainable,
            lora: lora.clone(),
            base_model: base_model.to_string(),
            device: device.clone(),
            dtype,
            log_activations: AtomicBool::new(false),
        })
    }

    // ── Forward ───────────────────────────────────────────────────────────────

    /// Logits for every position, `[batch, seq_len, vocab]` in F32.
    pub fn forward_t(&self, input_ids: &Tensor, attention_mask: Option<&Tensor>, train: bool) -> Result<Tensor> {
        let (b, t) = input_ids.dims2().context("Expected 2-D input_ids [batch, seq_len]")?;
        let log = self.log_activations.swap(false, Ordering::Relaxed);

        let bias = attention_bias(b, t, attention_mask, &self.device)?;
        let (cos, sin) = self.rotary.cos_sin(t, self.dtype)?;

        let mut x = self.embed_tokens.forward(input_ids)?;
        if log {
            log_activation("model.embed_tokens", &x);
        }
        for (i, layer) in self.layers.iter().enumerate() {
            x = layer.forward_t(&x, &cos, &sin, &bias, train)?;
            if log {
                log_activation(&format!("model.layers.{i}"), &x);
            }
        }
        let x = self.norm.forward(&x)?;
        let logits = self.lm_head.forward(&x)?.to_dtype(DType::F32)?;
        if log {
            log_activation("lm_head", &logits);
        }
        Ok(logits)
    }

    /// Mean next-token cross-entropy over the positions whose shifted label
    /// is not `IGNORE_INDEX`, plus the number of such positions.
    pub fn loss(&self, batch: &Batch, train: bool) -> Result<(Tensor, usize)> {
        let (input_ids, attention_mask) = batch.to_tensors(&self.device)?;
        let logits = self.forward_t(&input_ids, Some(&attention_mask), train)?;
        causal_lm_loss(&logits, &batch.labels, batch.batch_size, batch.seq_len)
    }

    // ── Introspection ─────────────────────────────────────────────────────────

    /// Log per-layer output shapes and sizes on the next forward pass.
    pub fn log_activations_once(&self) {
        self.log_activations.store(true, Ordering::Relaxed);
    }

    /// Adapter variables, in a fixed order.
    pub fn trainable_vars(&self) -> &[Var] {
        &self.trainable
    }

    pub fn adapters(&self) -> &VarMap {
        &self.adapters
    }

    pub fn lora_config(&self) -> &LoraConfig {
        &self.lora
    }

    pub fn base_model(&self) -> &str {
        &self.base_model
    }

    /// Name recorded as `base_model_name_or_path` in the adapter config.
    pub fn set_base_model(&mut self, name: impl Into<String>) {
        self.base_model = name.into();
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    fn base_params(&self) -> usize {
        let head = if self.tied_embeddings { 0 } else { self.lm_head.weight().elem_count() };
        self.embed_tokens.embeddings().elem_count()
            + self.layers.iter().map(DecoderLayer::base_params).sum::<usize>()
            + self.norm.weight.elem_count()
            + head
    }

    pub fn param_summary(&self) -> ParamSummary {
        let trainable: usize = self.trainable.iter().map(|v| v.elem_count()).sum();
        ParamSummary { trainable, total: self.base_params() + trainable }
    }

    /// Parameter and buffer sizes in bytes.
    pub fn size(&self) -> ModelSize {
        let adapter_bytes = self.param_summary().trainable * DType::F32.size_in_bytes();
        ModelSize {
            param_bytes: self.base_params() * self.dtype.size_in_bytes() + adapter_bytes,
            adapter_bytes,
            buffer_bytes: self.rotary.bytes(),
        }
    }

    /// Log parameter and buffer sizes in MB.
    pub fn log_size(&self) {
        const MB: f64 = 1024.0 * 1024.0;
        let size = self.size();
        info!(
            params_mb = %format!("{:.3}", size.param_bytes as f64 / MB),
            adapter_mb = %format!("{:.3}", size.adapter_bytes as f64 / MB),
            buffers_mb = %format!("{:.3}", size.buffer_bytes as f64 / MB),
            total_mb = %format!("{:.3}", size.total_bytes() as f64 / MB),
            "Model size"
        );
    }
}

/// Memory held by a [`LoraModel`].  `param_bytes` includes the adapters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModelSize {
    pub param_bytes: usize,
    pub adapter_bytes: usize,
    pub buffer_bytes: usize,
}

impl ModelSize {
    pub fn total_bytes(&self) -> usize {
        self.param_bytes + self.buffer_bytes
    }
}

// ── Loss ──────────────────────────────────────────────────────────────────────

/// Shifted, masked cross-entropy.  `labels` is the row-major `[batch, seq_len]`
/// label matrix; position `i` of each row is scored against label `i + 1`.
pub fn causal_lm_loss(logits: &Tensor, labels: &[i64], batch: usize, seq_len: usize) -> Result<(Tensor, usize)> {
    let vocab = logits.dim(D::Minus1)?;
    let device = logits.device();
    if seq_len < 2 {
        return Ok((Tensor::zeros((), DType::F32, device)?, 0));
    }

    let n = batch * (seq_len - 1);
    let mut targets = Vec::with_capacity(n);
    let mut mask = Vec::with_capacity(n);
    for row in labels.chunks(seq_len) {
        for &label in &row[1..] {
            let keep = label != IGNORE_INDEX;
            targets.push(if keep { label as u32 } else { 0 });
            mask.push(if keep { 1f32 } else { 0f32 });
        }
    }
    let count = mask.iter().filter(|&&m| m > 0.0).count();

    let logits = logits.narrow(1, 0, seq_len - 1)?.reshape((n, vocab))?;
    let log_probs = candle_nn::ops::log_softmax(&logits, D::Minus1)?;
    let targets = Tensor::from_vec(targets, (n, 1), device)?;
    let mask = Tensor::from_vec(mask, n, device)?;
    let picked = log_probs.gather(&targets, 1)?.squeeze(1)?;
    let loss = ((picked * mask)?.sum_all()?.neg()? / count.max(1) as f64)?;
    Ok((loss, count))
}

/// Additive attention bias `[batch, 1, t, t]`: causal, plus padded keys when
/// an attention mask is given.
fn attention_bias(batch: usize, t: usize, attention_mask: Option<&Tensor>, device: &Device) -> Result<Tensor> {
    let causal: Vec<f32> = (0..t)
        .flat_map(|i| (0..t).map(move |j| if j > i { MASK_VALUE as f32 } else { 0.0 }))
        .collect();
    let causal = Tensor::from_vec(causal, (1, 1, t, t), device)?;
    let Some(mask) = attention_mask else {
        return Ok(causal.broadcast_as((batch, 1, t, t))?.contiguous()?);
    };
    let padded = ((1.0 - mask.to_dtype(DType::F32)?)? * MASK_VALUE)?.reshape((batch, 1, 1, t))?;
    Ok(causal.broadcast_add(&padded)?)
}

fn log_activation(name: &str, t: &Tensor) {
    let mb = (t.elem_count() * t.dtype().size_in_bytes()) as f64 / (1024.0 * 1024.0);
    info!(module = name, shape = ?t.dims(), mb = %format!("{mb:.3}"), "Activation");
}

// ── Loading helpers ───────────────────────────────────────────────────────────

/// `(name, variable)` pairs of `varmap`, ordered by name.
pub(crate) fn named_vars(varmap: &VarMap) -> Result<Vec<(String, Var)>> {
    let data = varmap
        .data()
        .lock()
        .map_err(|e| anyhow::anyhow!("Adapter store lock poisoned: {e}"))?;
    let mut named: Vec<(String, Var)> = data.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
    named.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(named)
}

pub fn read_llama_config(model_dir: &Path) -> Result<LlamaConfig> {
    let path = model_dir.join("config.json");
    let json = std::fs::read_to_string(&path).with_context(|| format!("Cannot read {}", path.display()))?;
    let hf: HfLlamaConfig =
        serde_json::from_str(&json).with_context(|| format!("Cannot parse {}", path.display()))?;
    Ok(hf.into_config(false))
}

fn collect_safetensor_paths(dir: &Path) -> Result<Vec<PathBuf>> {
    let index_path = dir.join("model.safetensors.index.json");
    if index_path.exists() {
        let json = std::fs::read_to_string(&index_path)
            .with_context(|| format!("Cannot read {}", index_path.display()))?;
        let index: serde_json::Value = serde_json::from_str(&json)?;
        let mut shards: Vec<String> = index["weight_map"]
            .as_object()
            .map(|m| m.values().filter_map(|v| v.as_str()).map(String::from).collect())
            .unwrap_or_default();
        shards.sort();
        shards.dedup();
        anyhow::ensure!(!shards.is_empty(), "Empty weight_map in {}", index_path.display());
        return Ok(shards.iter().map(|s| dir.join(s)).collect());
    }

    let single = dir.join("model.safetensors");
    if single.exists() {
        return Ok(vec![single]);
    }

    anyhow::bail!("No safetensors weights found in {}", dir.display());
}

// ── Test fixtures ─────────────────────────────────────────────────────────────

/// Tiny Llama configuration: 2 layers, hidden 16, 4 heads / 2 KV heads, vocab 24.
#[cfg(test)]
pub(crate) fn tiny_config() -> LlamaConfig {
    let json = serde_json::json!({
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
    serde_json::from_value::<HfLlamaConfig>(json).unwrap().into_config(false)
}

/// A tiny model with random base weights held in `base`.
#[cfg(test)]
pub(crate) fn tiny_model(base: &VarMap, lora: &LoraConfig) -> LoraModel {
    let vb = VarBuilder::from_varmap(base, DType::F32, &Device::Cpu);
    LoraModel::new(tiny_config(), vb, lora, "tiny-llama", &Device::Cpu).unwrap()
}
