//! Low-rank adapters.
//!
//! A [`LoraLinear`] wraps a frozen base projection `W` and adds a trainable
//! update: `y = W x + scale * B (A dropout(x))` with `scale = alpha / r`.
//! `A` (`[r, in]`) starts Kaiming-normal and `B` (`[out, r]`) starts at zero,
//! so a fresh adapter leaves the base model's output unchanged.
//!
//! Adapter weights are created through a `VarBuilder` backed by the adapter
//! `VarMap` and are kept in F32 whatever the base dtype is.

use anyhow::{bail, Result};
use candle_core::{DType, Module, ModuleT, Tensor};
use candle_nn::{Dropout, Linear, VarBuilder};
use serde::{Deserialize, Serialize};

/// Projection names adapters can be attached to.
pub const ATTENTION_MODULES: &[&str] = &["q_proj", "k_proj", "v_proj", "o_proj"];
pub const MLP_MODULES: &[&str] = &["gate_proj", "up_proj", "down_proj"];

// ── Config ────────────────────────────────────────────────────────────────────

/// Adapter hyper-parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct LoraConfig {
    pub r: usize,
    pub alpha: usize,
    pub dropout: f32,
    pub target_modules: Vec<String>,
}

impl Default for LoraConfig {
    fn default() -> Self {
        Self {
            r: 16,
            alpha: 16,
            dropout: 0.05,
            target_modules: vec!["gate_proj".into(), "down_proj".into(), "up_proj".into()],
        }
    }
}

impl LoraConfig {
    /// Reject ranks of zero, dropout outside `[0, 1)` and target names that
    /// match no Llama projection.
    pub fn validate(&self) -> Result<()> {
        if self.r == 0 {
            bail!("lora_r must be at least 1");
        }
        if !(0.0..1.0).contains(&self.dropout) {
            bail!("lora_dropout must be in [0, 1), got {}", self.dropout);
        }
        if self.target_modules.is_empty() {
            bail!("lora_target_modules is empty");
        }
        let unknown: Vec<&str> = self
            .target_modules
            .iter()
            .map(String::as_str)
            .filter(|m| !ATTENTION_MODULES.contains(m) && !MLP_MODULES.contains(m))
            .collect();
        if !unknown.is_empty() {
            bail!(
                "Unknown LoRA target module(s): {} (expected any of {}, {})",
                unknown.join(", "),
                ATTENTION_MODULES.join(", "),
                MLP_MODULES.join(", ")
            );
        }
        Ok(())
    }

    pub fn scale(&self) -> f64 {
        self.alpha as f64 / self.r as f64
    }

    pub fn targets(&self, module: &str) -> bool {
        self.target_modules.iter().any(|m| m == module)
    }

    /// The `adapter_config.json` document for this adapter.
    pub fn to_adapter_config(&self, base_model: &str) -> AdapterConfig {
        AdapterConfig {
            base_model_name_or_path: base_model.to_string(),
            bias: "none".to_string(),
            fan_in_fan_out: false,
            inference_mode: true,
            lora_alpha: self.alpha,
            lora_dropout: self.dropout,
            peft_type: "LORA".to_string(),
            r: self.r,
            target_modules: self.target_modules.clone(),
            task_type: "CAUSAL_LM".to_string(),
        }
    }
}

/// `adapter_config.json`, in the layout PEFT loaders read.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdapterConfig {
    pub base_model_name_or_path: String,
    pub bias: String,
    pub fan_in_fan_out: bool,
    pub inference_mode: bool,
    pub lora_alpha: usize,
    pub lora_dropout: f32,
    pub peft_type: String,
    pub r: usize,
    pub target_modules: Vec<String>,
    pub task_type: String,
}

impl From<&AdapterConfig> for LoraConfig {
    fn from(cfg: &AdapterConfig) -> Self {
        Self {
            r: cfg.r,
            alpha: cfg.lora_alpha,
            dropout: cfg.lora_dropout,
            target_modules: cfg.target_modules.clone(),
        }
    }
}

// ── Layers ────────────────────────────────────────────────────────────────────

/// A frozen linear layer with a trainable low-rank update.
#[derive(Debug, Clone)]
pub struct LoraLinear {
    base: Linear,
    lora_a: Tensor,
    lora_b: Tensor,
    scale: f64,
    dropout: Dropout,
}

impl LoraLinear {
    /// Attach an adapter to `base`; `vb` is already prefixed with the module path.
    pub fn new(base: Linear, cfg: &LoraConfig, vb: VarBuilder) -> candle_core::Result<Self> {
        let (out_dim, in_dim) = base.weight().dims2()?;
        let lora_a = vb.get_with_hints((cfg.r, in_dim), "lora_A.weight", candle_nn::init::DEFAULT_KAIMING_NORMAL)?;
        let lora_b = vb.get_with_hints((out_dim, cfg.r), "lora_B.weight", candle_nn::init::ZERO)?;
        Ok(Self { base, lora_a, lora_b, scale: cfg.scale(), dropout: Dropout::new(cfg.dropout) })
    }

    pub fn forward_t(&self, x: &Tensor, train: bool) -> candle_core::Result<Tensor> {
        let y = self.base.forward(x)?;
        let h = self.dropout.forward_t(&x.to_dtype(DType::F32)?, train)?;
        let delta = h
            .broadcast_matmul(&self.lora_a.t()?)?
            .broadcast_matmul(&self.lora_b.t()?)?;
        let delta = (delta * self.scale)?.to_dtype(y.dtype())?;
        y + delta
    }
}

/// A projection inside a transformer block, with or without an adapter.
#[derive(Debug, Clone)]
pub enum Projection {
    Frozen(Linear),
    Adapted(LoraLinear),
}

impl Projection {
    /// Load `name` from `base_vb`, attaching an adapter under `adapter_vb`
    /// when `cfg` targets it.
    pub fn load(
        name: &str,
        in_dim: usize,
        out_dim: usize,
        base_vb: &VarBuilder,
        adapter_vb: &VarBuilder,
        cfg: &LoraConfig,
    ) -> candle_core::Result<Self> {
        let base = candle_nn::linear_no_bias(in_dim, out_dim, base_vb.pp(name))?;
        if cfg.targets(name) {
            Ok(Self::Adapted(LoraLinear::new(base, cfg, adapter_vb.pp(name))?))
        } else {
            Ok(Self::Frozen(base))
        }
    }

    pub fn forward_t(&self, x: &Tensor, train: bool) -> candle_core::Result<Tensor> {
        match self {
            Self::Frozen(linear) => linear.forward(x),
            Self::Adapted(lora) => lora.forward_t(x, train),
        }
    }

    pub fn base_params(&self) -> usize {
        match self {
            Self::Frozen(linear) => linear.weight().elem_count(),
            Self::Adapted(lora) => lora.base.weight().elem_count(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{Device, Var};
    use candle_nn::VarMap;

    fn base_linear(out_dim: usize, in_dim: usize) -> Linear {
        let w = Tensor::randn(0f32, 1.0, (out_dim, in_dim), &Device::Cpu).unwrap();
        Linear::new(w, None)
    }

    #[test]
    fn default_config_is_valid() {
        let cfg = LoraConfig::default();
        cfg.validate().unwrap();
        assert_eq!(cfg.scale(), 1.0);
    }

    #[test]
    fn unknown_target_rejected() {
        let cfg = LoraConfig { target_modules: vec!["q_proj".into(), "qkv".into()], ..Default::default() };
        let err = cfg.validate().unwrap_err().to_string();
        assert!(err.contains("qkv"), "{err}");
    }

    #[test]
    fn zero_rank_and_bad_dropout_rejected() {
        assert!(LoraConfig { r: 0, ..Default::default() }.validate().is_err());
        assert!(LoraConfig { dropout: 1.0, ..Default::default() }.validate().is_err());
    }

    #[test]
    fn adapter_config_uses_peft_layout() {
        let cfg = LoraConfig { r: 8, alpha: 16, ..Default::default() };
        let json = serde_json::to_value(cfg.to_adapter_config("llama-7b")).unwrap();
        assert_eq!(json["peft_type"], "LORA");
        assert_eq!(json["task_type"], "CAUSAL_LM");
        assert_eq!(json["r"], 8);
        assert_eq!(json["lora_alpha"], 16);
        assert_eq!(json["target_modules"][0], "gate_proj");
        let back: AdapterConfig = serde_json::from_value(json).unwrap();
        assert_eq!(LoraConfig::from(&back), cfg);
    }

    #[test]
    fn fresh_adapter_is_identity_and_registers_vars() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let cfg = LoraConfig { r: 4, alpha: 8, dropout: 0.0, target_modules: vec!["q_proj".into()] };
        let base = base_linear(6, 5);
        let lora = LoraLinear::new(base.clone(), &cfg, vb.pp("layer.q_proj")).unwrap();

        let mut names: Vec<String> = varmap.data().lock().unwrap().keys().cloned().collect();
        names.sort();
        assert_eq!(names, vec!["layer.q_proj.lora_A.weight", "layer.q_proj.lora_B.weight"]);

        let x = Tensor::randn(0f32, 1.0, (2, 3, 5), &Device::Cpu).unwrap();
        let diff = (lora.forward_t(&x, true).unwrap() - base.forward(&x).unwrap())
            .unwrap()
            .abs()
            .unwrap()
            .max_all()
            .unwrap()
            .to_scalar::<f32>()
            .unwrap();
        assert!(diff < 1e-6);
    }

    #[test]
    fn forward_matches_merged_weight() {
        let cfg = LoraConfig { r: 2, alpha: 4, dropout: 0.0, target_modules: vec!["v_proj".into()] };
        let base = base_linear(3, 4);
        let a = Var::randn(0f32, 1.0, (2, 4), &Device::Cpu).unwrap();
        let b = Var::randn(0f32, 1.0, (3, 2), &Device::Cpu).unwrap();
        let lora = LoraLinear {
            base,
            lora_a: a.as_tensor().clone(),
            lora_b: b.as_tensor().clone(),
            scale: cfg.scale(),
            dropout: Dropout::new(0.0),
        };
        let x = Tensor::randn(0f32, 1.0, (5, 4), &Device::Cpu).unwrap();
        // W + scale * B A
        let delta = (lora.lora_b.matmul(&lora.lora_a).unwrap() * lora.scale).unwrap();
        let merged = Linear::new((lora.base.weight() + delta).unwrap(), None);
        let diff = (lora.forward_t(&x, false).unwrap() - merged.forward(&x).unwrap())
            .unwrap()
            .abs()
            .unwrap()
            .max_all()
            .unwrap()
            .to_scalar::<f32>()
            .unwrap();
        assert!(diff < 1e-4, "diff {diff}");
    }

    #[test]
    fn gradients_reach_only_adapter() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let cfg = LoraConfig { r: 2, alpha: 2, dropout: 0.0, target_modules: vec!["o_proj".into()] };
        let lora = LoraLinear::new(base_linear(3, 4), &cfg, vb.pp("o_proj")).unwrap();
        let x = Tensor::randn(0f32, 1.0, (2, 4), &Device::Cpu).unwrap();
        let loss = lora.forward_t(&x, true).unwrap().sqr().unwrap().sum_all().unwrap();
        let grads = loss.backward().unwrap();
        for var in varmap.all_vars() {
            assert!(grads.get(var.as_tensor()).is_some());
        }
        assert!(grads.get(lora.base.weight()).is_none());
    }
}
