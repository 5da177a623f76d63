pub mod prepare;
pub mod templates;
pub mod train;

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::Args;

use lorafit_hub::HubResolver;
use lorafit_train::FinetuneConfig;

use crate::config::AppConfig;

/// Options shared by `train` and `prepare`: where the data comes from and
/// how it is rendered, tokenized and filtered.
#[derive(Debug, Clone, Args)]
pub struct DatasetArgs {
    /// Base model: Hugging Face repo id or local directory.
    #[arg(long)]
    pub base_model: String,

    /// Dataset: `.json`/`.jsonl` file, directory of them, or Hub dataset id.
    #[arg(long, default_value = "yahma/alpaca-cleaned")]
    pub data_path: String,

    /// Maximum tokens per example; longer prompts are truncated.
    #[arg(long, default_value_t = 4096)]
    pub cutoff_len: usize,

    /// Records held out for evaluation (0 disables evaluation).
    #[arg(long, default_value_t = 0)]
    pub val_set_size: usize,

    /// Compute the loss on the instruction prefix too.
    #[arg(long)]
    pub train_on_inputs: bool,

    /// Append EOS to the instruction prefix before measuring its length.
    #[arg(long)]
    pub add_eos_token: bool,

    /// Prompt template name (built-in or `<templates.dir>/<name>.json`).
    #[arg(long, default_value = "alpaca")]
    pub prompt_template_name: String,

    /// Drop training examples shorter than this many tokens.
    #[arg(long, default_value_t = 0)]
    pub seq_min: usize,

    /// Drop training examples longer than this many tokens.
    #[arg(long, default_value_t = 4096)]
    pub seq_max: usize,
}

impl DatasetArgs {
    /// Resolve the model and dataset to local paths and fill the dataset
    /// part of a [`FinetuneConfig`].
    pub async fn resolve(&self, config: &AppConfig) -> Result<FinetuneConfig> {
        self.validate()?;
        let resolver = hub_resolver(config)?;
        let base_model = resolver
            .resolve_model(&self.base_model)
            .await
            .with_context(|| format!("Cannot resolve base model '{}'", self.base_model))?;
        let data_path = resolver
            .resolve_dataset(&self.data_path)
            .await
            .with_context(|| format!("Cannot resolve dataset '{}'", self.data_path))?;

        Ok(FinetuneConfig {
            base_model,
            base_model_name: self.base_model.clone(),
            data_path,
            cutoff_len: self.cutoff_len,
            val_set_size: self.val_set_size,
            train_on_inputs: self.train_on_inputs,
            add_eos_token: self.add_eos_token,
            prompt_template_name: self.prompt_template_name.clone(),
            template_dir: existing_dir(&config.template_dir()),
            seq_min: self.seq_min,
            seq_max: self.seq_max,
            prefer_gpu: config.device.prefer_gpu,
            ..FinetuneConfig::default()
        })
    }
}

impl DatasetArgs {
    /// Reject settings that cannot work before anything is downloaded.
    fn validate(&self) -> Result<()> {
        if self.base_model.trim().is_empty() {
            bail!("Please specify a --base-model, e.g. --base-model='huggyllama/llama-7b'");
        }
        if self.data_path.trim().is_empty() {
            bail!("--data-path must not be empty");
        }
        Ok(())
    }
}

fn hub_resolver(config: &AppConfig) -> Result<HubResolver> {
    let token = std::env::var("HUGGING_FACE_HUB_TOKEN").or_else(|_| std::env::var("HF_TOKEN")).ok();
    HubResolver::new(Path::new(&config.model.cache_dir), token).context("Cannot set up the Hub cache")
}

fn existing_dir(path: &Path) -> Option<PathBuf> {
    path.is_dir().then(|| path.to_path_buf())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[derive(Debug, Parser)]
    struct Harness {
        #[command(flatten)]
        data: DatasetArgs,
    }

    fn args(extra: &[&str]) -> DatasetArgs {
        let argv = ["lorafit"].into_iter().chain(extra.iter().copied());
        Harness::try_parse_from(argv).unwrap().data
    }

    #[tokio::test]
    async fn empty_base_model_fails_before_resolution() {
        let cache = tempfile::TempDir::new().unwrap();
        let mut config = AppConfig::default();
        config.model.cache_dir = cache.path().join("hub").display().to_string();

        for name in ["", "   "] {
            let err = args(&["--base-model", name]).resolve(&config).await.unwrap_err();
            assert!(err.to_string().contains("--base-model"), "{err}");
        }
        assert!(!cache.path().join("hub").exists());
    }

    #[test]
    fn empty_data_path_rejected() {
        assert!(args(&["--base-model", "m", "--data-path", ""]).validate().is_err());
        assert!(args(&["--base-model", "m"]).validate().is_ok());
    }
}
