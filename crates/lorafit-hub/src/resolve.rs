use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use hf_hub::api::tokio::{Api, ApiBuilder, ApiRepo};
use tracing::{debug, info, warn};

use crate::error::{HubError, HubResult};

/// Files every base-model directory must provide besides its weights.
pub const REQUIRED_MODEL_FILES: &[&str] = &["config.json", "tokenizer.json"];

pub const SAFETENSORS_INDEX: &str = "model.safetensors.index.json";
pub const SAFETENSORS_SINGLE: &str = "model.safetensors";

// ─── Resolver ─────────────────────────────────────────────────────────────────

/// Turns a model or dataset identifier into local files.
///
/// Anything that already exists on disk is used in place; everything else
/// is treated as a Hub repository id and fetched into `cache_dir` through
/// `hf-hub`, which skips files it has already downloaded.
pub struct HubResolver {
    api: Api,
}

impl HubResolver {
    /// Build a resolver caching under `cache_dir` (`~` is expanded).
    pub fn new(cache_dir: &Path, token: Option<String>) -> HubResult<Self> {
        let cache_dir = expand_tilde(cache_dir);
        std::fs::create_dir_all(&cache_dir)
            .map_err(|e| HubError::InvalidCacheDir(format!("{}: {e}", cache_dir.display())))?;

        let mut builder = ApiBuilder::new().with_cache_dir(cache_dir);
        if let Some(token) = token.filter(|t| !t.is_empty()) {
            builder = builder.with_token(Some(token));
        }
        let api = builder.build()?;
        Ok(Self { api })
    }

    /// Local directory holding `config.json`, `tokenizer.json` and the
    /// safetensors weights (single file or index plus shards) for `model`.
    pub async fn resolve_model(&self, model: &str) -> HubResult<PathBuf> {
        if let Some(dir) = local_model_dir(Path::new(model))? {
            info!(path = %dir.display(), "Using local base model");
            return Ok(dir);
        }

        info!(repo_id = model, "Fetching base model from the Hub");
        let repo = self.api.model(model.to_string());

        let mut model_dir = None;
        for file in REQUIRED_MODEL_FILES {
            let path = fetch(&repo, model, file).await?;
            model_dir.get_or_insert_with(|| path.parent().map(Path::to_path_buf).unwrap_or_default());
        }

        match repo.get(SAFETENSORS_INDEX).await {
            Ok(index_path) => {
                let shards = shard_files(&std::fs::read_to_string(&index_path)?)?;
                info!(shards = shards.len(), "Sharded safetensors weights");
                for shard in &shards {
                    fetch(&repo, model, shard).await?;
                }
            }
            Err(e) => {
                debug!(error = %e, "No safetensors index, fetching single weight file");
                fetch(&repo, model, SAFETENSORS_SINGLE).await?;
            }
        }

        model_dir.ok_or_else(|| HubError::DownloadFailed {
            file: model.to_string(),
            reason: "no files resolved".to_string(),
        })
    }

    /// Local path of a dataset: an existing file or directory as-is, else the
    /// first `.jsonl` / `.json` data file of the Hub dataset repo `dataset`.
    pub async fn resolve_dataset(&self, dataset: &str) -> HubResult<PathBuf> {
        let local = expand_tilde(Path::new(dataset));
        if local.exists() {
            debug!(path = %local.display(), "Using local dataset");
            return Ok(local);
        }

        info!(repo_id = dataset, "Fetching dataset from the Hub");
        let repo = self.api.dataset(dataset.to_string());
        let listing = repo.info().await?;
        let names: Vec<&str> = listing.siblings.iter().map(|s| s.rfilename.as_str()).collect();
        let file = pick_data_file(&names).ok_or_else(|| HubError::NoDataFile(dataset.to_string()))?;
        info!(file = %file, "Selected dataset file");
        fetch(&repo, dataset, &file).await
    }
}

async fn fetch(repo: &ApiRepo, repo_id: &str, file: &str) -> HubResult<PathBuf> {
    let path = repo.get(file).await.map_err(|e| {
        let reason = e.to_string();
        let hint = if reason.contains("401") || reason.contains("403") {
            " (hint: gated repositories need a Hugging Face token)"
        } else {
            ""
        };
        HubError::DownloadFailed { file: format!("{repo_id}/{file}"), reason: format!("{reason}{hint}") }
    })?;
    debug!(file, path = %path.display(), "Resolved");
    Ok(path)
}

// ─── Helpers ──────────────────────────────────────────────────────────────────

/// `Some(dir)` when `path` is an existing model directory, `None` when it
/// does not exist at all.  An existing directory missing required files is
/// an error rather than a Hub lookup.
fn local_model_dir(path: &Path) -> HubResult<Option<PathBuf>> {
    let path = expand_tilde(path);
    if !path.is_dir() {
        return Ok(None);
    }
    let missing: Vec<&str> = REQUIRED_MODEL_FILES
        .iter()
        .copied()
        .filter(|f| !path.join(f).is_file())
        .collect();
    if !missing.is_empty() {
        return Err(HubError::NotAModelDir {
            path: path.display().to_string(),
            missing: missing.join(", "),
        });
    }
    if !path.join(SAFETENSORS_SINGLE).is_file() && !path.join(SAFETENSORS_INDEX).is_file() {
        warn!(path = %path.display(), "No safetensors weights found in local model directory");
    }
    Ok(Some(path))
}

/// Distinct shard file names listed in a `model.safetensors.index.json`, sorted.
pub fn shard_files(index_json: &str) -> HubResult<Vec<String>> {
    let index: serde_json::Value = serde_json::from_str(index_json)?;
    let shards: BTreeSet<String> = index["weight_map"]
        .as_object()
        .map(|map| map.values().filter_map(|v| v.as_str()).map(String::from).collect())
        .unwrap_or_default();
    Ok(shards.into_iter().collect())
}

/// First data file in sorted order, preferring JSON Lines.  Repository
/// metadata such as `dataset_info.json` is skipped.
fn pick_data_file(names: &[&str]) -> Option<String> {
    let mut candidates: Vec<&str> = names
        .iter()
        .copied()
        .filter(|n| {
            let base = n.rsplit('/').next().unwrap_or(n);
            !base.starts_with('.') && !base.starts_with("dataset_info")
        })
        .collect();
    candidates.sort_unstable();
    candidates
        .iter()
        .find(|n| n.ends_with(".jsonl"))
        .or_else(|| candidates.iter().find(|n| n.ends_with(".json")))
        .map(|n| n.to_string())
}

/// Expand a leading `~` to the home directory.
pub fn expand_tilde(path: &Path) -> PathBuf {
    match path.strip_prefix("~") {
        Ok(rest) => match dirs::home_dir() {
            Some(home) => home.join(rest),
            None => path.to_path_buf(),
        },
        Err(_) => path.to_path_buf(),
    }
}

/// Default cache root: `~/.cache/lorafit`.
pub fn default_cache_dir() -> HubResult<PathBuf> {
    dirs::home_dir()
        .map(|home| home.join(".cache").join("lorafit"))
        .ok_or_else(|| HubError::InvalidCacheDir("Cannot determine home directory".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn model_dir_with(files: &[&str]) -> tempfile::TempDir {
        let dir = tempfile::TempDir::new().unwrap();
        for f in files {
            std::fs::write(dir.path().join(f), "{}").unwrap();
        }
        dir
    }

    #[test]
    fn test_shard_files_dedup_sorted() {
        let index = r#"{
            "metadata": {"total_size": 10},
            "weight_map": {
                "a": "model-00002-of-00002.safetensors",
                "b": "model-00001-of-00002.safetensors",
                "c": "model-00001-of-00002.safetensors"
            }
        }"#;
        assert_eq!(
            shard_files(index).unwrap(),
            vec!["model-00001-of-00002.safetensors", "model-00002-of-00002.safetensors"]
        );
    }

    #[test]
    fn test_shard_files_without_weight_map() {
        assert!(shard_files("{}").unwrap().is_empty());
        assert!(shard_files("not json").is_err());
    }

    #[test]
    fn test_pick_data_file_prefers_jsonl() {
        let names = ["README.md", "dataset_info.json", "data/train.json", "data/train.jsonl", ".gitattributes"];
        assert_eq!(pick_data_file(&names).as_deref(), Some("data/train.jsonl"));
        let names = ["b.json", "a.json", "dataset_infos.json"];
        assert_eq!(pick_data_file(&names).as_deref(), Some("a.json"));
        assert_eq!(pick_data_file(&["README.md", "data.parquet"]), None);
    }

    #[test]
    fn test_expand_tilde() {
        let plain = Path::new("/tmp/x");
        assert_eq!(expand_tilde(plain), plain);
        if let Some(home) = dirs::home_dir() {
            assert_eq!(expand_tilde(Path::new("~/models")), home.join("models"));
        }
    }

    #[test]
    fn test_local_model_dir_missing_is_none() {
        let dir = tempfile::TempDir::new().unwrap();
        assert!(local_model_dir(&dir.path().join("nope")).unwrap().is_none());
    }

    #[test]
    fn test_local_model_dir_requires_config_and_tokenizer() {
        let dir = model_dir_with(&["config.json"]);
        let err = local_model_dir(dir.path()).unwrap_err();
        assert!(matches!(err, HubError::NotAModelDir { ref missing, .. } if missing == "tokenizer.json"));
    }

    #[tokio::test]
    async fn test_resolve_local_model_and_dataset() {
        let cache = tempfile::TempDir::new().unwrap();
        let resolver = HubResolver::new(cache.path(), None).unwrap();

        let model = model_dir_with(&["config.json", "tokenizer.json", "model.safetensors"]);
        let resolved = resolver.resolve_model(model.path().to_str().unwrap()).await.unwrap();
        assert_eq!(resolved, model.path());

        let data = model.path().join("data.jsonl");
        std::fs::write(&data, "").unwrap();
        let resolved = resolver.resolve_dataset(data.to_str().unwrap()).await.unwrap();
        assert_eq!(resolved, data);
    }
}
