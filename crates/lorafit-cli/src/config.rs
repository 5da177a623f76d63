use std::path::PathBuf;

use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};

/// Runtime configuration loaded from TOML + env vars.
///
/// Per-run hyper-parameters are command-line options, not configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AppConfig {
    pub model: ModelCacheConfig,
    pub templates: TemplatesConfig,
    pub device: DeviceConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ModelCacheConfig {
    /// Where Hub downloads (models and datasets) are cached.
    pub cache_dir: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TemplatesConfig {
    /// Directory searched for `<name>.json` prompt templates.
    pub dir: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DeviceConfig {
    pub prefer_gpu: bool,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            model: ModelCacheConfig { cache_dir: "~/.cache/lorafit".to_string() },
            templates: TemplatesConfig { dir: "templates".to_string() },
            device: DeviceConfig { prefer_gpu: true },
        }
    }
}

impl AppConfig {
    pub fn template_dir(&self) -> PathBuf {
        PathBuf::from(&self.templates.dir)
    }
}

/// Load configuration from:
/// 1. Built-in defaults
/// 2. `config/default.toml` (if present)
/// 3. A custom config file path (if provided)
/// 4. Environment variables prefixed with `LORAFIT_`
pub fn load_config(config_file: Option<&PathBuf>) -> Result<AppConfig, ConfigError> {
    let mut builder = Config::builder()
        .set_default("model.cache_dir", "~/.cache/lorafit")?
        .set_default("templates.dir", "templates")?
        .set_default("device.prefer_gpu", true)?
        .add_source(File::with_name("config/default").required(false));

    if let Some(path) = config_file {
        builder = builder.add_source(File::from(path.as_path()).required(true));
    }

    // LORAFIT_DEVICE_PREFER_GPU is split on every '_', so only single-word
    // keys (LORAFIT_TEMPLATES_DIR) can be overridden this way.
    builder = builder.add_source(
        Environment::with_prefix("LORAFIT")
            .separator("_")
            .try_parsing(true),
    );

    builder.build()?.try_deserialize()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults() {
        let cfg = load_config(None).unwrap();
        assert_eq!(cfg.model.cache_dir, "~/.cache/lorafit");
        assert_eq!(cfg.templates.dir, "templates");
        assert!(cfg.device.prefer_gpu);
    }

    #[test]
    fn test_custom_config_file_overrides_defaults() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("custom.toml");
        std::fs::write(&file, "[templates]\ndir = \"/srv/templates\"\n\n[device]\nprefer_gpu = false\n").unwrap();

        let cfg = load_config(Some(&file)).unwrap();
        assert_eq!(cfg.templates.dir, "/srv/templates");
        assert_eq!(cfg.template_dir(), PathBuf::from("/srv/templates"));
        assert!(!cfg.device.prefer_gpu);
        assert_eq!(cfg.model.cache_dir, "~/.cache/lorafit");
    }

    #[test]
    fn test_missing_custom_file_is_an_error() {
        let missing = PathBuf::from("/definitely/not/here/lorafit.toml");
        assert!(load_config(Some(&missing)).is_err());
    }

    #[test]
    fn test_app_config_default_matches_load_config() {
        let from_load = load_config(None).unwrap();
        let default = AppConfig::default();
        assert_eq!(from_load.model.cache_dir, default.model.cache_dir);
        assert_eq!(from_load.templates.dir, default.templates.dir);
    }
}
