use thiserror::Error;

#[derive(Debug, Error)]
pub enum HubError {
    #[error("Hugging Face API error: {0}")]
    Api(#[from] hf_hub::api::tokio::ApiError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid cache directory: {0}")]
    InvalidCacheDir(String),

    #[error("'{path}' is not a model directory: missing {missing}")]
    NotAModelDir { path: String, missing: String },

    #[error("No .json or .jsonl data file in dataset repository '{0}'")]
    NoDataFile(String),

    #[error("Download failed for '{file}': {reason}")]
    DownloadFailed { file: String, reason: String },
}

pub type HubResult<T> = Result<T, HubError>;
