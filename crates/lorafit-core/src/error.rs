use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("Candle error: {0}")]
    Candle(#[from] candle_core::Error),

    #[error("Tokenizer error: {0}")]
    Tokenizer(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Configuration error: {field}: {reason}")]
    Config { field: String, reason: String },

    #[error("Unknown prompt template '{name}' (looked in built-ins and {searched})")]
    UnknownTemplate { name: String, searched: String },

    #[error("Record {index} could not be tokenized")]
    Record {
        index: usize,
        #[source]
        source: Box<CoreError>,
    },

    #[error("Device not available: {0}")]
    DeviceUnavailable(String),
}

impl CoreError {
    pub(crate) fn config(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Config { field: field.into(), reason: reason.into() }
    }
}

pub type CoreResult<T> = Result<T, CoreError>;
