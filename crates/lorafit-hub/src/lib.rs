//! # lorafit-hub
//!
//! Resolves base models and instruction datasets to local files, fetching
//! from the Hugging Face Hub when the identifier is not an existing path.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use lorafit_hub::{default_cache_dir, HubResolver};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let resolver = HubResolver::new(&default_cache_dir()?, None)?;
//!     let model_dir = resolver.resolve_model("huggyllama/llama-7b").await?;
//!     let data = resolver.resolve_dataset("yahma/alpaca-cleaned").await?;
//!     println!("{} {}", model_dir.display(), data.display());
//!     Ok(())
//! }
//! ```

pub mod error;
pub mod resolve;

pub use error::{HubError, HubResult};
pub use resolve::{default_cache_dir, expand_tilde, shard_files, HubResolver};
