//! # lorafit-core
//!
//! Everything between a raw instruction record and a tokenized, label-masked
//! training example, plus device placement.
//!
//! | Module | Contents |
//! |--------|----------|
//! | [`template`] | Named prompt templates (built-in and JSON files) |
//! | [`tokenizer`] | `tokenizers` wrapper with special-token and padding settings |
//! | [`pipeline`] | Render → tokenize → mask, length filtering |
//! | [`device`] | Device selection and multi-process placement |
//!
//! ## Feature Flags
//!
//! | Flag | Effect |
//! |---|---|
//! | `cuda` | Enable CUDA GPU acceleration |
//! | `metal` | Enable Apple Metal GPU acceleration |

pub mod device;
pub mod error;
pub mod pipeline;
pub mod template;
pub mod tokenizer;

pub use device::{select_device, training_dtype, DistributedContext};
pub use error::{CoreError, CoreResult};
pub use pipeline::{filter_by_length, PromptPipeline, Record, TokenizedExample, IGNORE_INDEX};
pub use template::{available_templates, PromptTemplate, BUILTIN_TEMPLATES};
pub use tokenizer::{PaddingSide, Tokenizer};
