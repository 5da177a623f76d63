//! Named prompt templates for instruction tuning.
//!
//! | name            | Style                                                  |
//! |-----------------|--------------------------------------------------------|
//! | `alpaca`        | Stanford Alpaca preamble, `### Response:\n` marker     |
//! | `alpaca_legacy` | Same preamble, marker without the trailing newline     |
//! | `alpaca_short`  | Headers only, no preamble                              |
//! | `vigogne`       | French Alpaca variant, `### Réponse:\n` marker         |
//!
//! Additional templates are read from `<template_dir>/<name>.json` using the
//! alpaca-lora layout:
//!
//! ```json
//! {
//!   "description": "Template used by Alpaca-LoRA.",
//!   "prompt_input": "...{instruction}...{input}...### Response:\n",
//!   "prompt_no_input": "...{instruction}...### Response:\n",
//!   "response_split": "### Response:"
//! }
//! ```
//!
//! A file with the same name as a built-in takes precedence.

use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{CoreError, CoreResult};

const INSTRUCTION: &str = "{instruction}";
const INPUT: &str = "{input}";

/// Names of the templates compiled into the binary.
pub const BUILTIN_TEMPLATES: &[&str] = &["alpaca", "alpaca_legacy", "alpaca_short", "vigogne"];

/// A prompt template with a with-input and a no-input variant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PromptTemplate {
    #[serde(skip)]
    name: String,
    #[serde(default)]
    pub description: String,
    /// Format used when the record has a non-empty `input`.
    pub prompt_input: String,
    /// Format used when `input` is empty or absent.
    pub prompt_no_input: String,
    /// Marker separating the prompt from the expected response.
    pub response_split: String,
}

impl PromptTemplate {
    /// Resolve `name` against `template_dir` first, then the built-in table.
    ///
    /// Unknown names and malformed template files are configuration errors,
    /// so callers should resolve the template before any tokenization work.
    pub fn load(name: &str, template_dir: Option<&Path>) -> CoreResult<Self> {
        if name.is_empty() || name.contains(['/', '\\']) || name.starts_with('.') {
            return Err(CoreError::config(
                "prompt_template_name",
                format!("'{name}' is not a valid template name"),
            ));
        }

        if let Some(dir) = template_dir {
            let path = dir.join(format!("{name}.json"));
            if path.is_file() {
                let template = Self::from_file(name, &path)?;
                debug!(template = name, path = %path.display(), "Loaded prompt template from file");
                return Ok(template);
            }
        }

        Self::builtin(name).ok_or_else(|| CoreError::UnknownTemplate {
            name: name.to_string(),
            searched: template_dir
                .map(|d| d.display().to_string())
                .unwrap_or_else(|| "<no template dir>".to_string()),
        })
    }

    /// Build and validate a template from its parts.
    pub fn new(
        name: impl Into<String>,
        prompt_input: impl Into<String>,
        prompt_no_input: impl Into<String>,
        response_split: impl Into<String>,
    ) -> CoreResult<Self> {
        let template = Self {
            name: name.into(),
            description: String::new(),
            prompt_input: prompt_input.into(),
            prompt_no_input: prompt_no_input.into(),
            response_split: response_split.into(),
        };
        template.validate()?;
        Ok(template)
    }

    /// Parse and validate a template file.
    pub fn from_file(name: &str, path: &Path) -> CoreResult<Self> {
        let json = std::fs::read_to_string(path)?;
        let mut template: Self = serde_json::from_str(&json).map_err(|e| {
            CoreError::config("prompt_template_name", format!("{}: {e}", path.display()))
        })?;
        template.name = name.to_string();
        template.validate()?;
        Ok(template)
    }

    /// Look up one of the [`BUILTIN_TEMPLATES`].
    pub fn builtin(name: &str) -> Option<Self> {
        let (description, prompt_input, prompt_no_input, response_split) = match name {
            "alpaca" => (
                "Template used by Alpaca-LoRA.",
                "Below is an instruction that describes a task, paired with an input that provides further context. Write a response that appropriately completes the request.\n\n### Instruction:\n{instruction}\n\n### Input:\n{input}\n\n### Response:\n",
                "Below is an instruction that describes a task. Write a response that appropriately completes the request.\n\n### Instruction:\n{instruction}\n\n### Response:\n",
                "### Response:",
            ),
            "alpaca_legacy" => (
                "Legacy template, used by Original Alpaca repository.",
                "Below is an instruction that describes a task, paired with an input that provides further context. Write a response that appropriately completes the request.\n\n### Instruction:\n{instruction}\n\n### Input:\n{input}\n\n### Response:",
                "Below is an instruction that describes a task. Write a response that appropriately completes the request.\n\n### Instruction:\n{instruction}\n\n### Response:",
                "### Response:",
            ),
            "alpaca_short" => (
                "A shorter template to experiment with.",
                "### Instruction:\n{instruction}\n\n### Input:\n{input}\n\n### Response:\n",
                "### Instruction:\n{instruction}\n\n### Response:\n",
                "### Response:",
            ),
            "vigogne" => (
                "French template, used by Vigogne for finetuning.",
                "Ci-dessous se trouve une instruction qui décrit une tâche, associée à une entrée qui fournit un contexte supplémentaire. Écrivez une réponse qui complète correctement la demande.\n\n### Instruction:\n{instruction}\n\n### Entrée:\n{input}\n\n### Réponse:\n",
                "Ci-dessous se trouve une instruction qui décrit une tâche. Écrivez une réponse qui complète correctement la demande.\n\n### Instruction:\n{instruction}\n\n### Réponse:\n",
                "### Réponse:",
            ),
            _ => return None,
        };

        Some(Self {
            name: name.to_string(),
            description: description.to_string(),
            prompt_input: prompt_input.to_string(),
            prompt_no_input: prompt_no_input.to_string(),
            response_split: response_split.to_string(),
        })
    }

    /// The name this template was resolved under.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Render a prompt.
    ///
    /// An empty or absent `input` selects the no-input variant.  Without
    /// `output` the result ends at the response marker, which is the
    /// instruction-only prefix used for loss masking.
    pub fn render(&self, instruction: &str, input: Option<&str>, output: Option<&str>) -> String {
        let input = input.filter(|s| !s.is_empty());
        let mut prompt = match input {
            Some(input) => fill(&self.prompt_input, instruction, input),
            None => fill(&self.prompt_no_input, instruction, ""),
        };
        if let Some(output) = output {
            prompt.push_str(output);
        }
        prompt
    }

    /// Extract the model's answer from generated text: everything after the
    /// first response marker, trimmed.  `None` when the marker is missing.
    pub fn response_of<'a>(&self, generated: &'a str) -> Option<&'a str> {
        generated
            .split_once(self.response_split.as_str())
            .map(|(_, response)| response.trim())
    }

    fn validate(&self) -> CoreResult<()> {
        let field = "prompt_template_name";
        if !self.prompt_input.contains(INSTRUCTION) || !self.prompt_input.contains(INPUT) {
            return Err(CoreError::config(
                field,
                format!("template '{}': prompt_input must contain {INSTRUCTION} and {INPUT}", self.name),
            ));
        }
        if !self.prompt_no_input.contains(INSTRUCTION) {
            return Err(CoreError::config(
                field,
                format!("template '{}': prompt_no_input must contain {INSTRUCTION}", self.name),
            ));
        }
        if self.response_split.is_empty()
            || !self.prompt_input.contains(&self.response_split)
            || !self.prompt_no_input.contains(&self.response_split)
        {
            return Err(CoreError::config(
                field,
                format!(
                    "template '{}': response_split must be non-empty and appear in both formats",
                    self.name
                ),
            ));
        }
        Ok(())
    }
}

/// Names of every template available: built-ins plus `*.json` in `template_dir`.
pub fn available_templates(template_dir: Option<&Path>) -> Vec<String> {
    let mut names: Vec<String> = BUILTIN_TEMPLATES.iter().map(|s| s.to_string()).collect();
    if let Some(entries) = template_dir.and_then(|d| std::fs::read_dir(d).ok()) {
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) == Some("json") {
                if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                    names.push(stem.to_string());
                }
            }
        }
    }
    names.sort();
    names.dedup();
    names
}

/// Single-pass placeholder substitution: text inserted for one placeholder is
/// never scanned for another.  `{{` and `}}` are literal braces; any other
/// brace is copied through unchanged.
fn fill(format: &str, instruction: &str, input: &str) -> String {
    let mut out = String::with_capacity(format.len() + instruction.len() + input.len());
    let mut rest = format;
    while let Some(start) = rest.find(['{', '}']) {
        out.push_str(&rest[..start]);
        let tail = &rest[start..];
        if let Some(after) = tail.strip_prefix("{{").or_else(|| tail.strip_prefix("}}")) {
            out.push_str(&tail[..1]);
            rest = after;
        } else if let Some(after) = tail.strip_prefix(INSTRUCTION) {
            out.push_str(instruction);
            rest = after;
        } else if let Some(after) = tail.strip_prefix(INPUT) {
            out.push_str(input);
            rest = after;
        } else {
            out.push_str(&tail[..1]);
            rest = &tail[1..];
        }
    }
    out.push_str(rest);
    out
}

// ── Tests ─────────────────────────────────────────────────────────────────────
