use std::path::Path;

use tokenizers::{PaddingDirection, Tokenizer as HfTokenizer};
use tracing::{debug, info};

use crate::error::{CoreError, CoreResult};

/// Which end of a sequence the collator pads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PaddingSide {
    Left,
    #[default]
    Right,
}

/// Token ids and attention mask for one piece of text.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Encoded {
    pub input_ids: Vec<u32>,
    pub attention_mask: Vec<u32>,
}

/// Thin wrapper around the Hugging Face `tokenizers` crate that also carries
/// the special-token and padding settings the training collator needs.
#[derive(Debug, Clone)]
pub struct Tokenizer {
    inner: HfTokenizer,
    eos_token_id: Option<u32>,
    bos_token_id: Option<u32>,
    pad_token_id: Option<u32>,
    padding_side: PaddingSide,
}

impl Tokenizer {
    /// Load a tokenizer from a `tokenizer.json` file.
    pub fn from_file(path: &Path) -> CoreResult<Self> {
        let inner = HfTokenizer::from_file(path)
            .map_err(|e| CoreError::Tokenizer(format!("{}: {e}", path.display())))?;
        let tokenizer = Self::from_hf(inner)?;
        debug!(
            path = %path.display(),
            vocab_size = tokenizer.vocab_size(),
            "Tokenizer loaded from file"
        );
        Ok(tokenizer)
    }

    /// Load `tokenizer.json` from a model directory.
    pub fn from_model_dir(dir: &Path) -> CoreResult<Self> {
        Self::from_file(&dir.join("tokenizer.json"))
    }

    /// Wrap an already-built Hugging Face tokenizer, probing its vocabulary
    /// for the usual BOS/EOS/PAD spellings.
    ///
    /// Padding and truncation configured in `tokenizer.json` are switched
    /// off: encodings are always unpadded and the prompt pipeline applies
    /// its own `cutoff_len`.  A configured pad id is still remembered.
    pub fn from_hf(mut inner: HfTokenizer) -> CoreResult<Self> {
        let eos_token_id = special_token_id(&inner, &["</s>", "<|endoftext|>", "<eos>", "<|end_of_text|>"]);
        let bos_token_id = special_token_id(&inner, &["<s>", "<|startoftext|>", "<bos>", "<|begin_of_text|>"]);
        let pad_token_id = inner
            .get_padding()
            .map(|p| p.pad_id)
            .or_else(|| special_token_id(&inner, &["<pad>", "[PAD]"]));
        let padding_side = match inner.get_padding().map(|p| &p.direction) {
            Some(PaddingDirection::Left) => PaddingSide::Left,
            _ => PaddingSide::Right,
        };
        if inner.get_padding().is_some() || inner.get_truncation().is_some() {
            debug!("Disabling padding/truncation from tokenizer.json");
        }
        inner.with_padding(None);
        inner
            .with_truncation(None)
            .map_err(|e| CoreError::Tokenizer(e.to_string()))?;
        Ok(Self { inner, eos_token_id, bos_token_id, pad_token_id, padding_side })
    }

    /// Configure the tokenizer for causal-LM fine-tuning: pad id 0 (the unk
    /// token for Llama vocabularies, deliberately different from EOS) and
    /// right-side padding.
    pub fn prepare_for_training(&mut self) {
        info!(
            bos = ?self.bos_token_id,
            eos = ?self.eos_token_id,
            pad = ?self.pad_token_id,
            "Pre-trained special token ids (Llama expects 1 2 None)"
        );
        self.pad_token_id = Some(0);
        self.padding_side = PaddingSide::Right;
    }

    /// Encode `text`, optionally adding the tokenizer's special tokens (BOS).
    pub fn encode(&self, text: &str, add_special_tokens: bool) -> CoreResult<Encoded> {
        let encoding = self
            .inner
            .encode(text, add_special_tokens)
            .map_err(|e| CoreError::Tokenizer(e.to_string()))?;
        Ok(Encoded {
            input_ids: encoding.get_ids().to_vec(),
            attention_mask: encoding.get_attention_mask().to_vec(),
        })
    }

    /// The end-of-sequence token id, if known.
    pub fn eos_token_id(&self) -> Option<u32> {
        self.eos_token_id
    }

    /// The beginning-of-sequence token id, if known.
    pub fn bos_token_id(&self) -> Option<u32> {
        self.bos_token_id
    }

    /// Padding token id used by the collator, if set.
    pub fn pad_token_id(&self) -> Option<u32> {
        self.pad_token_id
    }

    pub fn padding_side(&self) -> PaddingSide {
        self.padding_side
    }

    /// The size of the model vocabulary.
    pub fn vocab_size(&self) -> usize {
        self.inner.get_vocab_size(true)
    }

    /// Write `tokenizer.json` into `dir`.
    pub fn save(&self, dir: &Path) -> CoreResult<()> {
        std::fs::create_dir_all(dir)?;
        let path = dir.join("tokenizer.json");
        self.inner
            .save(&path, true)
            .map_err(|e| CoreError::Tokenizer(format!("{}: {e}", path.display())))?;
        debug!(path = %path.display(), "Tokenizer saved");
        Ok(())
    }
}

fn special_token_id(tokenizer: &HfTokenizer, candidates: &[&str]) -> Option<u32> {
    candidates.iter().find_map(|c| tokenizer.token_to_id(c))
}

/// Small word-level tokenizer for tests: `<unk>`=0, `<s>`=1, `</s>`=2, then
/// `words` in order.  Adds `<s>` in front of every encoding.
#[cfg(test)]
pub(crate) fn test_tokenizer(words: &[&str]) -> Tokenizer {
    Tokenizer::from_hf(test_hf_tokenizer(words)).unwrap()
}

/// Like [`test_tokenizer`] but loaded from a `tokenizer.json` that pads
/// every encoding to `pad_to` tokens with `<unk>`.
#[cfg(test)]
pub(crate) fn padded_test_tokenizer(words: &[&str], pad_to: usize) -> Tokenizer {
    use tokenizers::{PaddingParams, PaddingStrategy};

    let mut inner = test_hf_tokenizer(words);
    inner.with_padding(Some(PaddingParams {
        strategy: PaddingStrategy::Fixed(pad_to),
        pad_id: 0,
        pad_token: "<unk>".to_string(),
        ..Default::default()
    }));
    Tokenizer::from_hf(inner).unwrap()
}

#[cfg(test)]
fn test_hf_tokenizer(words: &[&str]) -> HfTokenizer {
    use std::str::FromStr;

    let mut vocab = serde_json::Map::new();
    for (i, tok) in ["<unk>", "<s>", "</s>"].iter().chain(words.iter()).enumerate() {
        vocab.entry(tok.to_string()).or_insert(serde_json::json!(i));
    }
    let special = |id: u32, content: &str| {
        serde_json::json!({
            "id": id, "content": content, "single_word": false, "lstrip": false,
            "rstrip": false, "normalized": false, "special": true
        })
    };
    let json = serde_json::json!({
        "version": "1.0",
        "truncation": null,
        "padding": null,
        "added_tokens": [special(1, "<s>"), special(2, "</s>")],
        "normalizer": null,
        "pre_tokenizer": { "type": "Whitespace" },
        "post_processor": {
            "type": "TemplateProcessing",
            "single": [
                { "SpecialToken": { "id": "<s>", "type_id": 0 } },
                { "Sequence": { "id": "A", "type_id": 0 } }
            ],
            "pair": [
                { "SpecialToken": { "id": "<s>", "type_id": 0 } },
                { "Sequence": { "id": "A", "type_id": 0 } },
                { "Sequence": { "id": "B", "type_id": 1 } }
            ],
            "special_tokens": {
                "<s>": { "id": "<s>", "ids": [1], "tokens": ["<s>"] }
            }
        },
        "decoder": null,
        "model": { "type": "WordLevel", "vocab": vocab, "unk_token": "<unk>" }
    });
    HfTokenizer::from_str(&json.to_string()).unwrap()
}
