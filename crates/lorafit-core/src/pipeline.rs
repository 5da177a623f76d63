//! Prompt construction and label masking.
//!
//! A [`PromptPipeline`] turns instruction records into
//! `(input_ids, attention_mask, labels)` triples:
//!
//! 1. render `instruction` / `input` / `output` through a [`PromptTemplate`];
//! 2. tokenize, truncating to `cutoff_len` and appending EOS when there is room;
//! 3. unless training on inputs, replace the labels of the instruction prefix
//!    with [`IGNORE_INDEX`] so only the response contributes to the loss.
//!
//! The pipeline holds no mutable state and is shared across `rayon` workers
//! by [`PromptPipeline::map_records`].

use std::sync::Arc;

use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{CoreError, CoreResult};
use crate::template::PromptTemplate;
use crate::tokenizer::Tokenizer;

/// Label value the loss skips.
pub const IGNORE_INDEX: i64 = -100;

/// One instruction-tuning record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    pub instruction: String,
    #[serde(default)]
    pub input: Option<String>,
    pub output: String,
}

impl Record {
    pub fn new(instruction: impl Into<String>, input: Option<&str>, output: impl Into<String>) -> Self {
        Self {
            instruction: instruction.into(),
            input: input.map(str::to_owned),
            output: output.into(),
        }
    }
}

/// A tokenized training example.  All three sequences have the same length.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenizedExample {
    pub input_ids: Vec<u32>,
    pub attention_mask: Vec<u32>,
    pub labels: Vec<i64>,
}

impl TokenizedExample {
    pub fn len(&self) -> usize {
        self.input_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.input_ids.is_empty()
    }

    /// Number of positions that contribute to the loss.
    pub fn trainable_labels(&self) -> usize {
        self.labels.iter().filter(|&&l| l != IGNORE_INDEX).count()
    }
}

/// Renders, tokenizes and masks records with one fixed configuration.
#[derive(Debug, Clone)]
pub struct PromptPipeline {
    tokenizer: Arc<Tokenizer>,
    template: Arc<PromptTemplate>,
    cutoff_len: usize,
    train_on_inputs: bool,
    add_eos_token: bool,
    eos_token_id: u32,
}

impl PromptPipeline {
    /// Build a pipeline.
    ///
    /// `train_on_inputs = false` masks the instruction prefix out of the
    /// labels.  `add_eos_token` controls whether that prefix is tokenized
    /// with a trailing EOS; the full prompt always gets one when it fits.
    pub fn new(
        tokenizer: Arc<Tokenizer>,
        template: Arc<PromptTemplate>,
        cutoff_len: usize,
        train_on_inputs: bool,
        add_eos_token: bool,
    ) -> CoreResult<Self> {
        if cutoff_len == 0 {
            return Err(CoreError::config("cutoff_len", "must be at least 1"));
        }
        let eos_token_id = tokenizer
            .eos_token_id()
            .ok_or_else(|| CoreError::config("tokenizer", "no end-of-sequence token"))?;
        Ok(Self { tokenizer, template, cutoff_len, train_on_inputs, add_eos_token, eos_token_id })
    }

    /// Render a prompt; see [`PromptTemplate::render`].
    pub fn render(&self, instruction: &str, input: Option<&str>, output: Option<&str>) -> String {
        self.template.render(instruction, input, output)
    }

    /// Tokenize `text` truncated to `cutoff_len`, with `labels` equal to the ids.
    ///
    /// With `add_eos`, the EOS id is appended when the last token is not
    /// already EOS and the sequence is strictly shorter than `cutoff_len`.
    pub fn tokenize(&self, text: &str, add_eos: bool) -> CoreResult<TokenizedExample> {
        self.tokenize_inner(text, add_eos).map(|(example, _)| example)
    }

    /// Render and tokenize a record, masking the instruction prefix unless
    /// training on inputs.
    pub fn build_example(&self, record: &Record) -> CoreResult<TokenizedExample> {
        let input = record.input.as_deref();
        let full_prompt = self.render(&record.instruction, input, Some(&record.output));
        let (mut example, _) = self.tokenize_inner(&full_prompt, true)?;

        if !self.train_on_inputs {
            let user_prompt = self.render(&record.instruction, input, None);
            let (prefix, eos_appended) = self.tokenize_inner(&user_prompt, self.add_eos_token)?;
            // An EOS appended to the prefix sits where the response starts.
            let prefix_len = prefix.len() - usize::from(eos_appended);
            mask_prefix(&mut example.labels, prefix_len);
        }

        Ok(example)
    }

    /// [`build_example`](Self::build_example) over every record in parallel,
    /// preserving order.  The first failing record aborts the whole map.
    pub fn map_records(&self, records: &[Record]) -> CoreResult<Vec<TokenizedExample>> {
        let examples = records
            .par_iter()
            .enumerate()
            .map(|(index, record)| {
                self.build_example(record)
                    .map_err(|e| CoreError::Record { index, source: Box::new(e) })
            })
            .collect::<CoreResult<Vec<_>>>()?;
        debug!(count = examples.len(), "Records tokenized");
        Ok(examples)
    }

    fn tokenize_inner(&self, text: &str, add_eos: bool) -> CoreResult<(TokenizedExample, bool)> {
        let mut encoded = self.tokenizer.encode(text, true)?;
        encoded.input_ids.truncate(self.cutoff_len);
        encoded.attention_mask.truncate(self.cutoff_len);

        let eos_appended = add_eos
            && encoded.input_ids.last() != Some(&self.eos_token_id)
            && encoded.input_ids.len() < self.cutoff_len;
        if eos_appended {
            encoded.input_ids.push(self.eos_token_id);
            encoded.attention_mask.push(1);
        }

        let labels = encoded.input_ids.iter().map(|&id| i64::from(id)).collect();
        Ok((
            TokenizedExample {
                input_ids: encoded.input_ids,
                attention_mask: encoded.attention_mask,
                labels,
            },
            eos_appended,
        ))
    }
}

/// Set the first `prefix_len` labels to [`IGNORE_INDEX`].  A prefix longer
/// than the labels masks all of them.
pub fn mask_prefix(labels: &mut [i64], prefix_len: usize) {
    let n = prefix_len.min(labels.len());
    labels[..n].fill(IGNORE_INDEX);
}

/// Keep the examples with `min_len <= len <= max_len`, in their original order.
pub fn filter_by_length<I>(examples: I, min_len: usize, max_len: usize) -> Vec<TokenizedExample>
where
    I: IntoIterator<Item = TokenizedExample>,
{
    examples
        .into_iter()
        .filter(|ex| (min_len..=max_len).contains(&ex.len()))
        .collect()
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tokenizer::test_tokenizer;

    // <unk>=0 <s>=1 </s>=2 Q=3 :=4 hi=5 A=6 yo=7 I=8
    const WORDS: &[&str] = &["Q", ":", "hi", "A", "yo", "I"];

    fn qa_template() -> Arc<PromptTemplate> {
        Arc::new(PromptTemplate::new("qa", "Q: {instruction} I: {input} A:", "Q: {instruction} A:", "A:").unwrap())
    }

    fn pipeline(cutoff_len: usize, train_on_inputs: bool, add_eos: bool) -> PromptPipeline {
        PromptPipeline::new(
            Arc::new(test_tokenizer(WORDS)),
            qa_template(),
            cutoff_len,
            train_on_inputs,
            add_eos,
        )
        .unwrap()
    }

    fn assert_invariants(ex: &TokenizedExample, cutoff_len: usize) {
        assert_eq!(ex.input_ids.len(), ex.attention_mask.len());
        assert_eq!(ex.input_ids.len(), ex.labels.len());
        assert!(ex.len() <= cutoff_len);
        for (&id, &label) in ex.input_ids.iter().zip(&ex.labels) {
            assert!(label == IGNORE_INDEX || label == i64::from(id));
        }
    }

    #[test]
    fn tokenize_appends_eos_when_room() {
        let p = pipeline(16, true, true);
        let ex = p.tokenize("Q hi", true).unwrap();
        assert_eq!(ex.input_ids, vec![1, 3, 5, 2]);
        assert_eq!(ex.attention_mask, vec![1, 1, 1, 1]);
        assert_eq!(ex.labels, vec![1, 3, 5, 2]);
    }

    #[test]
    fn tokenize_without_eos_flag() {
        let p = pipeline(16, true, false);
        assert_eq!(p.tokenize("Q hi", false).unwrap().input_ids, vec![1, 3, 5]);
    }

    #[test]
    fn tokenize_does_not_double_eos() {
        let p = pipeline(16, true, true);
        assert_eq!(p.tokenize("Q hi </s>", true).unwrap().input_ids, vec![1, 3, 5, 2]);
    }

    #[test]
    fn exact_cutoff_gets_no_eos() {
        let p = pipeline(5, true, true);
        let ex = p.tokenize("Q hi A yo", true).unwrap();
        assert_eq!(ex.input_ids, vec![1, 3, 5, 6, 7]);
    }

    #[test]
    fn truncates_to_cutoff() {
        let p = pipeline(3, true, true);
        let ex = p.tokenize("Q hi A yo", true).unwrap();
        assert_eq!(ex.input_ids, vec![1, 3, 5]);
        assert_invariants(&ex, 3);
    }

    #[test]
    fn full_prompt_of_exactly_cutoff_tokens_has_no_eos() {
        // "hi A:yo" -> <s> hi A : yo = 5 tokens
        let template =
            Arc::new(PromptTemplate::new("t", "{instruction} I: {input} A:", "{instruction} A:", "A:").unwrap());
        let p = PromptPipeline::new(Arc::new(test_tokenizer(WORDS)), template, 5, false, true).unwrap();
        let ex = p.build_example(&Record::new("hi", None, "yo")).unwrap();
        assert_eq!(ex.input_ids, vec![1, 5, 6, 4, 7]);
        // prefix "<s> hi A :" + appended EOS -> 5, minus the EOS -> 4
        assert_eq!(ex.labels, vec![-100, -100, -100, -100, 7]);
    }

    #[test]
    fn masks_instruction_prefix() {
        let p = pipeline(32, false, false);
        let ex = p.build_example(&Record::new("hi", None, "yo")).unwrap();
        // <s> Q : hi A : yo </s>
        assert_eq!(ex.input_ids, vec![1, 3, 4, 5, 6, 4, 7, 2]);
        assert_eq!(ex.labels, vec![-100, -100, -100, -100, -100, -100, 7, 2]);
        assert_invariants(&ex, 32);
    }

    #[test]
    fn padding_from_tokenizer_json_does_not_leak_into_examples() {
        let mut tokenizer = crate::tokenizer::padded_test_tokenizer(WORDS, 16);
        tokenizer.prepare_for_training();
        let p = PromptPipeline::new(Arc::new(tokenizer), qa_template(), 32, false, false).unwrap();
        let ex = p.build_example(&Record::new("hi", None, "yo")).unwrap();
        assert_eq!(ex.input_ids, vec![1, 3, 4, 5, 6, 4, 7, 2]);
        assert_eq!(ex.attention_mask, vec![1; 8]);
        assert_eq!(ex.labels, vec![-100, -100, -100, -100, -100, -100, 7, 2]);
    }

    #[test]
    fn prefix_eos_does_not_shift_mask() {
        let without = pipeline(32, false, false).build_example(&Record::new("hi", None, "yo")).unwrap();
        let with = pipeline(32, false, true).build_example(&Record::new("hi", None, "yo")).unwrap();
        assert_eq!(without, with);
    }

    #[test]
    fn train_on_inputs_keeps_all_labels() {
        let p = pipeline(32, true, false);
        let ex = p.build_example(&Record::new("hi", Some("yo"), "yo")).unwrap();
        let ids: Vec<i64> = ex.input_ids.iter().map(|&i| i64::from(i)).collect();
        assert_eq!(ex.labels, ids);
    }

    #[test]
    fn truncated_prefix_masks_everything() {
        let p = pipeline(4, false, true);
        let ex = p.build_example(&Record::new("hi", None, "yo")).unwrap();
        assert_eq!(ex.input_ids, vec![1, 3, 4, 5]);
        assert!(ex.labels.iter().all(|&l| l == IGNORE_INDEX));
    }

    #[test]
    fn mask_prefix_longer_than_labels() {
        let mut labels = vec![5, 6, 7];
        mask_prefix(&mut labels, 10);
        assert_eq!(labels, vec![IGNORE_INDEX; 3]);
    }

    #[test]
    fn masked_boundary_matches_prefix_length() {
        let p = pipeline(64, false, false);
        for (instruction, input, output) in [
            ("hi", None, "yo"),
            ("hi hi", Some("Q"), "yo yo yo"),
            ("A", Some(""), "hi"),
            ("unknown words here", Some("also unknown"), "yo"),
        ] {
            let record = Record::new(instruction, input, output);
            let ex = p.build_example(&record).unwrap();
            let prefix = p.tokenize(&p.render(instruction, input, None), false).unwrap();
            let l = prefix.len();
            assert!(ex.labels[..l].iter().all(|&x| x == IGNORE_INDEX));
            for i in l..ex.len() {
                assert_eq!(ex.labels[i], i64::from(ex.input_ids[i]));
            }
            assert_invariants(&ex, 64);
        }
    }

    #[test]
    fn alpaca_end_to_end() {
        let tokenizer = Arc::new(test_tokenizer(&["Say", "hi", "Hi", "!", "###", "Response", ":"]));
        let template = Arc::new(PromptTemplate::load("alpaca", None).unwrap());
        let record = Record::new("Say hi", Some(""), "Hi!");

        let masked =
            PromptPipeline::new(tokenizer.clone(), template.clone(), 512, false, false).unwrap();
        let rendered = masked.render(&record.instruction, record.input.as_deref(), Some(&record.output));
        assert!(rendered.ends_with("### Response:\nHi!"));

        let ex = masked.build_example(&record).unwrap();
        // ... ### Response : Hi ! </s>
        let n = ex.len();
        assert_eq!(&ex.labels[n - 3..], &[i64::from(ex.input_ids[n - 3]), i64::from(ex.input_ids[n - 2]), 2]);
        assert!(ex.labels[..n - 3].iter().all(|&l| l == IGNORE_INDEX));

        let unmasked = PromptPipeline::new(tokenizer, template, 512, true, false).unwrap();
        let ex = unmasked.build_example(&record).unwrap();
        assert_eq!(ex.trainable_labels(), ex.len());
    }

    #[test]
    fn map_records_preserves_order() {
        let p = pipeline(32, false, false);
        let records: Vec<Record> = (0..20)
            .map(|i| Record::new(vec!["hi"; i % 4 + 1].join(" "), None, "yo"))
            .collect();
        let mapped = p.map_records(&records).unwrap();
        assert_eq!(mapped.len(), records.len());
        for (record, ex) in records.iter().zip(&mapped) {
            assert_eq!(ex, &p.build_example(record).unwrap());
        }
    }

    #[test]
    fn record_error_keeps_its_source() {
        use std::error::Error;

        let err = CoreError::Record {
            index: 3,
            source: Box::new(CoreError::Tokenizer("bad byte".into())),
        };
        assert_eq!(err.to_string(), "Record 3 could not be tokenized");
        assert_eq!(err.source().unwrap().to_string(), "Tokenizer error: bad byte");
    }

    #[test]
    fn filter_by_length_is_stable_subsequence() {
        let p = pipeline(64, true, false);
        let examples: Vec<TokenizedExample> = [3, 1, 5, 2, 4]
            .iter()
            .map(|&n| p.tokenize(&vec!["hi"; n].join(" "), false).unwrap())
            .collect();
        // lengths include BOS: 4 2 6 3 5
        let kept = filter_by_length(examples, 3, 5);
        let lens: Vec<usize> = kept.iter().map(TokenizedExample::len).collect();
        assert_eq!(lens, vec![4, 3, 5]);
    }

    #[test]
    fn filter_by_length_inclusive_bounds() {
        let p = pipeline(64, true, false);
        let ex = p.tokenize("hi", false).unwrap();
        assert_eq!(filter_by_length(vec![ex.clone()], 2, 2).len(), 1);
        assert!(filter_by_length(vec![ex], 3, 10).is_empty());
    }

    #[test]
    fn zero_cutoff_rejected() {
        let err = PromptPipeline::new(Arc::new(test_tokenizer(WORDS)), qa_template(), 0, false, false)
            .unwrap_err();
        assert!(matches!(err, CoreError::Config { .. }));
    }

    #[test]
    fn record_deserializes_without_input() {
        let r: Record = serde_json::from_str(r#"{"instruction":"a","output":"b"}"#).unwrap();
        assert_eq!(r.input, None);
        let r: Record = serde_json::from_str(r#"{"instruction":"a","input":null,"output":"b"}"#).unwrap();
        assert_eq!(r.input, None);
        assert!(serde_json::from_str::<Record>(r#"{"input":"a","output":"b"}"#).is_err());
    }
}
