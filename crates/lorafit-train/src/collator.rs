//! Batch collation and micro-batch ordering.

use anyhow::{ensure, Result};
use candle_core::{Device, Tensor};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

use lorafit_core::{PaddingSide, TokenizedExample, IGNORE_INDEX};

/// Sequences are padded to a multiple of this length.
pub const PAD_TO_MULTIPLE_OF: usize = 8;

/// How many micro-batches form one length-sorted group in `group_by_length`.
const MEGABATCH_FACTOR: usize = 50;

/// A padded micro-batch, stored row-major on the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Batch {
    pub input_ids: Vec<u32>,
    pub attention_mask: Vec<u32>,
    pub labels: Vec<i64>,
    pub batch_size: usize,
    pub seq_len: usize,
}

impl Batch {
    /// `(input_ids, attention_mask)` as `[batch, seq_len]` u32 tensors.
    pub fn to_tensors(&self, device: &Device) -> candle_core::Result<(Tensor, Tensor)> {
        let shape = (self.batch_size, self.seq_len);
        Ok((
            Tensor::from_slice(&self.input_ids, shape, device)?,
            Tensor::from_slice(&self.attention_mask, shape, device)?,
        ))
    }

    /// Non-padding tokens in the batch.
    pub fn num_tokens(&self) -> usize {
        self.attention_mask.iter().filter(|&&m| m != 0).count()
    }
}

/// Pad `examples` to a shared length, rounded up to `multiple`.
///
/// `input_ids` are padded with `pad_id`, `attention_mask` with 0 and
/// `labels` with [`IGNORE_INDEX`], on the side `side` names.
pub fn collate(examples: &[&TokenizedExample], pad_id: u32, side: PaddingSide, multiple: usize) -> Result<Batch> {
    ensure!(!examples.is_empty(), "Cannot collate an empty batch");
    let longest = examples.iter().map(|e| e.len()).max().unwrap_or(0);
    let multiple = multiple.max(1);
    let seq_len = longest.div_ceil(multiple) * multiple;

    let mut batch = Batch {
        input_ids: Vec::with_capacity(examples.len() * seq_len),
        attention_mask: Vec::with_capacity(examples.len() * seq_len),
        labels: Vec::with_capacity(examples.len() * seq_len),
        batch_size: examples.len(),
        seq_len,
    };

    for ex in examples {
        let pad = seq_len - ex.len();
        let padding = |b: &mut Batch| {
            b.input_ids.extend(std::iter::repeat(pad_id).take(pad));
            b.attention_mask.extend(std::iter::repeat(0).take(pad));
            b.labels.extend(std::iter::repeat(IGNORE_INDEX).take(pad));
        };
        if side == PaddingSide::Left {
            padding(&mut batch);
        }
        batch.input_ids.extend_from_slice(&ex.input_ids);
        batch.attention_mask.extend_from_slice(&ex.attention_mask);
        batch.labels.extend_from_slice(&ex.labels);
        if side == PaddingSide::Right {
            padding(&mut batch);
        }
    }
    Ok(batch)
}

/// Split the example indices of one epoch into micro-batches.
///
/// The order is a seeded shuffle.  With `group_by_length`, the shuffled
/// indices are cut into groups of `MEGABATCH_FACTOR` micro-batches and each
/// group is sorted by descending length, so each micro-batch holds sequences
/// of similar length and pads less.
pub fn epoch_batches(lengths: &[usize], micro_batch_size: usize, group_by_length: bool, seed: u64) -> Vec<Vec<usize>> {
    let micro = micro_batch_size.max(1);
    let mut order: Vec<usize> = (0..lengths.len()).collect();
    let mut rng = StdRng::seed_from_u64(seed);
    order.shuffle(&mut rng);

    if group_by_length {
        for group in order.chunks_mut(micro * MEGABATCH_FACTOR) {
            group.sort_by(|&a, &b| lengths[b].cmp(&lengths[a]));
        }
    }

    order.chunks(micro).map(<[usize]>::to_vec).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ex(ids: &[u32]) -> TokenizedExample {
        TokenizedExample {
            input_ids: ids.to_vec(),
            attention_mask: vec![1; ids.len()],
            labels: ids.iter().map(|&i| i as i64).collect(),
        }
    }

    #[test]
    fn pads_right_to_multiple_of_eight() {
        let a = ex(&[1, 2, 3]);
        let b = ex(&[1, 2, 3, 4, 5, 6, 7, 8, 9]);
        let batch = collate(&[&a, &b], 0, PaddingSide::Right, PAD_TO_MULTIPLE_OF).unwrap();
        assert_eq!(batch.seq_len, 16);
        assert_eq!(batch.batch_size, 2);
        assert_eq!(&batch.input_ids[..4], &[1, 2, 3, 0]);
        assert_eq!(&batch.attention_mask[..4], &[1, 1, 1, 0]);
        assert_eq!(&batch.labels[2..4], &[3, IGNORE_INDEX]);
        assert_eq!(batch.num_tokens(), 12);
    }

    #[test]
    fn exact_multiple_is_not_padded() {
        let a = ex(&[1; 8]);
        let batch = collate(&[&a], 0, PaddingSide::Right, 8).unwrap();
        assert_eq!(batch.seq_len, 8);
    }

    #[test]
    fn pads_left() {
        let a = ex(&[5, 6]);
        let batch = collate(&[&a], 9, PaddingSide::Left, 4).unwrap();
        assert_eq!(batch.input_ids, vec![9, 9, 5, 6]);
        assert_eq!(batch.attention_mask, vec![0, 0, 1, 1]);
        assert_eq!(batch.labels, vec![IGNORE_INDEX, IGNORE_INDEX, 5, 6]);
    }

    #[test]
    fn empty_batch_rejected() {
        assert!(collate(&[], 0, PaddingSide::Right, 8).is_err());
    }

    #[test]
    fn tensors_have_batch_shape() {
        let a = ex(&[1, 2]);
        let batch = collate(&[&a, &a], 0, PaddingSide::Right, 8).unwrap();
        let (ids, mask) = batch.to_tensors(&Device::Cpu).unwrap();
        assert_eq!(ids.dims(), &[2, 8]);
        assert_eq!(mask.dims(), &[2, 8]);
    }

    #[test]
    fn epoch_batches_cover_every_index_once() {
        let lengths: Vec<usize> = (0..23).map(|i| i % 7 + 1).collect();
        for group in [false, true] {
            let batches = epoch_batches(&lengths, 4, group, 42);
            assert_eq!(batches.len(), 6);
            let mut all: Vec<usize> = batches.concat();
            all.sort();
            assert_eq!(all, (0..23).collect::<Vec<_>>());
        }
    }

    #[test]
    fn epoch_batches_are_seeded() {
        let lengths = vec![1; 30];
        assert_eq!(epoch_batches(&lengths, 3, false, 7), epoch_batches(&lengths, 3, false, 7));
        assert_ne!(epoch_batches(&lengths, 3, false, 7), epoch_batches(&lengths, 3, false, 8));
    }

    #[test]
    fn group_by_length_sorts_within_megabatch() {
        let lengths: Vec<usize> = (0..40).map(|i| (i * 13) % 17).collect();
        let batches = epoch_batches(&lengths, 2, true, 42);
        let flat: Vec<usize> = batches.concat().iter().map(|&i| lengths[i]).collect();
        assert!(flat.windows(2).all(|w| w[0] >= w[1]));
    }
}
