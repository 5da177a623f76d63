//! Instruction dataset loading and splitting.
//!
//! Accepts a single `.json` file (a JSON array of records, or JSON Lines), a
//! `.jsonl` file, or a directory of such files read in alphabetical order.
//! Each record is an object with `instruction`, optional `input` and `output`:
//!
//! ```json
//! {"instruction": "Say hi", "input": "", "output": "Hi!"}
//! ```

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use tracing::{debug, info};

use lorafit_core::{DistributedContext, Record};

/// Seed for every dataset shuffle.
pub const DATA_SEED: u64 = 42;

// ── Loading ───────────────────────────────────────────────────────────────────

/// Load every record under `path` (file or directory).
pub fn load_records(path: &Path) -> Result<Vec<Record>> {
    let files = data_files(path)?;
    let mut records = Vec::new();
    for file in &files {
        let before = records.len();
        load_file(file, &mut records)?;
        debug!(path = %file.display(), count = records.len() - before, "Loaded dataset file");
    }
    info!(total = records.len(), files = files.len(), "Dataset loaded");
    Ok(records)
}

fn data_files(path: &Path) -> Result<Vec<PathBuf>> {
    if path.is_file() {
        return Ok(vec![path.to_path_buf()]);
    }
    if !path.is_dir() {
        bail!("Dataset path does not exist: {}", path.display());
    }

    let mut entries: Vec<PathBuf> = fs::read_dir(path)
        .with_context(|| format!("Cannot read dataset directory: {}", path.display()))?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.is_file() && is_data_file(p))
        .collect();
    entries.sort();

    anyhow::ensure!(!entries.is_empty(), "No .jsonl or .json files found in {}", path.display());
    Ok(entries)
}

fn is_data_file(path: &Path) -> bool {
    matches!(path.extension().and_then(|e| e.to_str()), Some("json" | "jsonl"))
}

fn load_file(path: &Path, out: &mut Vec<Record>) -> Result<()> {
    let text = fs::read_to_string(path).with_context(|| format!("Cannot open {}", path.display()))?;

    if text.trim_start().starts_with('[') {
        let records: Vec<Record> = serde_json::from_str(&text).map_err(|e| {
            anyhow::anyhow!(
                "JSON parse error at {}:{}: {e} (expected an array of {{\"instruction\",\"input\",\"output\"}} objects)",
                path.display(),
                e.line()
            )
        })?;
        out.extend(records);
        return Ok(());
    }

    for (line_no, line) in text.lines().enumerate() {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        let record: Record = serde_json::from_str(trimmed).with_context(|| {
            format!(
                "JSON parse error at {}:{}: expected {{\"instruction\",\"input\",\"output\"}}",
                path.display(),
                line_no + 1
            )
        })?;
        out.push(record);
    }
    Ok(())
}

// ── Splitting ─────────────────────────────────────────────────────────────────

/// Training and validation records after the seeded split.
#[derive(Debug, Clone, PartialEq)]
pub struct DatasetSplit {
    pub train: Vec<Record>,
    pub val: Vec<Record>,
}

/// Shuffle with `seed` and hold out `val_set_size` records for validation.
///
/// Both sides are shuffled again with the same seed afterwards.  With
/// `val_set_size == 0` everything is training data.
pub fn train_val_split(mut records: Vec<Record>, val_set_size: usize, seed: u64) -> Result<DatasetSplit> {
    if val_set_size == 0 {
        records.shuffle(&mut StdRng::seed_from_u64(seed));
        return Ok(DatasetSplit { train: records, val: Vec::new() });
    }

    if val_set_size >= records.len() {
        bail!(
            "val_set_size ({val_set_size}) must be smaller than the dataset ({} records)",
            records.len()
        );
    }

    records.shuffle(&mut StdRng::seed_from_u64(seed));
    let n_train = records.len() - val_set_size;
    let mut val = records.split_off(n_train);
    let mut train = records;

    train.shuffle(&mut StdRng::seed_from_u64(seed));
    val.shuffle(&mut StdRng::seed_from_u64(seed));
    info!(train = train.len(), val = val.len(), "Dataset split");
    Ok(DatasetSplit { train, val })
}

/// Keep the items this rank owns (`index % world_size == local_rank`).
pub fn shard<T>(items: Vec<T>, ctx: &DistributedContext) -> Vec<T> {
    if !ctx.is_distributed() {
        return items;
    }
    items
        .into_iter()
        .enumerate()
        .filter(|(i, _)| ctx.owns(*i))
        .map(|(_, item)| item)
        .collect()
}

// ── Tests ─────────────────────────────────────────────────────────────────────
