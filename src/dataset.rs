use std::{
    fmt,
    fs::{self, File},
    io::{BufRead, BufReader},
    path::{Path, PathBuf},
};

use anyhow::{anyhow, Context, Result};
use candle_core::{Device, Tensor};
use hf_hub::{api::sync::Api, Repo, RepoType};
use parquet::file::reader::SerializedFileReader;
use parquet::record::Field;
use rand::{rngs::StdRng, seq::SliceRandom, SeedableRng};
use tokenizers::Tokenizer;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Split {
    Train,
    Valid,
    Test,
}

impl Split {
    pub const ALL: [Split; 3] = [Split::Train, Split::Valid, Split::Test];

    fn name(&self) -> &'static str {
        match self {
            Split::Train => "train",
            Split::Valid => "valid",
            Split::Test => "test",
        }
    }

    fn hub_name(&self) -> &'static str {
        match self {
            Split::Valid => "validation",
            other => other.name(),
        }
    }
}

impl fmt::Display for Split {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// `data/wiki2.<split>.txt`
pub fn corpus_path(data_dir: &Path, split: Split) -> PathBuf {
    data_dir.join(format!("wiki2.{split}.txt"))
}

/// Makes sure the raw text of `split` exists locally, fetching WikiText-2
/// from the hub parquet conversion when allowed.
pub fn ensure_corpus(data_dir: &Path, split: Split, download: bool) -> Result<PathBuf> {
    let path = corpus_path(data_dir, split);
    if path.exists() {
        return Ok(path);
    }
    if !download {
        return Err(anyhow!("corpus file {} not found", path.display()));
    }
    tracing::info!("Downloading WikiText-2 {split} split to {}", path.display());
    let lines = WikiText::fetch(split)?;
    fs::create_dir_all(data_dir)?;
    fs::write(&path, lines.concat())
        .with_context(|| format!("Failed to write {}", path.display()))?;
    Ok(path)
}

// https://huggingface.co/datasets/Salesforce/wikitext
struct WikiText;

impl WikiText {
    const DATASET_ID: &'static str = "Salesforce/wikitext";
    const CONFIG: &'static str = "wikitext-2-raw-v1";

    fn fetch(split: Split) -> Result<Vec<String>> {
        let api = Api::new().context("Failed to reach the dataset hub")?;
        let repo = api.repo(Repo::with_revision(
            Self::DATASET_ID.to_string(),
            RepoType::Dataset,
            "refs/convert/parquet".to_string(),
        ));
        let local = repo
            .get(&format!(
                "{}/{}/0000.parquet",
                Self::CONFIG,
                split.hub_name()
            ))
            .with_context(|| format!("Failed to fetch the {split} split"))?;
        let reader = SerializedFileReader::new(File::open(local)?)?;
        Self::load_parquet(reader)
    }

    fn load_parquet(parquet: SerializedFileReader<File>) -> Result<Vec<String>> {
        let mut lines = Vec::new();
        for row in parquet.into_iter() {
            for (_name, field) in row?.get_column_iter() {
                if let Field::Str(text) = field {
                    lines.push(text.clone());
                }
            }
        }
        Ok(lines)
    }
}

/// Reads non-blank lines of a corpus file, keeping only the first `first_n`
/// lines of the file when given.
pub fn read_lines(path: &Path, first_n: Option<usize>) -> Result<Vec<String>> {
    let file = File::open(path).with_context(|| format!("Cannot open {}", path.display()))?;
    let mut lines = Vec::new();
    for (i, line) in BufReader::new(file).lines().enumerate() {
        if first_n.is_some_and(|n| i >= n) {
            break;
        }
        let line = line?;
        if !line.trim().is_empty() {
            lines.push(line);
        }
    }
    Ok(lines)
}

/// Tokenizes every line without special tokens and concatenates the ids.
pub fn encode_lines(lines: Vec<String>, tokenizer: &Tokenizer) -> Result<Vec<u32>> {
    let encodings = tokenizer
        .encode_batch(lines, false)
        .map_err(|e| anyhow!("Failed to tokenize corpus: {e}"))?;
    Ok(encodings
        .iter()
        .flat_map(|encoding| encoding.get_ids().iter().copied())
        .collect())
}

pub fn read_corpus(path: &Path, tokenizer: &Tokenizer, first_n: Option<usize>) -> Result<Vec<u32>> {
    encode_lines(read_lines(path, first_n)?, tokenizer)
}

/// Next-token windows over a token stream. Item `i` is `seq_len + 1` tokens:
/// the input is the first `seq_len`, the target the last `seq_len`.
#[derive(Debug, Clone)]
pub struct LmDataset {
    ids: Vec<u32>,
    starts: Vec<usize>,
    seq_len: usize,
}

impl LmDataset {
    /// Non-overlapping windows advance by `seq_len`, overlapping ones by one token.
    pub fn new(ids: Vec<u32>, seq_len: usize, overlapping: bool) -> Self {
        let stride = if overlapping { 1 } else { seq_len.max(1) };
        let starts = if ids.len() > seq_len {
            (0..ids.len() - seq_len).step_by(stride).collect()
        } else {
            Vec::new()
        };
        Self {
            ids,
            starts,
            seq_len,
        }
    }

    pub fn len(&self) -> usize {
        self.starts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.starts.is_empty()
    }

    pub fn seq_len(&self) -> usize {
        self.seq_len
    }

    pub fn get(&self, index: usize) -> Option<(&[u32], &[u32])> {
        let start = *self.starts.get(index)?;
        let window = &self.ids[start..start + self.seq_len + 1];
        Some((&window[..self.seq_len], &window[1..]))
    }

    /// Batches of `(input_ids, targets)`, each `(batch_size, seq_len)` u32.
    /// The incomplete last batch is dropped. `shuffle` carries the seed.
    pub fn batcher(&self, batch_size: usize, shuffle: Option<u64>, device: &Device) -> LmBatcher<'_> {
        LmBatcher::new(self, batch_size, shuffle, device)
    }

    pub fn num_batches(&self, batch_size: usize) -> usize {
        if batch_size == 0 {
            0
        } else {
            self.len() / batch_size
        }
    }
}

pub struct LmBatcher<'a> {
    dataset: &'a LmDataset,
    order: Vec<usize>,
    batch_size: usize,
    current_idx: usize,
    device: Device,
}

impl<'a> LmBatcher<'a> {
    fn new(dataset: &'a LmDataset, batch_size: usize, shuffle: Option<u64>, device: &Device) -> Self {
        let mut order = (0..dataset.len()).collect::<Vec<_>>();
        if let Some(seed) = shuffle {
            order.shuffle(&mut StdRng::seed_from_u64(seed));
        }
        Self {
            dataset,
            order,
            batch_size,
            current_idx: 0,
            device: device.clone(),
        }
    }

    fn stack(&self, items: &[usize]) -> candle_core::Result<(Tensor, Tensor)> {
        let seq_len = self.dataset.seq_len();
        let mut inputs = Vec::with_capacity(items.len() * seq_len);
        let mut targets = Vec::with_capacity(items.len() * seq_len);
        for &i in items {
            if let Some((input, target)) = self.dataset.get(i) {
                inputs.extend_from_slice(input);
                targets.extend_from_slice(target);
            }
        }
        let shape = (items.len(), seq_len);
        Ok((
            Tensor::from_vec(inputs, shape, &self.device)?,
            Tensor::from_vec(targets, shape, &self.device)?,
        ))
    }
}

impl Iterator for LmBatcher<'_> {
    type Item = candle_core::Result<(Tensor, Tensor)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.batch_size == 0 {
            return None;
        }
        let end_idx = self.current_idx + self.batch_size;
        if end_idx > self.order.len() {
            return None;
        }
        let batch = self.stack(&self.order[self.current_idx..end_idx]);
        self.current_idx = end_idx;
        Some(batch)
    }
}
