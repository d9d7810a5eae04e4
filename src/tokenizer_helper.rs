use std::path::Path;

use anyhow::{anyhow, Context, Result};
use hf_hub::api::sync::Api;
use tokenizers::models::wordlevel::{WordLevel, WordLevelTrainerBuilder};
use tokenizers::pre_tokenizers::whitespace::Whitespace;
use tokenizers::{
    AddedToken, DecoderWrapper, NormalizerWrapper, PostProcessorWrapper, PreTokenizerWrapper,
    Tokenizer, TokenizerBuilder,
};

use crate::config::TokenizerSource;

pub const UNK_TOKEN: &str = "[UNK]";
pub const PAD_TOKEN: &str = "[PAD]";

/// Resolves the tokenizer for an experiment. `training_lines` is only read
/// when a word-level vocabulary has to be built.
pub fn get_tokenizer<F>(source: &TokenizerSource, training_lines: F) -> Result<Tokenizer>
where
    F: FnOnce() -> Result<Vec<String>>,
{
    match source {
        TokenizerSource::Gpt2 => pretrained("gpt2"),
        TokenizerSource::WordLevel { path } if path.exists() => Tokenizer::from_file(path)
            .map_err(|e| anyhow!("Failed to load tokenizer {}: {e}", path.display())),
        TokenizerSource::WordLevel { path } => train_word_level(path, training_lines()?),
    }
}

/// Downloads `tokenizer.json` of a hub model (cached by hf-hub).
pub fn pretrained(model_id: &str) -> Result<Tokenizer> {
    let api = Api::new().context("Failed to reach the model hub")?;
    let file = api
        .model(model_id.to_string())
        .get("tokenizer.json")
        .with_context(|| format!("Failed to fetch tokenizer for {model_id}"))?;
    Tokenizer::from_file(&file).map_err(|e| anyhow!("Failed to load {}: {e}", file.display()))
}

/// Vocabulary size including added tokens.
pub fn vocab_size(tokenizer: &Tokenizer) -> usize {
    tokenizer.get_vocab_size(true)
}

/// Trains a whitespace word-level tokenizer on `sequences` and caches it at `path`.
pub fn train_word_level(path: &Path, sequences: Vec<String>) -> Result<Tokenizer> {
    if sequences.is_empty() {
        return Err(anyhow!("cannot train a tokenizer on an empty corpus"));
    }

    let mut trainer = WordLevelTrainerBuilder::default()
        .show_progress(false)
        .special_tokens(vec![
            AddedToken::from(UNK_TOKEN, true),
            AddedToken::from(PAD_TOKEN, true),
        ])
        .build()
        .map_err(|e| anyhow!("Failed to build trainer: {e}"))?;

    let mut tokenizer = TokenizerBuilder::<
        WordLevel,
        NormalizerWrapper,
        PreTokenizerWrapper,
        PostProcessorWrapper,
        DecoderWrapper,
    >::default()
    .with_model(
        WordLevel::builder()
            .unk_token(UNK_TOKEN.to_string())
            .build()
            .map_err(|e| anyhow!("Failed to build word-level model: {e}"))?,
    )
    .with_pre_tokenizer(Some(PreTokenizerWrapper::Whitespace(Whitespace::default())))
    .build()
    .map_err(|e| anyhow!("Failed to build tokenizer: {e}"))?;

    tokenizer
        .train(&mut trainer, sequences.into_iter())
        .map_err(|e| anyhow!("Failed to train tokenizer: {e}"))?;

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    tokenizer
        .save(path, false)
        .map_err(|e| anyhow!("Failed to save tokenizer to {}: {e}", path.display()))?;
    tracing::info!("Trained word-level tokenizer saved to {}", path.display());

    Tokenizer::from_file(path).map_err(|e| anyhow!("Failed to reload {}: {e}", path.display()))
}
