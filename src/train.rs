use std::{path::Path, time::Instant};

use anyhow::{Context, Result};
use candle_core::{Device, Tensor};
use candle_nn::{loss, Optimizer};
use tokenizers::Tokenizer;

use crate::{
    checkpoint::{load_model, save_checkpoint, save_embeddings},
    config::{EmbedInit, ExperimentConfig},
    dataset::{ensure_corpus, read_corpus, read_lines, LmDataset, Split},
    error::ExperimentError,
    experiment::ExperimentLayout,
    metrics::PerplexityLog,
    model::{init_models, parameter_count, LanguageModel},
    optimizer::{Adam, ParamsAdam},
    plot::{default_title, plot_perplexity},
    tokenizer_helper::{get_tokenizer, vocab_size},
    utils::{calculate_mse, causal_mask, device},
};

/// Tokenized WikiText splits cut into next-token windows.
pub struct Corpus {
    pub train: LmDataset,
    pub valid: LmDataset,
    pub test: LmDataset,
    pub vocab_size: usize,
}

impl Corpus {
    pub fn load(config: &ExperimentConfig) -> Result<Self> {
        let paths = Split::ALL
            .iter()
            .map(|&split| ensure_corpus(&config.data_dir, split, config.download_corpus))
            .collect::<Result<Vec<_>>>()?;
        let (train_path, valid_path, test_path) = (&paths[0], &paths[1], &paths[2]);

        let tokenizer = get_tokenizer(&config.tokenizer, || {
            read_lines(train_path, config.train_subset)
        })?;
        Self::tokenize(config, &tokenizer, train_path, valid_path, test_path)
    }

    fn tokenize(
        config: &ExperimentConfig,
        tokenizer: &Tokenizer,
        train_path: &Path,
        valid_path: &Path,
        test_path: &Path,
    ) -> Result<Self> {
        let dataset = |ids: Vec<u32>| LmDataset::new(ids, config.seqlen, false);
        let corpus = Self {
            train: dataset(read_corpus(train_path, tokenizer, config.train_subset)?),
            valid: dataset(read_corpus(valid_path, tokenizer, None)?),
            test: dataset(read_corpus(test_path, tokenizer, None)?),
            vocab_size: vocab_size(tokenizer),
        };
        tracing::info!(
            "vocab size: {}, windows: train {}, valid {}, test {}",
            corpus.vocab_size,
            corpus.train.len(),
            corpus.valid.len(),
            corpus.test.len()
        );
        Ok(corpus)
    }

    pub fn split(&self, split: Split) -> &LmDataset {
        match split {
            Split::Train => &self.train,
            Split::Valid => &self.valid,
            Split::Test => &self.test,
        }
    }
}

/// Everything a training run reads but never mutates.
pub struct TrainingContext<'a> {
    pub config: &'a ExperimentConfig,
    pub layout: &'a ExperimentLayout,
    pub corpus: &'a Corpus,
    pub device: Device,
}

fn batch_loss(
    model: &LanguageModel,
    input_ids: &Tensor,
    targets: &Tensor,
    mask: &Tensor,
    train: bool,
) -> candle_core::Result<Tensor> {
    let logits = model.forward(input_ids, mask, train)?; // (batch, seq_len, vocab)
    loss::cross_entropy(&logits.flatten_to(1)?, &targets.flatten_all()?)
}

/// `exp(mean batch cross-entropy)` over `split` without dropout or updates.
pub fn test_model(model: &LanguageModel, ctx: &TrainingContext, split: Split) -> Result<f64> {
    let dataset = ctx.corpus.split(split);
    let mask = causal_mask(dataset.seq_len(), &ctx.device)?;

    let mut total_loss = 0f64;
    let mut total_batches = 0usize;
    for batch in dataset.batcher(ctx.config.batchsize, None, &ctx.device) {
        let (input_ids, targets) = batch?;
        let loss = batch_loss(model, &input_ids, &targets, &mask, false)?.detach();
        total_loss += loss.to_scalar::<f32>()? as f64;
        total_batches += 1;
    }
    if total_batches == 0 {
        return Err(ExperimentError::EmptySplit(split).into());
    }
    Ok((total_loss / total_batches as f64).exp())
}

fn train_epoch(
    model: &LanguageModel,
    optimizer: &mut Adam,
    ctx: &TrainingContext,
    epoch: usize,
) -> Result<f64> {
    let dataset = &ctx.corpus.train;
    let mask = causal_mask(dataset.seq_len(), &ctx.device)?;
    let num_batches = dataset.num_batches(ctx.config.batchsize);
    let seed = ctx.config.seed.wrapping_add(epoch as u64);

    let mut total_loss = 0f64;
    let mut total_batches = 0usize;
    for batch in dataset.batcher(ctx.config.batchsize, Some(seed), &ctx.device) {
        let (input_ids, targets) = batch?;
        let loss = batch_loss(model, &input_ids, &targets, &mask, true)?;
        total_loss += loss.to_scalar::<f32>()? as f64;
        total_batches += 1;

        optimizer.backward_step(&loss)?;

        if total_batches % ctx.config.printevery == 0 {
            tracing::info!(
                "Epoch: {epoch} - batch {total_batches}/{num_batches} - loss {:.4}",
                total_loss / total_batches as f64
            );
        }
    }
    if total_batches == 0 {
        return Err(ExperimentError::EmptySplit(Split::Train).into());
    }
    Ok((total_loss / total_batches as f64).exp())
}

fn should_checkpoint(epoch: usize, every: usize) -> bool {
    epoch == 1 || epoch % every == 0
}

/// Trains one model for `config.epochs`, snapshotting embeddings every epoch
/// and checkpointing at epoch 0, 1 and every `checkpoint_every` epochs.
/// Finishes with the test perplexity, the plot and the perplexity CSV.
pub fn train_model(
    model: &LanguageModel,
    optimizer: &mut Adam,
    ctx: &TrainingContext,
    model_id: usize,
) -> Result<PerplexityLog> {
    let banner = format!("Training Model {model_id}");
    let stars = "*".repeat(banner.len());
    tracing::info!("{stars}");
    tracing::info!("{banner}");
    tracing::info!("{stars}");

    let layout = ctx.layout;
    save_embeddings(model, layout, model_id, 0)?;
    save_checkpoint(model, optimizer, layout, 0, model_id)?;

    let mut log = PerplexityLog::default();
    for epoch in 1..=ctx.config.epochs {
        tracing::info!("Epoch: {epoch} ... training");
        let train_perplexity = train_epoch(model, optimizer, ctx, epoch)?;
        tracing::info!("Epoch: {epoch} - Train Perplexity: {train_perplexity}");

        let valid_perplexity = test_model(model, ctx, Split::Valid)?;
        tracing::info!("Epoch: {epoch} - Valid Perplexity: {valid_perplexity}");
        log.push_epoch(train_perplexity, valid_perplexity);

        save_embeddings(model, layout, model_id, epoch)?;
        if should_checkpoint(epoch, ctx.config.checkpoint_every) {
            save_checkpoint(model, optimizer, layout, epoch, model_id)?;
        }
    }

    let test_perplexity = test_model(model, ctx, Split::Test)?;
    tracing::info!("Test Perplexity: {test_perplexity}");
    log.set_test(ctx.config.epochs, test_perplexity);

    let title = ctx
        .config
        .plot_title
        .clone()
        .unwrap_or_else(|| default_title(model_id));
    if let Err(e) = plot_perplexity(&log.train, &log.valid, &title, &layout.plot(model_id)) {
        tracing::warn!("{e:#}");
    }
    log.save(&layout.perplexities(model_id))?;
    Ok(log)
}

/// Loads the same starter weights into both models, checks their embeddings
/// agree, then gives each a fresh Xavier-normal embedding (seeds 1 and 2).
/// Returns the MSE between the re-initialized embeddings.
pub fn share_starter_weights(
    model1: &LanguageModel,
    model2: &LanguageModel,
    starter: &Path,
) -> Result<f32> {
    load_model(model1, starter)?;
    load_model(model2, starter)?;
    let mse = calculate_mse(model1.embedding_weight(), model2.embedding_weight())?;
    if mse != 0.0 {
        return Err(ExperimentError::EmbeddingMismatch { mse }.into());
    }

    model1.reinit_embedding(EmbedInit::GlorotNormal, 1)?;
    model2.reinit_embedding(EmbedInit::GlorotNormal, 2)?;
    let mse = calculate_mse(model1.embedding_weight(), model2.embedding_weight())?;
    tracing::info!("initial mse from preloaded and reinit: {mse}");
    Ok(mse)
}

/// Runs a prepared experiment: data, both models, training and evaluation.
pub fn experiment(config: &ExperimentConfig, layout: &ExperimentLayout) -> Result<()> {
    let title = format!(
        "{} Running Experiment {} {}",
        "=".repeat(10),
        config.experiment_id,
        "=".repeat(10)
    );
    let border = "=".repeat(title.len());
    tracing::info!("{border}");
    tracing::info!("{title}");
    tracing::info!("{border}");

    let start_time = Instant::now();
    let device = device(config.no_cuda)?;

    let corpus = Corpus::load(config)?;
    let (model1, model2) = init_models(config, corpus.vocab_size, &device)?;

    let starter = config.starter_model();
    if let Some(path) = starter {
        share_starter_weights(&model1, &model2, path)
            .with_context(|| format!("Failed to start from {}", path.display()))?;
    }
    let lock_weights = starter.is_some();

    let trainable1 = model1.trainable_vars(lock_weights)?;
    let trainable2 = model2.trainable_vars(lock_weights)?;
    tracing::info!("total params: {}", parameter_count(&trainable1));

    let mut optimizer1 = Adam::from_named(trainable1, ParamsAdam::with_lr(config.lr))?;
    let mut optimizer2 = Adam::from_named(trainable2, ParamsAdam::with_lr(config.lr))?;

    let ctx = TrainingContext {
        config,
        layout,
        corpus: &corpus,
        device,
    };
    train_model(&model1, &mut optimizer1, &ctx, 1)?;
    if config.experiment_id != 0 {
        train_model(&model2, &mut optimizer2, &ctx, 2)?;
    }

    tracing::info!("Time taken: {:.2?}", start_time.elapsed());
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::fs;

    use candle_core::Tensor;
    use tempfile::tempdir;

    use super::*;
    use crate::{
        config::TokenizerSource, dataset::corpus_path, experiment::Preparation,
        model::tests::tiny_config, model::EMBEDDING_VAR,
    };

    const TEXT: &str = "the quick brown fox jumps over the lazy dog\n";

    fn tiny_experiment(root: &Path, experiment_id: usize) -> ExperimentConfig {
        let data_dir = root.join("data");
        fs::create_dir_all(&data_dir).unwrap();
        for split in Split::ALL {
            fs::write(corpus_path(&data_dir, split), TEXT.repeat(12)).unwrap();
        }
        ExperimentConfig {
            experiment_id,
            no_cuda: true,
            epochs: 2,
            d_model: 16,
            n_layers: 1,
            heads: 2,
            d_ff: 32,
            dropout: 0.0,
            batchsize: 2,
            printevery: 1,
            lr: 1e-3,
            seqlen: 8,
            lock_weights: false,
            starter_model_path: None,
            experiments_root: root.join("experiments"),
            data_dir,
            download_corpus: false,
            tokenizer: TokenizerSource::WordLevel {
                path: root.join("tokenizer.json"),
            },
            ..Default::default()
        }
    }

    fn prepared_layout(config: &ExperimentConfig) -> ExperimentLayout {
        let layout = ExperimentLayout::new(&config.experiments_root, config.experiment_id);
        let prep = layout
            .prepare(true, &mut std::io::empty(), &mut std::io::sink())
            .unwrap();
        assert!(matches!(prep, Preparation::Created { .. }));
        layout
    }

    #[test]
    fn test_checkpoint_schedule() {
        let saved = (1..=40)
            .filter(|&e| should_checkpoint(e, 10))
            .collect::<Vec<_>>();
        assert_eq!(saved, vec![1, 10, 20, 30, 40]);
    }

    #[test]
    fn test_experiment_writes_artifacts_for_both_models() {
        let root = tempdir().unwrap();
        let config = tiny_experiment(root.path(), 1);
        let layout = prepared_layout(&config);

        experiment(&config, &layout).unwrap();

        for model_id in [1, 2] {
            assert!(layout.checkpoint(model_id, 0).exists());
            assert!(layout.checkpoint(model_id, 1).exists());
            assert!(!layout.checkpoint(model_id, 2).exists());
            for epoch in 0..=2 {
                assert!(layout.embeddings(model_id, epoch).exists());
            }
            let log = PerplexityLog::load(&layout.perplexities(model_id)).unwrap();
            assert_eq!(log.epochs(), 2);
            assert_eq!(log.test.map(|(epoch, _)| epoch), Some(2));
            assert!(log.train.iter().chain(&log.valid).all(|p| p.is_finite() && *p >= 1.0));
        }
    }

    #[test]
    fn test_baseline_experiment_trains_one_model() {
        let root = tempdir().unwrap();
        let config = tiny_experiment(root.path(), 0);
        let layout = prepared_layout(&config);

        experiment(&config, &layout).unwrap();

        assert!(layout.perplexities(1).exists());
        assert!(!layout.perplexities(2).exists());
    }

    #[test]
    fn test_uniform_logits_give_vocab_perplexity() {
        let root = tempdir().unwrap();
        let config = tiny_experiment(root.path(), 0);
        let layout = ExperimentLayout::new(&config.experiments_root, 0);
        let corpus = Corpus::load(&config).unwrap();
        let device = Device::Cpu;

        let model =
            LanguageModel::new(tiny_config(corpus.vocab_size), EmbedInit::GlorotUniform, 0, &device)
                .unwrap();
        for (name, var) in model.named_vars().unwrap() {
            if name.starts_with("projection") {
                var.set(&var.zeros_like().unwrap()).unwrap();
            }
        }

        let ctx = TrainingContext {
            config: &config,
            layout: &layout,
            corpus: &corpus,
            device,
        };
        let perplexity = test_model(&model, &ctx, Split::Test).unwrap();
        assert!((perplexity - corpus.vocab_size as f64).abs() < 1e-2);
    }

    #[test]
    fn test_empty_split_is_an_error() {
        let root = tempdir().unwrap();
        let mut config = tiny_experiment(root.path(), 0);
        config.batchsize = 1000;
        let layout = ExperimentLayout::new(&config.experiments_root, 0);
        let corpus = Corpus::load(&config).unwrap();
        let device = Device::Cpu;
        let model =
            LanguageModel::new(tiny_config(corpus.vocab_size), EmbedInit::Normal, 0, &device)
                .unwrap();
        let ctx = TrainingContext {
            config: &config,
            layout: &layout,
            corpus: &corpus,
            device,
        };
        let err = test_model(&model, &ctx, Split::Valid).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ExperimentError>(),
            Some(ExperimentError::EmptySplit(Split::Valid))
        ));
    }

    #[test]
    fn test_locked_weights_only_move_the_embedding() {
        let device = Device::Cpu;
        let model = LanguageModel::new(tiny_config(12), EmbedInit::GlorotUniform, 0, &device).unwrap();
        let before = model
            .named_vars()
            .unwrap()
            .into_iter()
            .map(|(name, var)| (name, var.as_tensor().copy().unwrap()))
            .collect::<Vec<_>>();

        let mut optimizer =
            Adam::from_named(model.trainable_vars(true).unwrap(), ParamsAdam::with_lr(1e-2)).unwrap();
        let ids = Tensor::new(&[[1u32, 2, 3, 4]], &device).unwrap();
        let targets = Tensor::new(&[[2u32, 3, 4, 5]], &device).unwrap();
        let mask = causal_mask(4, &device).unwrap();
        let loss = batch_loss(&model, &ids, &targets, &mask, true).unwrap();
        optimizer.backward_step(&loss).unwrap();

        for (name, old) in before {
            let new = model.var(&name).unwrap();
            let mse = calculate_mse(&old, new.as_tensor()).unwrap();
            if name == EMBEDDING_VAR {
                assert!(mse > 0.0);
            } else {
                assert_eq!(mse, 0.0, "{name} changed");
            }
        }
    }

    #[test]
    fn test_share_starter_weights() {
        let root = tempdir().unwrap();
        let layout = ExperimentLayout::new(root.path(), 1);
        fs::create_dir_all(layout.model_dir(1)).unwrap();
        let device = Device::Cpu;

        let starter = LanguageModel::new(tiny_config(12), EmbedInit::Normal, 42, &device).unwrap();
        let optimizer =
            Adam::from_named(starter.trainable_vars(false).unwrap(), ParamsAdam::with_lr(1e-3))
                .unwrap();
        save_checkpoint(&starter, &optimizer, &layout, 40, 1).unwrap();

        let model1 = LanguageModel::new(tiny_config(12), EmbedInit::GlorotUniform, 1, &device).unwrap();
        let model2 = LanguageModel::new(tiny_config(12), EmbedInit::GlorotUniform, 2, &device).unwrap();
        let mse = share_starter_weights(&model1, &model2, &layout.checkpoint(1, 40)).unwrap();
        assert!(mse > 0.0);

        // everything but the embedding now comes from the starter
        let projection = "projection.weight";
        assert_eq!(
            calculate_mse(
                &model1.var(projection).unwrap(),
                &starter.var(projection).unwrap()
            )
            .unwrap(),
            0.0
        );
        // and the fresh embeddings are the seeded xavier-normal tables
        let expected = Tensor::from_vec(
            crate::init::sample(EmbedInit::GlorotNormal, 12, 16, 1),
            (12, 16),
            &device,
        )
        .unwrap();
        assert_eq!(calculate_mse(model1.embedding_weight(), &expected).unwrap(), 0.0);
    }
}
