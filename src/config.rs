use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::error::ExperimentError;

/// How a model's token embedding is initialized before training.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EmbedInit {
    GlorotUniform,
    GlorotNormal,
    /// N(0, 1), the usual default for embedding tables.
    Normal,
    /// U(-0.1, 0.1)
    Uniform,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenizerSource {
    /// Pretrained GPT-2 byte-level BPE fetched from the hub.
    Gpt2,
    /// Word-level vocabulary trained on the training split, cached at `path`.
    WordLevel { path: PathBuf },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExperimentConfig {
    pub experiment_id: usize,
    pub seed: u64,
    pub no_cuda: bool,
    pub epochs: usize,
    pub model1_embed_init: EmbedInit,
    pub model2_embed_init: EmbedInit,
    pub d_model: usize,
    pub n_layers: usize,
    pub heads: usize,
    pub d_ff: usize,
    pub dropout: f32,
    pub batchsize: usize,
    pub printevery: usize,
    pub lr: f64,
    pub seqlen: usize,
    pub train_subset: Option<usize>,
    pub plot_title: Option<String>,
    pub lock_weights: bool,
    pub starter_model_path: Option<PathBuf>,
    pub checkpoint_every: usize,
    pub experiments_root: PathBuf,
    pub data_dir: PathBuf,
    pub download_corpus: bool,
    pub tokenizer: TokenizerSource,
}

impl Default for ExperimentConfig {
    fn default() -> Self {
        Self {
            experiment_id: 2,
            seed: 0,
            no_cuda: false,
            epochs: 2,
            model1_embed_init: EmbedInit::GlorotUniform,
            model2_embed_init: EmbedInit::GlorotUniform,
            d_model: 128,
            n_layers: 6,
            heads: 8,
            d_ff: 2048,
            dropout: 0.1,
            batchsize: 3,
            printevery: 1,
            lr: 0.00001,
            seqlen: 512,
            train_subset: None,
            plot_title: None,
            lock_weights: true,
            starter_model_path: Some(PathBuf::from(
                "experiments/1/models/1/checkpoint_40.safetensors",
            )),
            checkpoint_every: 10,
            experiments_root: PathBuf::from("experiments"),
            data_dir: PathBuf::from("data"),
            download_corpus: true,
            tokenizer: TokenizerSource::Gpt2,
        }
    }
}

impl ExperimentConfig {
    /// Settings of the three reference experiments: 0 is the single-model
    /// baseline, 1 trains both models from scratch, 2 (and any other id)
    /// starts both from experiment 1's epoch-40 checkpoint.
    pub fn preset(experiment_id: usize) -> Self {
        let from_scratch = Self {
            experiment_id,
            epochs: 40,
            printevery: 100,
            lock_weights: false,
            starter_model_path: None,
            ..Default::default()
        };
        match experiment_id {
            0 => Self {
                d_model: 512,
                plot_title: Some("Baseline Model Perplexity".to_string()),
                ..from_scratch
            },
            1 => from_scratch,
            _ => Self {
                experiment_id,
                ..Default::default()
            },
        }
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;
        let config: ExperimentConfig = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {:?}", path))?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ExperimentError> {
        let invalid = |msg: String| Err(ExperimentError::InvalidConfig(msg));
        if self.epochs == 0 {
            return invalid("epochs must be at least 1".into());
        }
        if self.batchsize == 0 || self.seqlen == 0 {
            return invalid("batchsize and seqlen must be positive".into());
        }
        if self.heads == 0 || self.d_model % self.heads != 0 {
            return invalid(format!(
                "d_model ({}) must be divisible by heads ({})",
                self.d_model, self.heads
            ));
        }
        if self.d_model % 2 != 0 {
            return invalid(format!("d_model ({}) must be even", self.d_model));
        }
        if !(0.0..1.0).contains(&self.dropout) {
            return invalid(format!("dropout {} outside [0, 1)", self.dropout));
        }
        if self.lr <= 0.0 {
            return invalid(format!("learning rate {} must be positive", self.lr));
        }
        if self.checkpoint_every == 0 || self.printevery == 0 {
            return invalid("checkpoint_every and printevery must be positive".into());
        }
        Ok(())
    }

    /// The starter checkpoint must exist and must not live inside the
    /// experiment directory, which is cleared before it would be read.
    pub fn check_starter(&self, experiment_dir: &Path) -> Result<(), ExperimentError> {
        let Some(starter) = self.starter_model() else {
            return Ok(());
        };
        let resolved = starter.canonicalize().map_err(|e| {
            ExperimentError::InvalidConfig(format!(
                "starter model {}: {e}",
                starter.display()
            ))
        })?;
        if let Ok(dir) = experiment_dir.canonicalize() {
            if resolved.starts_with(&dir) {
                return Err(ExperimentError::InvalidConfig(format!(
                    "starter model {} lies inside {}, which is cleared before training",
                    starter.display(),
                    experiment_dir.display()
                )));
            }
        }
        Ok(())
    }

    pub fn embed_init(&self, model_id: usize) -> EmbedInit {
        if model_id == 1 {
            self.model1_embed_init
        } else {
            self.model2_embed_init
        }
    }

    /// Starter weights are only used when the embedding is locked to them.
    pub fn starter_model(&self) -> Option<&Path> {
        match (self.lock_weights, &self.starter_model_path) {
            (true, Some(path)) => Some(path.as_path()),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use tempfile::{tempdir, NamedTempFile};

    use super::*;

    #[test]
    fn test_default_matches_experiment_two() {
        let config = ExperimentConfig::default();
        assert_eq!(config.experiment_id, 2);
        assert_eq!(config.d_model, 128);
        assert_eq!(config.printevery, 1);
        assert_eq!(config.model1_embed_init, EmbedInit::GlorotUniform);
        assert!(config.starter_model().is_some());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_file_falls_back_to_defaults() {
        let mut file = NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{
                "experiment_id": 0,
                "d_model": 512,
                "model2_embed_init": "glorot_normal",
                "lock_weights": false,
                "tokenizer": {{ "word_level": {{ "path": "tok.json" }} }}
            }}"#
        )
        .unwrap();

        let config = ExperimentConfig::from_file(file.path()).unwrap();
        assert_eq!(config.experiment_id, 0);
        assert_eq!(config.d_model, 512);
        assert_eq!(config.heads, 8);
        assert_eq!(config.embed_init(2), EmbedInit::GlorotNormal);
        assert_eq!(config.starter_model(), None);
        assert_eq!(
            config.tokenizer,
            TokenizerSource::WordLevel {
                path: PathBuf::from("tok.json")
            }
        );
    }

    #[test]
    fn test_validate_rejections() {
        let cases: [(&str, fn(&mut ExperimentConfig)); 12] = [
            ("zero epochs", |c| c.epochs = 0),
            ("zero batchsize", |c| c.batchsize = 0),
            ("zero seqlen", |c| c.seqlen = 0),
            ("indivisible heads", |c| c.d_model = 130),
            ("zero heads", |c| c.heads = 0),
            ("odd d_model", |c| {
                c.d_model = 9;
                c.heads = 3;
            }),
            ("negative dropout", |c| c.dropout = -0.1),
            ("dropout of one", |c| c.dropout = 1.0),
            ("zero lr", |c| c.lr = 0.0),
            ("negative lr", |c| c.lr = -1e-3),
            ("zero checkpoint_every", |c| c.checkpoint_every = 0),
            ("zero printevery", |c| c.printevery = 0),
        ];
        for (name, tweak) in cases {
            let mut config = ExperimentConfig::default();
            tweak(&mut config);
            assert!(
                matches!(config.validate(), Err(ExperimentError::InvalidConfig(_))),
                "{name} should be rejected"
            );
        }

        let edge = ExperimentConfig {
            dropout: 0.0,
            ..Default::default()
        };
        assert!(edge.validate().is_ok());
    }

    #[test]
    fn test_presets() {
        let baseline = ExperimentConfig::preset(0);
        assert_eq!(baseline.d_model, 512);
        assert_eq!(baseline.epochs, 40);
        assert_eq!(baseline.printevery, 100);
        assert_eq!(baseline.plot_title.as_deref(), Some("Baseline Model Perplexity"));
        assert_eq!(baseline.starter_model(), None);

        let scratch = ExperimentConfig::preset(1);
        assert_eq!(scratch.experiment_id, 1);
        assert_eq!(scratch.d_model, 128);
        assert_eq!(scratch.epochs, 40);
        assert_eq!(scratch.starter_model(), None);

        let locked = ExperimentConfig::preset(2);
        assert_eq!(locked.epochs, 2);
        assert_eq!(locked.printevery, 1);
        assert!(locked.starter_model().is_some());
        assert_eq!(ExperimentConfig::preset(7).experiment_id, 7);

        for id in 0..3 {
            assert!(ExperimentConfig::preset(id).validate().is_ok());
        }
    }

    #[test]
    fn test_check_starter() {
        let root = tempdir().unwrap();
        let own_dir = root.path().join("1");
        let other_dir = root.path().join("2");
        let inside = own_dir.join("models/1/checkpoint_40.safetensors");
        std::fs::create_dir_all(inside.parent().unwrap()).unwrap();
        std::fs::write(&inside, b"weights").unwrap();

        let mut config = ExperimentConfig {
            starter_model_path: Some(root.path().join("missing.safetensors")),
            ..Default::default()
        };
        assert!(matches!(
            config.check_starter(&other_dir),
            Err(ExperimentError::InvalidConfig(_))
        ));

        // rerunning experiment 1 locked to its own checkpoint would delete it
        config.starter_model_path = Some(inside.clone());
        assert!(matches!(
            config.check_starter(&own_dir),
            Err(ExperimentError::InvalidConfig(_))
        ));
        assert!(inside.exists());

        assert!(config.check_starter(&other_dir).is_ok());

        config.lock_weights = false;
        config.starter_model_path = Some(root.path().join("missing.safetensors"));
        assert!(config.check_starter(&own_dir).is_ok());
    }
}
