use candle_core::{DType, Device, Result, Tensor, Var};
use candle_nn::{Module, VarBuilder, VarMap};

use crate::{
    config::{EmbedInit, ExperimentConfig},
    decoder::{Decoder, DecoderConfig},
    init::{init_hint, reinit},
    projection_layer::ProjectionLayer,
};

/// VarMap name of the token embedding table.
pub const EMBEDDING_VAR: &str = "decoder.embed.weight";

/// Decoder-only transformer predicting the next token at every position.
///
/// Owns the `VarMap` holding its weights so checkpoints, freezing and
/// re-initialization can address variables by name.
pub struct LanguageModel {
    varmap: VarMap,
    decoder: Decoder,
    projection: ProjectionLayer,
}

impl LanguageModel {
    pub fn new(
        config: DecoderConfig,
        embed_init: EmbedInit,
        seed: u64,
        device: &Device,
    ) -> Result<Self> {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);
        let hint = init_hint(embed_init, config.vocab_size, config.d_model);
        let decoder = Decoder::new(&config, hint, vb.pp("decoder"))?;
        let projection = ProjectionLayer::new(config.d_model, config.vocab_size, vb.pp("projection"))?;

        let model = Self {
            varmap,
            decoder,
            projection,
        };
        reinit(&model.embedding_var()?, embed_init, seed)?;
        Ok(model)
    }

    /// (batch, seq_len) ids -> (batch, seq_len, vocab_size) logits
    pub fn forward(&self, input_ids: &Tensor, mask: &Tensor, train: bool) -> Result<Tensor> {
        let hidden = self.decoder.forward(input_ids, mask, train)?;
        self.projection.forward(&hidden)
    }

    pub fn embedding_weight(&self) -> &Tensor {
        self.decoder.embed().weight()
    }

    pub fn embedding_var(&self) -> Result<Var> {
        self.var(EMBEDDING_VAR)
    }

    pub fn var(&self, name: &str) -> Result<Var> {
        self.named_vars()?
            .into_iter()
            .find(|(n, _)| n == name)
            .map(|(_, var)| var)
            .ok_or_else(|| candle_core::Error::Msg(format!("no variable named {name}")))
    }

    /// All variables sorted by name.
    pub fn named_vars(&self) -> Result<Vec<(String, Var)>> {
        let data = self
            .varmap
            .data()
            .lock()
            .map_err(|e| candle_core::Error::Msg(e.to_string()))?;
        let mut vars = data
            .iter()
            .map(|(name, var)| (name.clone(), var.clone()))
            .collect::<Vec<_>>();
        vars.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(vars)
    }

    /// The variables an optimizer should update. With `lock_weights` every
    /// weight except the token embedding is frozen.
    pub fn trainable_vars(&self, lock_weights: bool) -> Result<Vec<(String, Var)>> {
        Ok(self
            .named_vars()?
            .into_iter()
            .filter(|(name, _)| !lock_weights || name == EMBEDDING_VAR)
            .collect())
    }

    pub fn reinit_embedding(&self, strategy: EmbedInit, seed: u64) -> Result<()> {
        reinit(&self.embedding_var()?, strategy, seed)
    }
}

pub fn parameter_count(vars: &[(String, Var)]) -> usize {
    vars.iter().map(|(_, var)| var.elem_count()).sum()
}

/// Builds the two competing models of an experiment. Embeddings are seeded
/// with `seed + model_id`.
pub fn init_models(
    config: &ExperimentConfig,
    vocab_size: usize,
    device: &Device,
) -> Result<(LanguageModel, LanguageModel)> {
    let decoder_config = DecoderConfig {
        vocab_size,
        max_len: config.seqlen,
        d_model: config.d_model,
        n_layers: config.n_layers,
        heads: config.heads,
        d_ff: config.d_ff,
        dropout: config.dropout,
    };
    let model1 = LanguageModel::new(decoder_config, config.embed_init(1), config.seed + 1, device)?;
    let model2 = LanguageModel::new(decoder_config, config.embed_init(2), config.seed + 2, device)?;
    Ok((model1, model2))
}
