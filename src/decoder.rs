use candle_core::{Result, Tensor};
use candle_nn::{Init, Module, ModuleT, VarBuilder};

use crate::{
    embeddings::{input_embedding::InputEmbedding, positional_embedding::PositionalEmbedding},
    feed_forward::FeedForward,
    layer_norm::LayerNormalization,
    multi_head_attention::MultiHeadAttention,
    residual_connection::ResidualConnection,
};

pub struct DecoderBlock {
    self_attention: MultiHeadAttention,
    feed_forward: FeedForward,
    attention_residual: ResidualConnection,
    feed_forward_residual: ResidualConnection,
}

impl DecoderBlock {
    pub fn new(
        d_model: usize,
        num_heads: usize,
        d_ff: usize,
        drop_p: f32,
        vb: VarBuilder,
    ) -> Result<Self> {
        Ok(Self {
            self_attention: MultiHeadAttention::new(
                d_model,
                num_heads,
                drop_p,
                vb.pp("self_attention"),
            )?,
            feed_forward: FeedForward::new(d_model, d_ff, drop_p, vb.pp("feed_forward"))?,
            attention_residual: ResidualConnection::new(
                d_model,
                drop_p,
                vb.pp("attention_residual"),
            )?,
            feed_forward_residual: ResidualConnection::new(
                d_model,
                drop_p,
                vb.pp("feed_forward_residual"),
            )?,
        })
    }

    pub fn forward(&self, xs: &Tensor, mask: &Tensor, train: bool) -> Result<Tensor> {
        let xs = self.attention_residual.forward(
            xs,
            |x| self.self_attention.forward(x, Some(mask), train),
            train,
        )?;
        self.feed_forward_residual
            .forward(&xs, |x| self.feed_forward.forward_t(x, train), train)
    }
}

/// Shape of a decoder stack.
#[derive(Debug, Clone, Copy)]
pub struct DecoderConfig {
    pub vocab_size: usize,
    pub max_len: usize,
    pub d_model: usize,
    pub n_layers: usize,
    pub heads: usize,
    pub d_ff: usize,
    pub dropout: f32,
}

/// Token embedding, positions, `n_layers` masked self-attention blocks and a
/// final layer norm.
pub struct Decoder {
    embed: InputEmbedding,
    pos_embed: PositionalEmbedding,
    blocks: Vec<DecoderBlock>,
    norm: LayerNormalization,
}

impl Decoder {
    pub fn new(config: &DecoderConfig, embed_init: Init, vb: VarBuilder) -> Result<Self> {
        let embed = InputEmbedding::new(
            config.vocab_size,
            config.d_model,
            embed_init,
            vb.pp("embed"),
        )?;
        let pos_embed = PositionalEmbedding::new(
            config.max_len,
            config.d_model,
            config.dropout,
            vb.dtype(),
            vb.device(),
        )?;
        let blocks = (0..config.n_layers)
            .map(|i| {
                DecoderBlock::new(
                    config.d_model,
                    config.heads,
                    config.d_ff,
                    config.dropout,
                    vb.pp(format!("block_{i}")),
                )
            })
            .collect::<Result<Vec<_>>>()?;
        let norm = LayerNormalization::new(config.d_model, 1e-5, vb.pp("norm"))?;

        Ok(Self {
            embed,
            pos_embed,
            blocks,
            norm,
        })
    }

    pub fn embed(&self) -> &InputEmbedding {
        &self.embed
    }

    /// (batch, seq_len) token ids -> (batch, seq_len, d_model)
    pub fn forward(&self, input_ids: &Tensor, mask: &Tensor, train: bool) -> Result<Tensor> {
        let mut xs = self
            .pos_embed
            .forward_t(&self.embed.forward(input_ids)?, train)?;
        for block in &self.blocks {
            xs = block.forward(&xs, mask, train)?;
        }
        self.norm.forward(&xs)
    }
}
