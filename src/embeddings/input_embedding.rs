use candle_core::{Result, Tensor};
use candle_nn::{Embedding, Init, Module, VarBuilder};

/// Token embedding table scaled by `sqrt(d_model)` on lookup.
pub struct InputEmbedding {
    scale: f64,
    embedding: Embedding,
}

impl InputEmbedding {
    pub fn new(vocab_size: usize, d_model: usize, init: Init, vb: VarBuilder) -> Result<Self> {
        let weight = vb.get_with_hints((vocab_size, d_model), "weight", init)?;
        Ok(Self {
            scale: (d_model as f64).sqrt(),
            embedding: Embedding::new(weight, d_model),
        })
    }

    /// The raw (unscaled) table, shape (vocab_size, d_model).
    pub fn weight(&self) -> &Tensor {
        self.embedding.embeddings()
    }
}

impl Module for InputEmbedding {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        // (batch, seq_len) -> (batch, seq_len, d_model)
        self.embedding.forward(xs)? * self.scale
    }
}
