use candle_core::{Result, Tensor};
use candle_nn::{Dropout, Module, VarBuilder};

use crate::layer_norm::LayerNormalization;

/// Pre-norm residual wrapper: `x + dropout(sublayer(norm(x)))`.
pub struct ResidualConnection {
    dropout: Dropout,
    norm: LayerNormalization,
}

impl ResidualConnection {
    pub fn new(features: usize, drop_p: f32, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            dropout: Dropout::new(drop_p),
            norm: LayerNormalization::new(features, 1e-5, vb.pp("norm"))?,
        })
    }

    pub fn forward(
        &self,
        xs: &Tensor,
        sub_layer: impl FnOnce(&Tensor) -> Result<Tensor>,
        train: bool,
    ) -> Result<Tensor> {
        let update = sub_layer(&self.norm.forward(xs)?)?;
        xs + self.dropout.forward(&update, train)?
    }
}
