use candle_core::{Result, Tensor};
use candle_nn::{linear, Activation, Dropout, Linear, ModuleT, VarBuilder};

/// Position-wise `d_model -> d_ff -> d_model` ReLU network.
pub struct FeedForward {
    expand: Linear,
    dropout: Dropout,
    contract: Linear,
}

impl FeedForward {
    pub fn new(d_model: usize, d_ff: usize, drop_p: f32, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            expand: linear(d_model, d_ff, vb.pp("expand"))?,
            dropout: Dropout::new(drop_p),
            contract: linear(d_ff, d_model, vb.pp("contract"))?,
        })
    }
}

impl ModuleT for FeedForward {
    fn forward_t(&self, xs: &Tensor, train: bool) -> Result<Tensor> {
        xs.apply(&self.expand)?
            .apply(&Activation::Relu)?
            .apply_t(&self.dropout, train)?
            .apply(&self.contract)
    }
}
