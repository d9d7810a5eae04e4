use candle_core::{Result, Tensor};
use candle_nn::{linear, Linear, Module, VarBuilder};

/// Maps decoder states to next-token logits.
pub struct ProjectionLayer {
    proj: Linear,
}

impl ProjectionLayer {
    pub fn new(d_model: usize, vocab_size: usize, vb: VarBuilder) -> Result<Self> {
        let proj = linear(d_model, vocab_size, vb)?;
        Ok(Self { proj })
    }
}

impl Module for ProjectionLayer {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        // (batch, seq_len, d_model) -> (batch, seq_len, vocab_size)
        self.proj.forward(xs)
    }
}

#[cfg(test)]
mod tests {
    use candle_core::{DType, Device, Tensor};
    use candle_nn::{Module, VarBuilder, VarMap};

    use super::ProjectionLayer;

    #[test]
    fn test_projection_layer() {
        let (d_model, vocab_size) = (16, 50);
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let projection = ProjectionLayer::new(d_model, vocab_size, vb).unwrap();

        let xs = Tensor::ones((2, 5, d_model), DType::F32, &device).unwrap();
        let logits = projection.forward(&xs).unwrap();

        assert_eq!(logits.dims3().unwrap(), (2, 5, vocab_size));
    }
}
