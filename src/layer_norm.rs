use candle_core::{DType, Result, Tensor, D};
use candle_nn::{Init, Module, VarBuilder};

/// Layer normalization over the last dimension with learnable gain and bias.
///
/// Statistics are computed in f32 regardless of the input dtype.
pub struct LayerNormalization {
    eps: f64,
    gain: Tensor,
    bias: Tensor,
}

impl LayerNormalization {
    pub fn new(features: usize, eps: f64, vb: VarBuilder) -> Result<Self> {
        let gain = vb.get_with_hints(features, "gain", Init::Const(1.))?;
        let bias = vb.get_with_hints(features, "bias", Init::Const(0.))?;
        Ok(Self { eps, gain, bias })
    }
}

impl Module for LayerNormalization {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let dtype = xs.dtype();
        let xs = xs.to_dtype(DType::F32)?;
        let centered = xs.broadcast_sub(&xs.mean_keepdim(D::Minus1)?)?;
        let var = centered.sqr()?.mean_keepdim(D::Minus1)?;
        centered
            .broadcast_div(&(var + self.eps)?.sqrt()?)?
            .to_dtype(dtype)?
            .broadcast_mul(&self.gain)?
            .broadcast_add(&self.bias)
    }
}

#[cfg(test)]
mod tests {
    use candle_core::{test_utils::to_vec3_round, Device};
    use candle_nn::VarMap;

    use super::*;

    #[test]
    fn test_layer_norm() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let layer = LayerNormalization::new(4, 1e-5, vb).unwrap();
        let xs = Tensor::new(&[[[2f32, 2., 2., 2.], [0., 0., 4., 4.]]], &Device::Cpu).unwrap();
        let ys = layer.forward(&xs).unwrap();
        assert_eq!(
            to_vec3_round(&ys, 3).unwrap(),
            &[[[0.0, 0.0, 0.0, 0.0], [-1.0, -1.0, 1.0, 1.0]]]
        );
    }
}
