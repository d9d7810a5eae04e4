use candle_core::{Result, Tensor};
use candle_nn::{linear_no_bias, Dropout, Linear, Module, VarBuilder};

#[cfg(feature = "metal")]
use candle_core::D;
#[cfg(feature = "metal")]
use candle_nn::ops::softmax;

#[cfg(not(feature = "metal"))]
use candle_nn::ops::softmax_last_dim;

use crate::utils::masked_fill;

/// Scaled dot-product attention on (batch, heads, seq_len, head_size) inputs.
/// Returns the attended values and the attention weights.
fn attention(
    q: &Tensor,
    k: &Tensor,
    v: &Tensor,
    mask: Option<&Tensor>,
    dropout: Option<&Dropout>,
    train: bool,
) -> Result<(Tensor, Tensor)> {
    let head_size = q.dim(candle_core::D::Minus1)?;
    let scores = (q.matmul(&k.t()?)? / (head_size as f64).sqrt())?;

    let scores = match mask {
        Some(m) => masked_fill(&scores, m)?,
        None => scores,
    };

    #[cfg(not(feature = "metal"))]
    let weights = softmax_last_dim(&scores)?;

    #[cfg(feature = "metal")]
    let weights = softmax(&scores, D::Minus1)?;

    let weights = match dropout {
        Some(d) => d.forward(&weights, train)?,
        None => weights,
    };

    Ok((weights.matmul(v)?, weights))
}

/// Masked multi-head self-attention.
pub struct MultiHeadAttention {
    w_q: Linear,
    w_k: Linear,
    w_v: Linear,
    w_o: Linear,
    dropout: Dropout,
    num_heads: usize,
    head_size: usize,
}

impl MultiHeadAttention {
    pub fn new(d_model: usize, num_heads: usize, drop_p: f32, vb: VarBuilder) -> Result<Self> {
        if num_heads == 0 || d_model % num_heads != 0 {
            candle_core::bail!("d_model {d_model} is not divisible by {num_heads} heads");
        }
        Ok(Self {
            w_q: linear_no_bias(d_model, d_model, vb.pp("w_q"))?,
            w_k: linear_no_bias(d_model, d_model, vb.pp("w_k"))?,
            w_v: linear_no_bias(d_model, d_model, vb.pp("w_v"))?,
            w_o: linear_no_bias(d_model, d_model, vb.pp("w_o"))?,
            dropout: Dropout::new(drop_p),
            num_heads,
            head_size: d_model / num_heads,
        })
    }

    // (batch, seq_len, d_model) -> (batch, heads, seq_len, head_size)
    fn split_heads(&self, xs: &Tensor) -> Result<Tensor> {
        let (batch_size, seq_len, _) = xs.dims3()?;
        xs.reshape((batch_size, seq_len, self.num_heads, self.head_size))?
            .transpose(1, 2)?
            .contiguous()
    }

    pub fn forward(&self, xs: &Tensor, mask: Option<&Tensor>, train: bool) -> Result<Tensor> {
        let (batch_size, seq_len, d_model) = xs.dims3()?;
        let q = self.split_heads(&self.w_q.forward(xs)?)?;
        let k = self.split_heads(&self.w_k.forward(xs)?)?;
        let v = self.split_heads(&self.w_v.forward(xs)?)?;

        let (output, _) = attention(&q, &k, &v, mask, Some(&self.dropout), train)?;

        output
            .transpose(1, 2)?
            .contiguous()?
            .reshape((batch_size, seq_len, d_model))?
            .apply(&self.w_o)
    }
}

#[cfg(test)]
mod tests {
    use candle_core::{DType, Device, IndexOp, Tensor};
    use candle_nn::{VarBuilder, VarMap};

    use super::*;
    use crate::utils::causal_mask;

    #[test]
    fn test_causal_attention_ignores_future() {
        let device = Device::Cpu;
        let q = Tensor::new(&[[[[1f32, 0.], [0., 1.], [1., 1.]]]], &device).unwrap();
        let mask = causal_mask(3, &device).unwrap();

        let (output, weights) = attention(&q, &q, &q, Some(&mask), None, false).unwrap();
        assert_eq!(output.dims4().unwrap(), (1, 1, 3, 2));

        let weights = weights.i((0, 0)).unwrap().to_vec2::<f32>().unwrap();
        assert_eq!(weights[0], vec![1.0, 0.0, 0.0]);
        assert_eq!(weights[1][2], 0.0);
        for row in &weights {
            assert!((row.iter().sum::<f32>() - 1.0).abs() < 1e-5);
        }
        // the first position can only see itself
        assert_eq!(
            output.i((0, 0, 0)).unwrap().to_vec1::<f32>().unwrap(),
            vec![1.0, 0.0]
        );
    }

    #[test]
    fn test_self_attention_shape() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let mha = MultiHeadAttention::new(16, 4, 0.0, vb).unwrap();

        let xs = Tensor::randn(0f32, 1., (2, 5, 16), &device).unwrap();
        let mask = causal_mask(5, &device).unwrap();
        let ys = mha.forward(&xs, Some(&mask), false).unwrap();
        assert_eq!(ys.dims3().unwrap(), (2, 5, 16));
    }

    #[test]
    fn test_rejects_indivisible_heads() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        assert!(MultiHeadAttention::new(10, 3, 0.0, vb).is_err());
    }
}
