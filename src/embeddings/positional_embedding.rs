use candle_core::{DType, Device, IndexOp, Result, Tensor};
use candle_nn::{Dropout, ModuleT};

/// Fixed sinusoidal positions added to the token embeddings, followed by dropout.
pub struct PositionalEmbedding {
    table: Tensor,
    dropout: Dropout,
}

impl PositionalEmbedding {
    pub fn new(
        max_len: usize,
        d_model: usize,
        drop_p: f32,
        dtype: DType,
        device: &Device,
    ) -> Result<Self> {
        let half = d_model / 2;

        // 1 / 10_000^(2i / d_model) = exp(-2i * ln(10_000) / d_model)
        let inv_freq = (Tensor::arange(0u32, half as u32, device)?.to_dtype(DType::F32)?
            * (-2. * 10_000f64.ln() / d_model as f64))?
            .exp()?
            .reshape((1, half))?;
        let positions = Tensor::arange(0u32, max_len as u32, device)?
            .to_dtype(DType::F32)?
            .reshape((max_len, 1))?;
        let angles = positions.matmul(&inv_freq)?;

        // interleave: even columns sin, odd columns cos
        let table = Tensor::stack(&[&angles.sin()?, &angles.cos()?], 2)?
            .reshape((max_len, d_model))?
            .to_dtype(dtype)?
            .unsqueeze(0)?;

        Ok(Self {
            table,
            dropout: Dropout::new(drop_p),
        })
    }

    pub fn max_len(&self) -> usize {
        self.table.dims()[1]
    }
}

impl ModuleT for PositionalEmbedding {
    fn forward_t(&self, xs: &Tensor, train: bool) -> Result<Tensor> {
        let (_, seq_len, _) = xs.dims3()?;
        if seq_len > self.max_len() {
            candle_core::bail!(
                "sequence of length {seq_len} exceeds {} positions",
                self.max_len()
            );
        }
        let xs = xs.broadcast_add(&self.table.i((.., ..seq_len, ..))?)?;
        self.dropout.forward(&xs, train)
    }
}
