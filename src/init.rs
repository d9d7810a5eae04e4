//! Seeded weight initialization for token embeddings.
//!
//! candle's `Init` hints draw from an unseeded generator, so embeddings are
//! created with the hint and then overwritten with values from a seeded
//! `StdRng`. Two models built with the same strategy and seed get identical
//! tables; different seeds give different ones.

use candle_core::{Result, Tensor, Var};
use candle_nn::Init;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::config::EmbedInit;

const UNIFORM_BOUND: f64 = 0.1;

/// Standard deviation for normal strategies, bound for uniform ones.
/// Glorot fans for a `(rows, cols)` weight: fan_in = cols, fan_out = rows.
fn scale(strategy: EmbedInit, rows: usize, cols: usize) -> f64 {
    let fans = (rows + cols) as f64;
    match strategy {
        EmbedInit::GlorotUniform => (6.0 / fans).sqrt(),
        EmbedInit::GlorotNormal => (2.0 / fans).sqrt(),
        EmbedInit::Normal => 1.0,
        EmbedInit::Uniform => UNIFORM_BOUND,
    }
}

fn is_normal(strategy: EmbedInit) -> bool {
    matches!(strategy, EmbedInit::GlorotNormal | EmbedInit::Normal)
}

pub fn init_hint(strategy: EmbedInit, rows: usize, cols: usize) -> Init {
    let scale = scale(strategy, rows, cols);
    if is_normal(strategy) {
        Init::Randn {
            mean: 0.,
            stdev: scale,
        }
    } else {
        Init::Uniform {
            lo: -scale,
            up: scale,
        }
    }
}

fn sample_normal(rng: &mut StdRng, n: usize, std: f32) -> Vec<f32> {
    // Box-Muller
    (0..n)
        .map(|_| {
            let u1: f32 = rng.gen_range(f32::EPSILON..1.0);
            let u2: f32 = rng.gen_range(0.0..1.0);
            let z = (-2.0 * u1.ln()).sqrt() * (2.0 * std::f32::consts::PI * u2).cos();
            std * z
        })
        .collect()
}

fn sample_uniform(rng: &mut StdRng, n: usize, bound: f32) -> Vec<f32> {
    (0..n).map(|_| rng.gen_range(-bound..bound)).collect()
}

/// Draws a `(rows, cols)` f32 table for `strategy` from a generator seeded with `seed`.
pub fn sample(strategy: EmbedInit, rows: usize, cols: usize, seed: u64) -> Vec<f32> {
    let mut rng = StdRng::seed_from_u64(seed);
    let n = rows * cols;
    let scale = scale(strategy, rows, cols) as f32;
    if is_normal(strategy) {
        sample_normal(&mut rng, n, scale)
    } else {
        sample_uniform(&mut rng, n, scale)
    }
}

/// Overwrites a 2d var in place with seeded values for `strategy`.
pub fn reinit(var: &Var, strategy: EmbedInit, seed: u64) -> Result<()> {
    let (rows, cols) = var.dims2()?;
    let values = sample(strategy, rows, cols, seed);
    let fresh = Tensor::from_vec(values, (rows, cols), var.device())?.to_dtype(var.dtype())?;
    var.set(&fresh)
}
