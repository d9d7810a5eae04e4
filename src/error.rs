use thiserror::Error;

use crate::dataset::Split;

#[derive(Debug, Error)]
pub enum ExperimentError {
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("embeddings differ after loading shared weights (mse = {mse})")]
    EmbeddingMismatch { mse: f32 },

    #[error("{0} split does not contain a single full batch")]
    EmptySplit(Split),

    #[error("checkpoint has no tensor named `{0}`")]
    MissingWeight(String),

    #[error("shape mismatch for `{name}`: expected {expected:?}, found {found:?}")]
    ShapeMismatch {
        name: String,
        expected: Vec<usize>,
        found: Vec<usize>,
    },
}
