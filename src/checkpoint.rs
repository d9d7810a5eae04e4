use std::{collections::HashMap, path::Path};

use anyhow::{Context, Result};
use candle_core::{safetensors, Device, Tensor};

use crate::{
    error::ExperimentError, experiment::ExperimentLayout, model::LanguageModel, optimizer::Adam,
};

const MODEL_PREFIX: &str = "model.";

fn model_tensors(model: &LanguageModel) -> Result<HashMap<String, Tensor>> {
    Ok(model
        .named_vars()?
        .into_iter()
        .map(|(name, var)| (format!("{MODEL_PREFIX}{name}"), var.as_tensor().clone()))
        .collect())
}

/// Writes model weights and optimizer state for `epoch` into a single safetensors file.
pub fn save_checkpoint(
    model: &LanguageModel,
    optimizer: &Adam,
    layout: &ExperimentLayout,
    epoch: usize,
    model_id: usize,
) -> Result<()> {
    let path = layout.checkpoint(model_id, epoch);
    let mut tensors = model_tensors(model)?;
    tensors.extend(optimizer.state()?);
    safetensors::save(&tensors, &path)
        .with_context(|| format!("Failed to save checkpoint to '{}'", path.display()))?;
    tracing::info!("Checkpoint saved at epoch {epoch} for model {model_id}");
    Ok(())
}

fn read(path: &Path, device: &Device) -> Result<HashMap<String, Tensor>> {
    safetensors::load(path, device)
        .with_context(|| format!("Cannot load checkpoint '{}'", path.display()))
}

fn restore_weights(model: &LanguageModel, tensors: &HashMap<String, Tensor>) -> Result<()> {
    for (name, var) in model.named_vars()? {
        let key = format!("{MODEL_PREFIX}{name}");
        let saved = tensors
            .get(&key)
            .ok_or_else(|| ExperimentError::MissingWeight(key.clone()))?;
        if saved.dims() != var.dims() {
            return Err(ExperimentError::ShapeMismatch {
                name,
                expected: var.dims().to_vec(),
                found: saved.dims().to_vec(),
            }
            .into());
        }
        var.set(&saved.to_dtype(var.dtype())?)?;
    }
    Ok(())
}

/// Restores model weights only; used to share starter weights between models.
pub fn load_model(model: &LanguageModel, path: &Path) -> Result<()> {
    let device = model.embedding_weight().device().clone();
    restore_weights(model, &read(path, &device)?)
}

/// Restores model weights and optimizer state.
pub fn load_checkpoint(model: &LanguageModel, optimizer: &mut Adam, path: &Path) -> Result<()> {
    let device = model.embedding_weight().device().clone();
    let tensors = read(path, &device)?;
    restore_weights(model, &tensors)?;
    optimizer.load_state(&tensors)?;
    tracing::info!("Model and optimizer states have been loaded successfully.");
    Ok(())
}

/// Snapshots the token embedding table as `weight`.
pub fn save_embeddings(
    model: &LanguageModel,
    layout: &ExperimentLayout,
    model_id: usize,
    epoch: usize,
) -> Result<()> {
    let path = layout.embeddings(model_id, epoch);
    let weight = model.embedding_weight().to_device(&Device::Cpu)?;
    weight
        .save_safetensors("weight", &path)
        .with_context(|| format!("Failed to save embeddings to '{}'", path.display()))?;
    Ok(())
}
