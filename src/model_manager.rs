use std::sync::{Arc, Mutex, MutexGuard};

use candle_core::{Device, Tensor};
use pylate_rs::ColBERT;

use crate::error::{Error, Result};

pub const DEFAULT_MODEL_ID: &str = "lightonai/GTE-ModernColBERT-v1";

/// Select the best available compute device.
///
/// Uses CUDA when compiled with the `cuda` feature, Metal when compiled with
/// the `metal` feature, and falls back to CPU otherwise.
fn default_device() -> Device {
    #[cfg(feature = "cuda")]
    {
        if let Ok(device) = Device::new_cuda(0) {
            return device;
        }
    }

    #[cfg(feature = "metal")]
    {
        if let Ok(device) = Device::new_metal(0) {
            return device;
        }
    }

    Device::Cpu
}

/// Owns the ColBERT model shared by the embedder and the reranker, loading
/// it lazily on first use.
pub struct ModelManager {
    model: Option<ColBERT>,
    model_id: String,
}

impl Default for ModelManager {
    fn default() -> Self {
        Self::new(DEFAULT_MODEL_ID.to_string())
    }
}

impl ModelManager {
    /// Creates a manager for a HuggingFace model ID or a local model path.
    /// Nothing is downloaded or loaded until the first encode call.
    pub fn new(model_id: String) -> Self {
        Self {
            model: None,
            model_id,
        }
    }

    pub fn model_id(&self) -> &str {
        &self.model_id
    }

    pub fn is_loaded(&self) -> bool {
        self.model.is_some()
    }

    fn ensure_loaded(&mut self) -> Result<&mut ColBERT> {
        let model = match self.model.take() {
            Some(model) => model,
            None => {
                tracing::info!(model = %self.model_id, "loading ColBERT model");
                let loaded: std::result::Result<ColBERT, _> =
                    ColBERT::from(&self.model_id)
                        .with_device(default_device())
                        .try_into();
                loaded.map_err(|e| Error::ModelLoad {
                    model: self.model_id.clone(),
                    reason: e.to_string(),
                })?
            }
        };
        Ok(self.model.insert(model))
    }

    /// Encodes texts as documents.
    ///
    /// Returns a 3D tensor of shape `[B, T, D]`; shorter documents are
    /// padded with zero rows.
    pub fn encode_documents(&mut self, texts: &[String]) -> Result<Tensor> {
        let model = self.ensure_loaded()?;
        Ok(model.encode(texts, false)?)
    }

    /// Encodes a query string into token-level embeddings of shape `[Q, D]`.
    pub fn encode_query(&mut self, query: &str) -> Result<Tensor> {
        let model = self.ensure_loaded()?;
        let embeddings = model.encode(&[query.to_string()], true)?;
        // [1, Q, D] -> [Q, D]
        Ok(embeddings.squeeze(0)?)
    }
}

/// A model shared between the query embedder and the reranker so the
/// weights are only loaded once per process.
pub type SharedModel = Arc<Mutex<ModelManager>>;

pub fn shared(model: ModelManager) -> SharedModel {
    Arc::new(Mutex::new(model))
}

pub(crate) fn lock(model: &SharedModel) -> Result<MutexGuard<'_, ModelManager>> {
    model
        .lock()
        .map_err(|_| Error::Config("model lock poisoned".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn custom_model_id() {
        let manager = ModelManager::new("custom/model".to_string());
        assert_eq!(manager.model_id(), "custom/model");
        assert!(!manager.is_loaded());
    }

    #[test]
    fn default_uses_default_model() {
        let manager = ModelManager::default();
        assert_eq!(manager.model_id(), DEFAULT_MODEL_ID);
        assert!(!manager.is_loaded());
    }
}
