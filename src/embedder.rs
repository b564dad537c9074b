use crate::{
    error::{Error, Result},
    model_manager::{self, SharedModel},
};

/// Turns text into a fixed-length dense vector.
pub trait Embedder: Send + Sync {
    fn encode(&self, text: &str) -> Result<Vec<f32>>;

    /// Encodes several texts, one vector per input in input order.
    fn encode_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        texts.iter().map(|t| self.encode(t)).collect()
    }
}

/// Dense embeddings obtained by mean-pooling ColBERT token embeddings.
///
/// Padding rows (all zeros) are excluded from the mean and the pooled
/// vector is L2-normalized, so cosine distance between two pooled vectors
/// is well defined.
pub struct ColbertEmbedder {
    model: SharedModel,
}

impl ColbertEmbedder {
    pub fn new(model: SharedModel) -> Self {
        Self { model }
    }
}

impl Embedder for ColbertEmbedder {
    fn encode(&self, text: &str) -> Result<Vec<f32>> {
        let mut model = model_manager::lock(&self.model)?;
        let tokens = model
            .encode_query(text)
            .and_then(|t| Ok(t.to_vec2::<f32>()?))
            .map_err(embedding_failure)?;

        mean_pool(&tokens).ok_or_else(|| {
            Error::Embedding(format!("model produced no token embeddings for {text:?}"))
        })
    }

    fn encode_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let mut model = model_manager::lock(&self.model)?;
        let batch = model
            .encode_documents(texts)
            .and_then(|t| Ok(t.to_vec3::<f32>()?))
            .map_err(embedding_failure)?;

        if batch.len() != texts.len() {
            return Err(Error::Embedding(format!(
                "model returned {} embeddings for {} texts",
                batch.len(),
                texts.len()
            )));
        }

        batch
            .iter()
            .enumerate()
            .map(|(i, tokens)| {
                mean_pool(tokens).ok_or_else(|| {
                    Error::Embedding(format!(
                        "model produced no token embeddings for text {i}"
                    ))
                })
            })
            .collect()
    }
}

/// A model that cannot be loaded stays a `ModelLoad` error so it is not
/// retried; anything else is an embedding failure.
fn embedding_failure(e: Error) -> Error {
    match e {
        Error::ModelLoad { .. } => e,
        other => Error::Embedding(other.to_string()),
    }
}

/// Average the non-padding token rows and L2-normalize the result.
///
/// Returns `None` when there is no non-zero row to pool.
pub fn mean_pool(tokens: &[Vec<f32>]) -> Option<Vec<f32>> {
    let dimension = tokens.first()?.len();
    let mut sum = vec![0.0f32; dimension];
    let mut count = 0usize;

    for row in tokens {
        if row.len() != dimension || row.iter().all(|&v| v == 0.0) {
            continue;
        }
        for (acc, &v) in sum.iter_mut().zip(row) {
            *acc += v;
        }
        count += 1;
    }

    if count == 0 {
        return None;
    }

    let norm = sum.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm == 0.0 {
        return None;
    }
    Some(sum.into_iter().map(|v| v / norm).collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mean_pool_normalizes() {
        let pooled = mean_pool(&[vec![3.0, 4.0]]).unwrap();
        assert!((pooled[0] - 0.6).abs() < 1e-6);
        assert!((pooled[1] - 0.8).abs() < 1e-6);
    }

    #[test]
    fn mean_pool_skips_padding_rows() {
        let with_padding =
            mean_pool(&[vec![1.0, 0.0], vec![0.0, 1.0], vec![0.0, 0.0]])
                .unwrap();
        let without = mean_pool(&[vec![1.0, 0.0], vec![0.0, 1.0]]).unwrap();
        assert_eq!(with_padding, without);
    }

    #[test]
    fn mean_pool_of_nothing_is_none() {
        assert!(mean_pool(&[]).is_none());
        assert!(mean_pool(&[vec![0.0, 0.0]]).is_none());
    }

    #[test]
    fn load_failures_are_not_turned_into_embedding_errors() {
        let err = embedding_failure(Error::ModelLoad {
            model: "/models/missing".into(),
            reason: "no such file".into(),
        });
        assert!(matches!(err, Error::ModelLoad { .. }));
        assert!(!err.is_transient());

        let err = embedding_failure(Error::Config("shape mismatch".into()));
        assert!(matches!(err, Error::Embedding(_)));
        assert!(err.is_transient());
    }

    #[test]
    fn default_encode_batch_preserves_order() {
        struct Length;
        impl Embedder for Length {
            fn encode(&self, text: &str) -> Result<Vec<f32>> {
                Ok(vec![text.len() as f32])
            }
        }

        let out = Length
            .encode_batch(&["a".to_string(), "abc".to_string()])
            .unwrap();
        assert_eq!(out, vec![vec![1.0], vec![3.0]]);
    }
}
