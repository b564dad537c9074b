use candle_core::Tensor;

use crate::{
    error::{Error, Result},
    model_manager::{self, SharedModel},
};

/// Scores (query, candidate) pairs; higher means more relevant.
///
/// Implementations must score the whole batch in one call and return
/// exactly one score per candidate, in candidate order.
pub trait PairScorer: Send + Sync {
    fn score(&self, query: &str, candidates: &[&str]) -> Result<Vec<f32>>;
}

/// Late-interaction reranker using ColBERT MaxSim.
///
/// The query is encoded once and all candidates are encoded as a single
/// document batch. Each candidate then gets:
/// 1. Similarity matrix: query_emb @ doc_emb^T
/// 2. Row-wise max (best matching document token per query token)
/// 3. Sum of the maxes
pub struct ColbertScorer {
    model: SharedModel,
}

impl ColbertScorer {
    pub fn new(model: SharedModel) -> Self {
        Self { model }
    }
}

impl PairScorer for ColbertScorer {
    fn score(&self, query: &str, candidates: &[&str]) -> Result<Vec<f32>> {
        if candidates.is_empty() {
            return Ok(Vec::new());
        }

        let texts: Vec<String> =
            candidates.iter().map(|c| c.to_string()).collect();

        let (query_embedding, doc_embeddings) = {
            let mut model = model_manager::lock(&self.model)?;
            let query_embedding =
                model.encode_query(query).map_err(rerank_failure)?;
            let doc_embeddings =
                model.encode_documents(&texts).map_err(rerank_failure)?;
            (query_embedding, doc_embeddings)
        };

        let batch_size = doc_embeddings
            .dims3()
            .map_err(|e| Error::Rerank(format!("unexpected embedding shape: {e}")))?
            .0;
        if batch_size != candidates.len() {
            return Err(Error::Rerank(format!(
                "model returned {batch_size} embeddings for {} candidates",
                candidates.len()
            )));
        }

        (0..batch_size)
            .map(|i| {
                let doc = doc_embeddings.get(i)?;
                maxsim(&query_embedding, &doc)
            })
            .collect::<Result<Vec<f32>>>()
            .map_err(rerank_failure)
    }
}

fn rerank_failure(e: Error) -> Error {
    match e {
        Error::ModelLoad { .. } => e,
        other => Error::Rerank(other.to_string()),
    }
}

/// Compute the MaxSim score between a query embedding and a document embedding.
///
/// query_embedding: [Q, D] where Q = query tokens, D = embedding dimension
/// doc_embedding: [T, D] where T = document tokens, D = embedding dimension
///
/// MaxSim = sum over query tokens of max(query_token . doc_token for all doc tokens)
fn maxsim(query_embedding: &Tensor, doc_embedding: &Tensor) -> Result<f32> {
    // [Q, T]
    let sim_matrix = query_embedding.matmul(&doc_embedding.t()?)?;
    let row_maxes = sim_matrix.max(1)?;
    Ok(row_maxes.sum_all()?.to_scalar::<f32>()?)
}
