use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::{
    cache::{Fingerprint, ResultCache},
    data_dir::DataDir,
    embedder::{ColbertEmbedder, Embedder},
    error::{Error, Result},
    model_manager::{self, ModelManager},
    reranker::{ColbertScorer, PairScorer},
    retry::RetryPolicy,
    settings::Settings,
    vector_store::{ChunkMetadata, VectorDb, VectorIndex, Where},
};

pub const DEFAULT_TOP_K: usize = 5;

/// How many candidates the recall stage fetches per requested result.
pub const OVERFETCH_FACTOR: usize = 2;

/// A chunk with its relevance score for one query.
///
/// Scores are only comparable within a single search call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoredChunk {
    pub chunk: String,
    pub metadata: ChunkMetadata,
    pub score: f32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchRequest {
    pub query: String,
    pub top_k: usize,
    pub thread_id: Option<u64>,
}

impl SearchRequest {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            top_k: DEFAULT_TOP_K,
            thread_id: None,
        }
    }

    pub fn top_k(mut self, top_k: usize) -> Self {
        self.top_k = top_k;
        self
    }

    pub fn thread(mut self, thread_id: Option<u64>) -> Self {
        self.thread_id = thread_id;
        self
    }

    fn validate(&self) -> Result<()> {
        if self.query.trim().is_empty() {
            return Err(Error::InvalidQuery("query cannot be empty".to_string()));
        }
        if self.top_k == 0 {
            return Err(Error::InvalidQuery("top_k must be at least 1".to_string()));
        }
        Ok(())
    }

    pub fn fingerprint(&self) -> Fingerprint {
        Fingerprint::new(&self.query, self.top_k, self.thread_id)
    }
}

/// Where a search result list came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ResultSource {
    Cache,
    Computed,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SearchOutcome {
    pub results: Vec<ScoredChunk>,
    pub source: ResultSource,
}

/// Two-stage retrieval: vector recall, then pairwise rerank.
///
/// 1. Fingerprint the request and return a cached list on hit
/// 2. Embed the query, unless the index holds nothing at all
/// 3. Fetch `OVERFETCH_FACTOR * top_k` nearest chunks (optionally one thread)
/// 4. Rerank every candidate in a single batched call
/// 5. Stable sort by score descending, truncate to `top_k`
/// 6. Cache non-empty results
pub struct SearchEngine {
    embedder: Box<dyn Embedder>,
    index: Box<dyn VectorIndex>,
    scorer: Box<dyn PairScorer>,
    cache: ResultCache,
    retry: RetryPolicy,
}

impl SearchEngine {
    pub fn new(
        embedder: Box<dyn Embedder>,
        index: Box<dyn VectorIndex>,
        scorer: Box<dyn PairScorer>,
        cache: ResultCache,
    ) -> Self {
        Self {
            embedder,
            index,
            scorer,
            cache,
            retry: RetryPolicy::default(),
        }
    }

    /// Engine over the configured collection in `data_dir`, with one
    /// lazily loaded ColBERT model shared by embedding and reranking.
    pub fn open(data_dir: &DataDir, settings: &Settings) -> Result<Self> {
        let vectors = VectorDb::open(&data_dir.vectors_db())?;
        let collection = vectors.get_or_create_collection(&settings.collection)?;
        let cache = ResultCache::open(&data_dir.cache_file())?;
        let model = model_manager::shared(ModelManager::new(settings.model.clone()));

        Ok(Self::new(
            Box::new(ColbertEmbedder::new(Arc::clone(&model))),
            Box::new(collection),
            Box::new(ColbertScorer::new(model)),
            cache,
        ))
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn cache(&self) -> &ResultCache {
        &self.cache
    }

    /// Ranked chunks for `query`, at most `top_k` of them.
    pub fn search(
        &self,
        query: &str,
        top_k: usize,
        filter_thread_id: Option<u64>,
    ) -> Result<Vec<ScoredChunk>> {
        let request = SearchRequest::new(query)
            .top_k(top_k)
            .thread(filter_thread_id);
        Ok(self.execute(&request)?.results)
    }

    pub fn execute(&self, request: &SearchRequest) -> Result<SearchOutcome> {
        request.validate()?;

        let fingerprint = request.fingerprint();
        if let Some(results) = self.cache.get(fingerprint.as_str()) {
            tracing::debug!(%fingerprint, results = results.len(), "cache hit");
            return Ok(SearchOutcome {
                results,
                source: ResultSource::Cache,
            });
        }

        if self.index.is_empty().map_err(|e| stage_error(e, Error::Retrieval))? {
            tracing::debug!("index is empty, skipping query embedding");
            return Ok(SearchOutcome {
                results: Vec::new(),
                source: ResultSource::Computed,
            });
        }

        let query = request.query.as_str();
        let embedding = self
            .retry
            .run("embed", || self.embedder.encode(query))
            .map_err(|e| stage_error(e, Error::Embedding))?;

        let filter = request.thread_id.map(Where::ThreadId);
        let fetch = request.top_k.saturating_mul(OVERFETCH_FACTOR);
        let candidates = self
            .retry
            .run("retrieve", || self.index.query(&embedding, fetch, filter.as_ref()))
            .map_err(|e| stage_error(e, Error::Retrieval))?;

        tracing::debug!(candidates = candidates.len(), fetch, "recall stage done");

        if candidates.is_empty() {
            return Ok(SearchOutcome {
                results: Vec::new(),
                source: ResultSource::Computed,
            });
        }

        let texts: Vec<&str> = candidates.iter().map(|c| c.text.as_str()).collect();
        let scores = self
            .retry
            .run("rerank", || self.scorer.score(query, &texts))
            .map_err(|e| stage_error(e, Error::Rerank))?;

        if scores.len() != candidates.len() {
            return Err(Error::Rerank(format!(
                "scorer returned {} scores for {} candidates",
                scores.len(),
                candidates.len()
            )));
        }
        // serde_json writes NaN and infinity as null.
        if let Some(pos) = scores.iter().position(|s| !s.is_finite()) {
            return Err(Error::Rerank(format!(
                "scorer returned non-finite score {} for candidate {pos}",
                scores[pos]
            )));
        }

        let mut ranked: Vec<ScoredChunk> = candidates
            .into_iter()
            .zip(scores)
            .map(|(candidate, score)| ScoredChunk {
                chunk: candidate.text,
                metadata: candidate.metadata,
                score,
            })
            .collect();

        // Stable: equal scores keep retrieval order.
        ranked.sort_by(|a, b| b.score.total_cmp(&a.score));
        ranked.truncate(request.top_k);

        if !ranked.is_empty() {
            self.cache.set(fingerprint.as_str(), ranked.clone())?;
        }

        tracing::debug!(%fingerprint, results = ranked.len(), "computed results");

        Ok(SearchOutcome {
            results: ranked,
            source: ResultSource::Computed,
        })
    }
}

/// Keep stage-specific errors as they are; wrap anything else so the
/// caller can tell which stage failed.
fn stage_error(e: Error, wrap: fn(String) -> Error) -> Error {
    match e {
        Error::Embedding(_)
        | Error::Retrieval(_)
        | Error::Rerank(_)
        | Error::ModelLoad { .. } => e,
        other => wrap(other.to_string()),
    }
}

/// Format results for human-readable terminal output.
pub fn format_human(results: &[ScoredChunk]) {
    if results.is_empty() {
        println!("No results found.");
        return;
    }

    for (i, r) in results.iter().enumerate() {
        println!(
            "{:>3}. [{:.3}] thread {} | {} | {} | {}",
            i + 1,
            r.score,
            r.metadata.thread_id,
            r.metadata.subject,
            r.metadata.sender,
            r.metadata.timestamp
        );
        println!("     {}", preview(&r.chunk, 200));
    }
    println!("\n{} result(s)", results.len());
}

/// First `max_chars` characters of `text`, with an ellipsis if cut.
pub fn preview(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((cut, _)) => format!("{}...", &text[..cut]),
        None => text.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use std::{
        collections::HashMap,
        sync::{
            Arc,
            Mutex,
            atomic::{AtomicUsize, Ordering},
        },
        time::Duration,
    };

    use super::*;
    use crate::vector_store::Candidate;

    fn meta(thread_id: u64) -> ChunkMetadata {
        ChunkMetadata {
            thread_id,
            subject: format!("Thread {thread_id}"),
            sender: "ops@example.com".to_string(),
            timestamp: "2001-10-01 08:00:00".to_string(),
        }
    }

    /// Fails the first `failures` calls with `error`, then succeeds.
    struct FakeEmbedder {
        calls: Arc<AtomicUsize>,
        failures: usize,
        error: fn() -> Error,
    }

    fn offline() -> Error {
        Error::Embedding("model offline".into())
    }

    fn missing_model() -> Error {
        Error::ModelLoad {
            model: "/models/missing".into(),
            reason: "config.json not found".into(),
        }
    }

    impl Embedder for FakeEmbedder {
        fn encode(&self, _text: &str) -> Result<Vec<f32>> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures {
                return Err((self.error)());
            }
            Ok(vec![1.0, 0.0])
        }
    }

    /// Returns the stored candidates in order, honoring `k` and the filter.
    struct FakeIndex {
        candidates: Vec<Candidate>,
        requested_k: Arc<Mutex<Vec<usize>>>,
        fail: bool,
    }

    impl VectorIndex for FakeIndex {
        fn query(
            &self,
            _vector: &[f32],
            k: usize,
            filter: Option<&Where>,
        ) -> Result<Vec<Candidate>> {
            self.requested_k.lock().unwrap().push(k);
            if self.fail {
                return Err(Error::Retrieval("store unreachable".into()));
            }
            Ok(self
                .candidates
                .iter()
                .filter(|c| match filter {
                    Some(Where::ThreadId(t)) => c.metadata.thread_id == *t,
                    None => true,
                })
                .take(k)
                .cloned()
                .collect())
        }

        fn is_empty(&self) -> Result<bool> {
            Ok(self.candidates.is_empty() && !self.fail)
        }
    }

    /// Scores each candidate by a fixed table keyed on text.
    struct FakeScorer {
        scores: HashMap<String, f32>,
        calls: Arc<AtomicUsize>,
        truncate_output: bool,
    }

    impl PairScorer for FakeScorer {
        fn score(&self, _query: &str, candidates: &[&str]) -> Result<Vec<f32>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let mut out: Vec<f32> = candidates
                .iter()
                .map(|c| self.scores.get(*c).copied().unwrap_or(0.0))
                .collect();
            if self.truncate_output {
                out.pop();
            }
            Ok(out)
        }
    }

    struct Harness {
        engine: SearchEngine,
        embed_calls: Arc<AtomicUsize>,
        rerank_calls: Arc<AtomicUsize>,
        requested_k: Arc<Mutex<Vec<usize>>>,
        _tmp: tempfile::TempDir,
    }

    struct Setup {
        candidates: Vec<(&'static str, u64, f32)>,
        embed_failures: usize,
        embed_error: fn() -> Error,
        index_fails: bool,
        scorer_truncates: bool,
        retry: RetryPolicy,
    }

    impl Default for Setup {
        fn default() -> Self {
            Self {
                candidates: vec![
                    ("budget approved at 10%", 1, 0.9),
                    ("lunch order", 2, 0.3),
                    ("budget proposal 20%", 1, 0.7),
                ],
                embed_failures: 0,
                embed_error: offline,
                index_fails: false,
                scorer_truncates: false,
                retry: RetryPolicy::none(),
            }
        }
    }

    impl Setup {
        fn build(self) -> Harness {
            let tmp = tempfile::tempdir().unwrap();
            let cache = ResultCache::open(&tmp.path().join("cache.json")).unwrap();

            let embed_calls = Arc::new(AtomicUsize::new(0));
            let rerank_calls = Arc::new(AtomicUsize::new(0));
            let requested_k = Arc::new(Mutex::new(Vec::new()));

            let candidates = self
                .candidates
                .iter()
                .enumerate()
                .map(|(i, (text, thread, _))| Candidate {
                    id: format!("{thread}_{i}_0"),
                    text: text.to_string(),
                    metadata: meta(*thread),
                })
                .collect();
            let scores = self
                .candidates
                .iter()
                .map(|(text, _, score)| (text.to_string(), *score))
                .collect();

            let engine = SearchEngine::new(
                Box::new(FakeEmbedder {
                    calls: Arc::clone(&embed_calls),
                    failures: self.embed_failures,
                    error: self.embed_error,
                }),
                Box::new(FakeIndex {
                    candidates,
                    requested_k: Arc::clone(&requested_k),
                    fail: self.index_fails,
                }),
                Box::new(FakeScorer {
                    scores,
                    calls: Arc::clone(&rerank_calls),
                    truncate_output: self.scorer_truncates,
                }),
                cache,
            )
            .with_retry(self.retry);

            Harness {
                engine,
                embed_calls,
                rerank_calls,
                requested_k,
                _tmp: tmp,
            }
        }
    }

    fn scores(results: &[ScoredChunk]) -> Vec<f32> {
        results.iter().map(|r| r.score).collect()
    }

    #[test]
    fn results_are_sorted_by_score_descending() {
        let h = Setup::default().build();
        let results = h.engine.search("budget?", 3, None).unwrap();
        assert_eq!(scores(&results), vec![0.9, 0.7, 0.3]);
        assert_eq!(results[0].chunk, "budget approved at 10%");
    }

    #[test]
    fn overfetches_twice_top_k() {
        let h = Setup::default().build();
        h.engine.search("budget?", 2, None).unwrap();
        assert_eq!(*h.requested_k.lock().unwrap(), vec![4]);
    }

    #[test]
    fn respects_top_k_bound() {
        for k in 1..=5 {
            let h = Setup::default().build();
            let results = h.engine.search("budget?", k, None).unwrap();
            assert!(results.len() <= k);
            assert_eq!(results.len(), k.min(3));
        }
    }

    #[test]
    fn truncation_keeps_the_best_after_rerank() {
        // Vector order puts the best-scoring chunk last.
        let h = Setup {
            candidates: vec![("a", 1, 0.1), ("b", 1, 0.2), ("c", 1, 0.95)],
            ..Setup::default()
        }
        .build();
        let results = h.engine.search("q", 2, None).unwrap();
        let texts: Vec<&str> = results.iter().map(|r| r.chunk.as_str()).collect();
        assert_eq!(texts, vec!["c", "b"]);
    }

    #[test]
    fn ties_keep_retrieval_order() {
        let h = Setup {
            candidates: vec![("first", 1, 0.5), ("second", 1, 0.5), ("third", 1, 0.8)],
            ..Setup::default()
        }
        .build();
        let results = h.engine.search("q", 3, None).unwrap();
        let texts: Vec<&str> = results.iter().map(|r| r.chunk.as_str()).collect();
        assert_eq!(texts, vec!["third", "first", "second"]);
    }

    #[test]
    fn second_identical_search_is_a_cache_hit() {
        let h = Setup::default().build();
        let request = SearchRequest::new("budget?").top_k(3);

        let first = h.engine.execute(&request).unwrap();
        let second = h.engine.execute(&request).unwrap();

        assert_eq!(first.source, ResultSource::Computed);
        assert_eq!(second.source, ResultSource::Cache);
        assert_eq!(first.results, second.results);
        assert_eq!(h.embed_calls.load(Ordering::SeqCst), 1);
        assert_eq!(h.rerank_calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn forgetting_a_fingerprint_forces_recompute() {
        let h = Setup::default().build();
        let request = SearchRequest::new("budget?").top_k(3);

        h.engine.execute(&request).unwrap();
        assert!(h.engine.cache().remove(request.fingerprint().as_str()).unwrap());

        let again = h.engine.execute(&request).unwrap();
        assert_eq!(again.source, ResultSource::Computed);
        assert_eq!(h.embed_calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn different_top_k_recomputes_instead_of_reusing_cache() {
        let h = Setup {
            candidates: vec![
                ("a", 1, 0.9),
                ("b", 1, 0.8),
                ("c", 1, 0.7),
                ("d", 1, 0.6),
                ("e", 1, 0.5),
            ],
            ..Setup::default()
        }
        .build();

        let three = h.engine.execute(&SearchRequest::new("budget?").top_k(3)).unwrap();
        let five = h.engine.execute(&SearchRequest::new("budget?").top_k(5)).unwrap();

        assert_eq!(three.results.len(), 3);
        assert_eq!(five.source, ResultSource::Computed);
        assert_eq!(five.results.len(), 5);
        assert_eq!(h.embed_calls.load(Ordering::SeqCst), 2);
        assert_eq!(h.engine.cache().len(), 2);
    }

    #[test]
    fn thread_filter_limits_results_and_cache_key() {
        let h = Setup::default().build();

        let filtered = h.engine.search("budget?", 5, Some(1)).unwrap();
        assert!(!filtered.is_empty());
        assert!(filtered.iter().all(|r| r.metadata.thread_id == 1));

        let unfiltered = h.engine.search("budget?", 5, None).unwrap();
        assert_eq!(unfiltered.len(), 3);
        assert_eq!(h.rerank_calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn empty_index_skips_embedding_rerank_and_cache() {
        let h = Setup {
            candidates: vec![],
            ..Setup::default()
        }
        .build();

        let outcome = h.engine.execute(&SearchRequest::new("budget?")).unwrap();

        assert!(outcome.results.is_empty());
        assert_eq!(outcome.source, ResultSource::Computed);
        assert_eq!(h.rerank_calls.load(Ordering::SeqCst), 0);
        assert_eq!(h.embed_calls.load(Ordering::SeqCst), 0);
        assert!(h.engine.cache().is_empty());
    }

    #[test]
    fn filter_matching_nothing_is_not_cached() {
        let h = Setup::default().build();
        let results = h.engine.search("budget?", 3, Some(42)).unwrap();
        assert!(results.is_empty());
        assert_eq!(h.rerank_calls.load(Ordering::SeqCst), 0);
        assert!(h.engine.cache().is_empty());
    }

    #[test]
    fn embedding_failure_is_typed() {
        let h = Setup {
            embed_failures: usize::MAX,
            ..Setup::default()
        }
        .build();
        let err = h.engine.search("budget?", 3, None).unwrap_err();
        assert!(matches!(err, Error::Embedding(_)));
        assert!(h.requested_k.lock().unwrap().is_empty());
    }

    fn instant_retry(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        }
    }

    #[test]
    fn transient_embedding_failure_is_retried() {
        let h = Setup {
            embed_failures: 1,
            retry: instant_retry(2),
            ..Setup::default()
        }
        .build();

        let results = h.engine.search("budget?", 3, None).unwrap();

        assert_eq!(scores(&results), vec![0.9, 0.7, 0.3]);
        assert_eq!(h.embed_calls.load(Ordering::SeqCst), 2);
        assert_eq!(*h.requested_k.lock().unwrap(), vec![6]);
    }

    #[test]
    fn retries_stop_at_max_attempts() {
        let h = Setup {
            embed_failures: usize::MAX,
            retry: instant_retry(3),
            ..Setup::default()
        }
        .build();

        let err = h.engine.search("budget?", 3, None).unwrap_err();

        assert!(matches!(err, Error::Embedding(_)));
        assert_eq!(h.embed_calls.load(Ordering::SeqCst), 3);
        assert!(h.engine.cache().is_empty());
    }

    #[test]
    fn missing_model_is_attempted_once() {
        let h = Setup {
            embed_failures: usize::MAX,
            embed_error: missing_model,
            retry: instant_retry(3),
            ..Setup::default()
        }
        .build();

        let err = h.engine.search("budget?", 3, None).unwrap_err();

        assert!(matches!(err, Error::ModelLoad { .. }));
        assert_eq!(h.embed_calls.load(Ordering::SeqCst), 1);
        assert!(h.requested_k.lock().unwrap().is_empty());
    }

    #[test]
    fn retrieval_failure_is_retried_then_reported() {
        let h = Setup {
            index_fails: true,
            retry: instant_retry(2),
            ..Setup::default()
        }
        .build();

        let err = h.engine.search("budget?", 3, None).unwrap_err();

        assert!(matches!(err, Error::Retrieval(_)));
        assert_eq!(*h.requested_k.lock().unwrap(), vec![6, 6]);
    }

    #[test]
    fn retrieval_failure_is_not_an_empty_result() {
        let h = Setup {
            index_fails: true,
            ..Setup::default()
        }
        .build();
        let err = h.engine.search("budget?", 3, None).unwrap_err();
        assert!(matches!(err, Error::Retrieval(_)));
        assert_eq!(h.rerank_calls.load(Ordering::SeqCst), 0);
        assert!(h.engine.cache().is_empty());
    }

    #[test]
    fn mismatched_rerank_batch_is_an_error() {
        let h = Setup {
            scorer_truncates: true,
            ..Setup::default()
        }
        .build();
        let err = h.engine.search("budget?", 3, None).unwrap_err();
        assert!(matches!(err, Error::Rerank(_)));
        assert!(h.engine.cache().is_empty());
    }

    #[test]
    fn non_finite_rerank_score_is_an_error_and_not_cached() {
        for bad in [f32::NAN, f32::INFINITY, f32::NEG_INFINITY] {
            let h = Setup {
                candidates: vec![("approved", 1, 0.9), ("garbled", 1, bad)],
                ..Setup::default()
            }
            .build();

            let err = h.engine.search("budget?", 2, None).unwrap_err();

            assert!(matches!(err, Error::Rerank(_)), "score {bad}");
            assert!(h.engine.cache().is_empty());
            assert!(ResultCache::open(h.engine.cache().path()).is_ok());
        }
    }

    #[test]
    fn invalid_requests_are_rejected_before_any_work() {
        let h = Setup::default().build();
        assert!(matches!(
            h.engine.search("   ", 3, None),
            Err(Error::InvalidQuery(_))
        ));
        assert!(matches!(
            h.engine.search("budget?", 0, None),
            Err(Error::InvalidQuery(_))
        ));
        assert_eq!(h.embed_calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn cached_results_survive_engine_restart() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("cache.json");
        let expected = vec![ScoredChunk {
            chunk: "from a previous run".to_string(),
            metadata: meta(9),
            score: 4.5,
        }];
        ResultCache::open(&path)
            .unwrap()
            .set(SearchRequest::new("budget?").top_k(3).fingerprint().as_str(), expected.clone())
            .unwrap();

        let h = Setup::default().build();
        let engine = SearchEngine::new(
            Box::new(FakeEmbedder {
                calls: Arc::clone(&h.embed_calls),
                failures: usize::MAX,
                error: offline,
            }),
            Box::new(FakeIndex {
                candidates: vec![],
                requested_k: Arc::clone(&h.requested_k),
                fail: true,
            }),
            Box::new(FakeScorer {
                scores: HashMap::new(),
                calls: Arc::clone(&h.rerank_calls),
                truncate_output: false,
            }),
            ResultCache::open(&path).unwrap(),
        );

        assert_eq!(engine.search("budget?", 3, None).unwrap(), expected);
        assert_eq!(h.embed_calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn preview_cuts_on_char_boundary() {
        assert_eq!(preview("héllo", 2), "hé...");
        assert_eq!(preview("short", 10), "short");
    }
}
