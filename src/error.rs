use std::path::PathBuf;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("database error: {0}")]
    Redb(#[from] redb::Error),

    #[error("database storage error: {0}")]
    RedbStorage(#[from] redb::StorageError),

    #[error("database transaction error: {0}")]
    RedbTransaction(#[from] redb::TransactionError),

    #[error("database table error: {0}")]
    RedbTable(#[from] redb::TableError),

    #[error("database commit error: {0}")]
    RedbCommit(#[from] redb::CommitError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("model error: {0}")]
    Model(#[from] pylate_rs::ColbertError),

    #[error("failed to load model {model}: {reason}")]
    ModelLoad { model: String, reason: String },

    #[error("tensor error: {0}")]
    Tensor(#[from] candle_core::Error),

    #[error("embedding failed: {0}")]
    Embedding(String),

    #[error("retrieval failed: {0}")]
    Retrieval(String),

    #[error("rerank failed: {0}")]
    Rerank(String),

    #[error("vector store error: {0}")]
    Store(String),

    #[error("answer generation failed: {0}")]
    Generation(String),

    #[error("language model rejected the request ({status}): {body}")]
    Rejected { status: u16, body: String },

    #[error("cache I/O error at {path}: {source}")]
    CacheIo {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("cache file {path} is corrupt: {source}")]
    CacheCorrupt {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error("invalid query: {0}")]
    InvalidQuery(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("{kind} not found: {name}")]
    NotFound { kind: &'static str, name: String },

    #[error("data directory does not exist and could not be created: {0}")]
    DataDir(PathBuf),
}

impl Error {
    /// Whether a retry of the failed stage could plausibly succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::Embedding(_)
                | Error::Retrieval(_)
                | Error::Rerank(_)
                | Error::Generation(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stage_failures_are_transient() {
        assert!(Error::Embedding("reset".into()).is_transient());
        assert!(Error::Rerank("busy".into()).is_transient());
        assert!(Error::Generation("timeout".into()).is_transient());
    }

    #[test]
    fn model_load_and_bad_input_are_permanent() {
        let load = Error::ModelLoad {
            model: "/models/missing".into(),
            reason: "config.json not found".into(),
        };
        assert!(!load.is_transient());
        assert!(!Error::InvalidQuery("empty".into()).is_transient());
        assert!(
            !Error::Rejected {
                status: 401,
                body: "bad key".into()
            }
            .is_transient()
        );
    }
}
