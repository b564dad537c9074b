//! threadsearch - semantic search and question answering over email threads.
//!
//! Emails are cleaned, split into overlapping word windows and stored as
//! dense vectors in a local [redb](https://github.com/cberner/redb) store.
//! A query is embedded, the nearest chunks are over-fetched, every candidate
//! is rescored in one batch with a
//! [ColBERT](https://github.com/stanford-futuredata/ColBERT) late-interaction
//! scorer, and the best `top_k` are returned and cached on disk.
//!
//! # Quick start
//!
//! ```no_run
//! use threadsearch::{ConfigDb, DataDir, SearchEngine, Settings};
//! use threadsearch::settings::Overrides;
//!
//! let data_dir = DataDir::resolve(None).unwrap();
//! let config_db = ConfigDb::open(&data_dir.config_db()).unwrap();
//! let settings = Settings::resolve(&Overrides::default(), &config_db).unwrap();
//!
//! let engine = SearchEngine::open(&data_dir, &settings).unwrap();
//! let results = engine
//!     .search("What was decided about the Q2 budget?", 5, None)
//!     .unwrap();
//! for r in &results {
//!     println!("{:.3} thread {}: {}", r.score, r.metadata.thread_id, r.chunk);
//! }
//! ```

pub mod cache;
pub mod chunk_id;
pub mod chunking;
pub mod cli;
pub mod config_db;
pub mod data_dir;
pub mod embedder;
pub mod error;
pub mod generation;
pub mod ingestion;
pub mod mcp;
pub mod model_manager;
pub mod reranker;
pub mod retry;
pub mod search;
pub mod settings;
pub mod vector_store;

pub use cache::{Fingerprint, ResultCache};
pub use chunk_id::ChunkId;
pub use config_db::ConfigDb;
pub use data_dir::DataDir;
pub use error::{Error, Result};
pub use model_manager::ModelManager;
pub use search::{ScoredChunk, SearchEngine, SearchRequest};
pub use settings::Settings;
pub use vector_store::{Collection, VectorDb};
