use std::{
    fs::File,
    io::{BufRead, BufReader},
    path::Path,
};

use serde::{Deserialize, Serialize};

use crate::{
    chunk_id::ChunkId,
    chunking::{self, DEFAULT_MAX_WORDS, DEFAULT_OVERLAP},
    embedder::Embedder,
    error::{Error, Result},
    vector_store::{ChunkMetadata, Collection},
};

/// Number of chunks embedded and stored per transaction.
pub const DEFAULT_BATCH_SIZE: usize = 32;

/// One email as it appears in the input JSON Lines file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmailRecord {
    pub thread_id: u64,
    #[serde(default)]
    pub subject: String,
    #[serde(rename = "from", default)]
    pub sender: String,
    #[serde(default)]
    pub timestamp: String,
    pub body: String,
}

impl EmailRecord {
    fn metadata(&self) -> ChunkMetadata {
        ChunkMetadata {
            thread_id: self.thread_id,
            subject: self.subject.clone(),
            sender: self.sender.clone(),
            timestamp: self.timestamp.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IngestStats {
    /// Emails read from the input.
    pub emails: usize,
    /// Emails whose cleaned body produced no chunk.
    pub empty: usize,
    /// Chunks embedded and stored.
    pub added: usize,
    /// Chunks skipped because their id was already stored.
    pub existing: usize,
}

/// Read emails from a JSON Lines file. Blank lines are ignored.
pub fn read_jsonl(path: &Path) -> Result<Vec<EmailRecord>> {
    let file = File::open(path).map_err(|e| Error::NotFound {
        kind: "input file",
        name: format!("{} ({e})", path.display()),
    })?;

    let mut records = Vec::new();
    for (n, line) in BufReader::new(file).lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let record = serde_json::from_str(&line).map_err(|e| {
            Error::Config(format!("{}:{}: {e}", path.display(), n + 1))
        })?;
        records.push(record);
    }
    Ok(records)
}

struct PendingChunk {
    id: String,
    text: String,
    metadata: ChunkMetadata,
}

/// Clean, chunk, embed and store a batch of emails.
///
/// Each email's position in `records` becomes the row component of its
/// chunk ids, so ingesting the same file twice adds nothing new.
pub fn ingest_emails(
    records: &[EmailRecord],
    embedder: &dyn Embedder,
    collection: &Collection,
    batch_size: usize,
) -> Result<IngestStats> {
    let mut stats = IngestStats {
        emails: records.len(),
        ..IngestStats::default()
    };

    let mut pending = Vec::new();
    for (row, record) in records.iter().enumerate() {
        let cleaned = chunking::clean_email_body(&record.body);
        let chunks =
            chunking::chunk_words(&cleaned, DEFAULT_MAX_WORDS, DEFAULT_OVERLAP);
        if chunks.is_empty() {
            stats.empty += 1;
            continue;
        }

        for (chunk, text) in chunks.into_iter().enumerate() {
            let id = ChunkId::new(record.thread_id, row, chunk).to_string();
            if collection.contains(&id)? {
                stats.existing += 1;
                continue;
            }
            pending.push(PendingChunk {
                id,
                text,
                metadata: record.metadata(),
            });
        }
    }

    tracing::info!(
        emails = stats.emails,
        chunks = pending.len(),
        existing = stats.existing,
        collection = collection.name(),
        "embedding chunks"
    );

    for batch in pending.chunks(batch_size.max(1)) {
        let texts: Vec<String> = batch.iter().map(|c| c.text.clone()).collect();
        let embeddings = embedder.encode_batch(&texts)?;
        let ids: Vec<String> = batch.iter().map(|c| c.id.clone()).collect();
        let metadatas: Vec<ChunkMetadata> =
            batch.iter().map(|c| c.metadata.clone()).collect();

        collection.add(&texts, &embeddings, &metadatas, &ids)?;
        stats.added += batch.len();
        tracing::debug!(added = stats.added, total = pending.len(), "stored batch");
    }

    Ok(stats)
}
