use std::{path::Path, sync::Arc};

use rayon::prelude::*;
use redb::{Database, ReadableDatabase, ReadableTable, TableDefinition};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Header size: 4 bytes dimension + 8 bytes thread id.
const HEADER_SIZE: usize = 12;

/// Metadata attached to every chunk at ingestion time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkMetadata {
    pub thread_id: u64,
    pub subject: String,
    #[serde(rename = "from")]
    pub sender: String,
    pub timestamp: String,
}

/// Metadata predicate applied before nearest-neighbor ranking.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Where {
    ThreadId(u64),
}

impl Where {
    fn accepts(&self, thread_id: u64) -> bool {
        match self {
            Where::ThreadId(wanted) => *wanted == thread_id,
        }
    }
}

/// Nearest-neighbor results, one inner list per query embedding.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryResult {
    pub ids: Vec<Vec<String>>,
    pub documents: Vec<Vec<String>>,
    pub metadatas: Vec<Vec<ChunkMetadata>>,
    pub distances: Vec<Vec<f32>>,
}

/// A candidate chunk returned by the recall stage, in retrieval order.
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    pub id: String,
    pub text: String,
    pub metadata: ChunkMetadata,
}

/// Nearest-neighbor lookup over stored chunk vectors.
pub trait VectorIndex: Send + Sync {
    fn query(
        &self,
        vector: &[f32],
        k: usize,
        filter: Option<&Where>,
    ) -> Result<Vec<Candidate>>;

    /// Whether the index holds no vectors at all. Lets callers skip
    /// embedding a query that cannot match anything.
    fn is_empty(&self) -> Result<bool> {
        Ok(false)
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct StoredRecord {
    document: String,
    metadata: ChunkMetadata,
}

/// A redb-backed store of named chunk collections.
///
/// Each collection `name` owns two tables:
/// - `{name}.vectors`: chunk id -> 4 bytes dimension D (u32 LE),
///   8 bytes thread id (u64 LE), D * 4 bytes f32 LE values
/// - `{name}.records`: chunk id -> JSON `{document, metadata}`
#[derive(Clone)]
pub struct VectorDb {
    db: Arc<Database>,
}

impl VectorDb {
    pub fn open(path: &Path) -> Result<Self> {
        let db = Database::create(path).map_err(redb::Error::from)?;
        Ok(Self { db: Arc::new(db) })
    }

    /// Open a collection, creating its tables on first use.
    pub fn get_or_create_collection(&self, name: &str) -> Result<Collection> {
        if name.trim().is_empty() {
            return Err(Error::Config("collection name cannot be empty".into()));
        }

        let collection = Collection {
            db: Arc::clone(&self.db),
            name: name.to_string(),
            vectors_table: format!("{name}.vectors"),
            records_table: format!("{name}.records"),
        };

        let txn = self.db.begin_write()?;
        txn.open_table(collection.vectors())?;
        txn.open_table(collection.records())?;
        txn.commit()?;

        Ok(collection)
    }
}

impl std::fmt::Debug for VectorDb {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VectorDb").finish_non_exhaustive()
    }
}

#[derive(Clone)]
pub struct Collection {
    db: Arc<Database>,
    name: String,
    vectors_table: String,
    records_table: String,
}

impl Collection {
    pub fn name(&self) -> &str {
        &self.name
    }

    fn vectors(&self) -> TableDefinition<'_, &'static str, &'static [u8]> {
        TableDefinition::new(&self.vectors_table)
    }

    fn records(&self) -> TableDefinition<'_, &'static str, &'static [u8]> {
        TableDefinition::new(&self.records_table)
    }

    /// Number of chunks stored in the collection.
    pub fn count(&self) -> Result<usize> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(self.vectors())?;
        let mut count = 0;
        for entry in table.iter()? {
            entry?;
            count += 1;
        }
        Ok(count)
    }

    pub fn contains(&self, id: &str) -> Result<bool> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(self.vectors())?;
        Ok(table.get(id)?.is_some())
    }

    /// Add chunks in a single transaction.
    ///
    /// All four slices must have the same length, every embedding must have
    /// the collection's dimension, and ids must not already exist: chunks
    /// are write-once.
    pub fn add(
        &self,
        documents: &[String],
        embeddings: &[Vec<f32>],
        metadatas: &[ChunkMetadata],
        ids: &[String],
    ) -> Result<()> {
        let n = ids.len();
        if documents.len() != n || embeddings.len() != n || metadatas.len() != n
        {
            return Err(Error::Store(format!(
                "mismatched batch: {} documents, {} embeddings, {} metadatas, {n} ids",
                documents.len(),
                embeddings.len(),
                metadatas.len()
            )));
        }
        if n == 0 {
            return Ok(());
        }

        let txn = self.db.begin_write()?;
        {
            let mut vectors = txn.open_table(self.vectors())?;
            let mut records = txn.open_table(self.records())?;

            let mut dimension = match vectors.first()? {
                Some((_, v)) => decode_header(v.value()).map(|(d, _)| d),
                None => None,
            };

            for (((id, document), embedding), metadata) in
                ids.iter().zip(documents).zip(embeddings).zip(metadatas)
            {
                if embedding.is_empty() {
                    return Err(Error::Store(format!(
                        "empty embedding for chunk {id}"
                    )));
                }
                match dimension {
                    Some(d) if d != embedding.len() => {
                        return Err(Error::Store(format!(
                            "chunk {id} has dimension {}, collection '{}' has {d}",
                            embedding.len(),
                            self.name
                        )));
                    }
                    Some(_) => {}
                    None => dimension = Some(embedding.len()),
                }
                if vectors.get(id.as_str())?.is_some() {
                    return Err(Error::Store(format!(
                        "chunk {id} already exists in collection '{}'",
                        self.name
                    )));
                }

                let bytes = encode_vector(metadata.thread_id, embedding);
                vectors.insert(id.as_str(), bytes.as_slice())?;

                let record = serde_json::to_vec(&StoredRecord {
                    document: document.clone(),
                    metadata: metadata.clone(),
                })?;
                records.insert(id.as_str(), record.as_slice())?;
            }
        }
        txn.commit()?;
        Ok(())
    }

    /// Nearest neighbors by cosine distance, ascending.
    ///
    /// Equal distances keep chunk id order. Returns one inner list per
    /// query embedding.
    pub fn query(
        &self,
        query_embeddings: &[Vec<f32>],
        n_results: usize,
        filter: Option<&Where>,
    ) -> Result<QueryResult> {
        let txn = self.db.begin_read()?;
        let vectors = txn.open_table(self.vectors())?;
        let records = txn.open_table(self.records())?;

        let mut stored = Vec::new();
        for entry in vectors.iter()? {
            let (key, value) = entry?;
            let (thread_id, vector) = decode_vector(value.value()).ok_or_else(|| {
                Error::Retrieval(format!("corrupt vector for chunk {}", key.value()))
            })?;
            if filter.is_some_and(|f| !f.accepts(thread_id)) {
                continue;
            }
            stored.push((key.value().to_string(), vector));
        }

        let mut result = QueryResult::default();
        for query in query_embeddings {
            let mut scored: Vec<(usize, f32)> = stored
                .par_iter()
                .enumerate()
                .map(|(i, (id, vector))| {
                    if vector.len() != query.len() {
                        return Err(Error::Retrieval(format!(
                            "query has dimension {}, chunk {id} has {}",
                            query.len(),
                            vector.len()
                        )));
                    }
                    Ok((i, cosine_distance(query, vector)))
                })
                .collect::<Result<_>>()?;

            scored.sort_by(|a, b| {
                a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal)
            });
            scored.truncate(n_results);

            let mut ids = Vec::with_capacity(scored.len());
            let mut documents = Vec::with_capacity(scored.len());
            let mut metadatas = Vec::with_capacity(scored.len());
            let mut distances = Vec::with_capacity(scored.len());

            for (i, distance) in scored {
                let id = &stored[i].0;
                let guard = records.get(id.as_str())?.ok_or_else(|| {
                    Error::Retrieval(format!("missing record for chunk {id}"))
                })?;
                let record: StoredRecord = serde_json::from_slice(guard.value())
                    .map_err(|e| {
                        Error::Retrieval(format!("corrupt record for chunk {id}: {e}"))
                    })?;

                ids.push(id.clone());
                documents.push(record.document);
                metadatas.push(record.metadata);
                distances.push(distance);
            }

            result.ids.push(ids);
            result.documents.push(documents);
            result.metadatas.push(metadatas);
            result.distances.push(distances);
        }

        Ok(result)
    }
}

impl VectorIndex for Collection {
    fn is_empty(&self) -> Result<bool> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(self.vectors())?;
        Ok(table.first()?.is_none())
    }

    fn query(
        &self,
        vector: &[f32],
        k: usize,
        filter: Option<&Where>,
    ) -> Result<Vec<Candidate>> {
        let result = Collection::query(self, &[vector.to_vec()], k, filter)
            .map_err(|e| match e {
                Error::Retrieval(_) => e,
                other => Error::Retrieval(other.to_string()),
            })?;

        let QueryResult {
            ids,
            documents,
            metadatas,
            ..
        } = result;

        // Exactly one query embedding was submitted.
        let (Some(ids), Some(documents), Some(metadatas)) = (
            ids.into_iter().next(),
            documents.into_iter().next(),
            metadatas.into_iter().next(),
        ) else {
            return Err(Error::Retrieval(
                "vector store returned no result list".to_string(),
            ));
        };

        Ok(ids
            .into_iter()
            .zip(documents)
            .zip(metadatas)
            .map(|((id, text), metadata)| Candidate { id, text, metadata })
            .collect())
    }
}

impl std::fmt::Debug for Collection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Collection")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

fn encode_vector(thread_id: u64, vector: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(HEADER_SIZE + std::mem::size_of_val(vector));
    bytes.extend_from_slice(&(vector.len() as u32).to_le_bytes());
    bytes.extend_from_slice(&thread_id.to_le_bytes());
    bytes.extend_from_slice(bytemuck::cast_slice(vector));
    bytes
}

fn decode_header(bytes: &[u8]) -> Option<(usize, u64)> {
    let dimension = u32::from_le_bytes(bytes.get(0..4)?.try_into().ok()?);
    let thread_id = u64::from_le_bytes(bytes.get(4..HEADER_SIZE)?.try_into().ok()?);
    Some((dimension as usize, thread_id))
}

fn decode_vector(bytes: &[u8]) -> Option<(u64, Vec<f32>)> {
    let (dimension, thread_id) = decode_header(bytes)?;
    let body = &bytes[HEADER_SIZE..];
    if body.len() != dimension * 4 {
        return None;
    }
    // The value slice is not guaranteed to be 4-byte aligned.
    Some((thread_id, bytemuck::pod_collect_to_vec(body)))
}

fn cosine_distance(a: &[f32], b: &[f32]) -> f32 {
    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;
    for (x, y) in a.iter().zip(b) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return 1.0;
    }
    1.0 - dot / (norm_a.sqrt() * norm_b.sqrt())
}
