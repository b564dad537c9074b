use std::fmt;

/// A corpus-unique chunk identifier derived from
/// (thread_id, source_row, chunk_index).
///
/// Rendered as `"{thread_id}_{row}_{chunk}"`, which is also the key used
/// in the vector store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChunkId {
    pub thread_id: u64,
    /// Index of the source email row within the ingested batch.
    pub row: usize,
    /// Index of the chunk within its email body.
    pub chunk: usize,
}

impl ChunkId {
    pub fn new(thread_id: u64, row: usize, chunk: usize) -> Self {
        Self {
            thread_id,
            row,
            chunk,
        }
    }
}

impl fmt::Display for ChunkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}_{}", self.thread_id, self.row, self.chunk)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_joins_with_underscores() {
        let id = ChunkId::new(42, 7, 3);
        assert_eq!(id.to_string(), "42_7_3");
    }

    #[test]
    fn different_rows_differ() {
        let a = ChunkId::new(5, 1, 0);
        let b = ChunkId::new(5, 2, 0);
        assert_ne!(a.to_string(), b.to_string());
    }

    #[test]
    fn ids_sort_by_thread_then_row_then_chunk() {
        let mut ids = vec![
            ChunkId::new(2, 0, 0),
            ChunkId::new(1, 3, 1),
            ChunkId::new(1, 3, 0),
        ];
        ids.sort();
        assert_eq!(
            ids,
            vec![
                ChunkId::new(1, 3, 0),
                ChunkId::new(1, 3, 1),
                ChunkId::new(2, 0, 0),
            ]
        );
    }
}
