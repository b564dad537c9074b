//! Persistent result cache.
//!
//! Maps a request [`Fingerprint`] to the ranked results computed for it.
//! The whole map lives in memory and is written through to a pretty-printed
//! JSON object on every [`ResultCache::set`]: the file is rewritten in full
//! into a sibling temp file, fsynced, then renamed over the original, so a
//! reader never observes a half-written cache. The full rewrite is only
//! acceptable while the cache stays small.

use std::{
    collections::BTreeMap,
    fmt,
    fs,
    io::Write,
    path::{Path, PathBuf},
    sync::{Mutex, MutexGuard, PoisonError},
};

use crate::{
    error::{Error, Result},
    search::ScoredChunk,
};

const FINGERPRINT_DOMAIN: &[u8] = b"threadsearch.fingerprint.v1";

/// A content-addressed cache key for one search request.
///
/// Covers the literal query text, `top_k` and the thread filter, so a
/// request for five results is never answered by an entry computed for
/// three. Integers are hashed as fixed-width little-endian values, which
/// keeps keys stable across platforms and restarts.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn new(query: &str, top_k: usize, thread_id: Option<u64>) -> Self {
        let mut hasher = blake3::Hasher::new();
        hasher.update(FINGERPRINT_DOMAIN);
        hasher.update(&(query.len() as u64).to_le_bytes());
        hasher.update(query.as_bytes());
        hasher.update(&(top_k as u64).to_le_bytes());
        match thread_id {
            Some(id) => {
                hasher.update(&[1]);
                hasher.update(&id.to_le_bytes());
            }
            None => {
                hasher.update(&[0]);
            }
        }
        Self(hasher.finalize().to_hex().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

type Entries = BTreeMap<String, Vec<ScoredChunk>>;

pub struct ResultCache {
    path: PathBuf,
    entries: Mutex<Entries>,
}

impl ResultCache {
    /// Load the cache file at `path`.
    ///
    /// A missing file yields an empty cache. An unreadable file is a
    /// [`Error::CacheIo`]; a file that does not parse is
    /// [`Error::CacheCorrupt`] and is left untouched.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent).map_err(|e| cache_io(parent, e))?;
        }

        let entries: Entries = match fs::read(path) {
            Ok(bytes) => serde_json::from_slice(&bytes).map_err(|source| {
                Error::CacheCorrupt {
                    path: path.to_path_buf(),
                    source,
                }
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!(path = %path.display(), "no result cache yet, starting empty");
                Entries::new()
            }
            Err(e) => return Err(cache_io(path, e)),
        };

        tracing::debug!(entries = entries.len(), path = %path.display(), "loaded result cache");

        Ok(Self {
            path: path.to_path_buf(),
            entries: Mutex::new(entries),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn contains(&self, fingerprint: &str) -> bool {
        self.lock().contains_key(fingerprint)
    }

    /// The exact value stored under `fingerprint`, if any.
    pub fn get(&self, fingerprint: &str) -> Option<Vec<ScoredChunk>> {
        self.lock().get(fingerprint).cloned()
    }

    /// Insert or overwrite an entry and persist the whole cache before
    /// returning.
    ///
    /// If persisting fails the in-memory entry is restored to its previous
    /// state.
    pub fn set(&self, fingerprint: &str, value: Vec<ScoredChunk>) -> Result<()> {
        let mut entries = self.lock();
        let previous = entries.insert(fingerprint.to_string(), value);

        if let Err(e) = self.persist(&entries) {
            match previous {
                Some(old) => entries.insert(fingerprint.to_string(), old),
                None => entries.remove(fingerprint),
            };
            return Err(e);
        }
        Ok(())
    }

    pub fn remove(&self, fingerprint: &str) -> Result<bool> {
        let mut entries = self.lock();
        let Some(old) = entries.remove(fingerprint) else {
            return Ok(false);
        };

        if let Err(e) = self.persist(&entries) {
            entries.insert(fingerprint.to_string(), old);
            return Err(e);
        }
        Ok(true)
    }

    /// Drop every entry. Returns how many were removed.
    pub fn clear(&self) -> Result<usize> {
        let mut entries = self.lock();
        let removed = entries.len();
        let old = std::mem::take(&mut *entries);

        if let Err(e) = self.persist(&entries) {
            *entries = old;
            return Err(e);
        }
        Ok(removed)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> MutexGuard<'_, Entries> {
        // Entries are only replaced wholesale, so a poisoned map is intact.
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn persist(&self, entries: &Entries) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(entries)?;
        let tmp = self.path.with_extension("json.tmp");

        let mut file = fs::File::create(&tmp).map_err(|e| cache_io(&tmp, e))?;
        file.write_all(&bytes).map_err(|e| cache_io(&tmp, e))?;
        file.sync_all().map_err(|e| cache_io(&tmp, e))?;
        drop(file);

        fs::rename(&tmp, &self.path).map_err(|e| cache_io(&self.path, e))?;
        Ok(())
    }
}

fn cache_io(path: &Path, source: std::io::Error) -> Error {
    Error::CacheIo {
        path: path.to_path_buf(),
        source,
    }
}

impl fmt::Debug for ResultCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResultCache")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}
