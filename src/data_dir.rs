//! On-disk layout.
//!
//! Everything threadsearch persists lives in one directory:
//!
//! ```text
//! <root>/
//!   config.redb    stored settings
//!   vectors.redb   chunk vectors, one table per collection
//!   cache.json     search results keyed by request fingerprint
//! ```

use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

pub const DATA_DIR_ENV_VAR: &str = "THREADSEARCH_DATA_DIR";

const CONFIG_FILE: &str = "config.redb";
const VECTORS_FILE: &str = "vectors.redb";
const CACHE_FILE: &str = "cache.json";

#[derive(Debug, Clone)]
pub struct DataDir {
    root: PathBuf,
}

impl DataDir {
    /// `--data-dir` wins, then `THREADSEARCH_DATA_DIR`, then
    /// `~/.local/share/threadsearch`. The directory is created if needed.
    pub fn resolve(explicit: Option<&Path>) -> Result<Self> {
        let from_env = std::env::var_os(DATA_DIR_ENV_VAR).map(PathBuf::from);
        let root = match choose_root(explicit, from_env) {
            Some(root) => root,
            None => xdg_data_home()?,
        };

        std::fs::create_dir_all(&root)
            .map_err(|_| Error::DataDir(root.clone()))?;

        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn config_db(&self) -> PathBuf {
        self.root.join(CONFIG_FILE)
    }

    pub fn vectors_db(&self) -> PathBuf {
        self.root.join(VECTORS_FILE)
    }

    pub fn cache_file(&self) -> PathBuf {
        self.root.join(CACHE_FILE)
    }
}

/// An empty `THREADSEARCH_DATA_DIR` counts as unset.
fn choose_root(
    explicit: Option<&Path>,
    from_env: Option<PathBuf>,
) -> Option<PathBuf> {
    explicit
        .map(Path::to_path_buf)
        .or_else(|| from_env.filter(|p| !p.as_os_str().is_empty()))
}

fn xdg_data_home() -> Result<PathBuf> {
    xdg::BaseDirectories::with_prefix("threadsearch")
        .get_data_home()
        .ok_or_else(|| Error::Config("could not determine XDG data home directory".into()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::ResultCache;

    #[test]
    fn explicit_path_beats_environment() {
        let chosen = choose_root(
            Some(Path::new("/srv/mail-index")),
            Some(PathBuf::from("/tmp/from-env")),
        );
        assert_eq!(chosen, Some(PathBuf::from("/srv/mail-index")));
    }

    #[test]
    fn empty_environment_value_falls_through() {
        assert_eq!(choose_root(None, Some(PathBuf::new())), None);
        assert_eq!(
            choose_root(None, Some(PathBuf::from("/tmp/from-env"))),
            Some(PathBuf::from("/tmp/from-env"))
        );
    }

    #[test]
    fn stores_share_one_directory() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = DataDir::resolve(Some(tmp.path())).unwrap();

        for path in [dir.config_db(), dir.vectors_db(), dir.cache_file()] {
            assert_eq!(path.parent(), Some(tmp.path()));
        }
        assert_eq!(dir.cache_file().extension().unwrap(), "json");
    }

    #[test]
    fn cache_lands_in_a_freshly_created_root() {
        let tmp = tempfile::tempdir().unwrap();
        let nested = tmp.path().join("mail").join("index");
        let dir = DataDir::resolve(Some(&nested)).unwrap();
        assert!(nested.is_dir());

        let cache = ResultCache::open(&dir.cache_file()).unwrap();
        cache.clear().unwrap();
        assert!(nested.join("cache.json").is_file());
    }
}
