use std::path::{Path, PathBuf};

pub(crate) const FRIENDS_CACHE_KEY: &str = "naier_friends_cache";
pub(crate) const LAST_READ_KEY: &str = "naier_last_read";

/// Plain-file key-value store under the app data dir: one JSON payload per
/// key. Read/write failures are debug-logged and treated as cache misses;
/// nothing here may interrupt conversation logic.
#[derive(Clone, Debug)]
pub(crate) struct LocalStore {
    dir: PathBuf,
}

impl LocalStore {
    pub(crate) fn new(data_dir: &str) -> Self {
        Self {
            dir: Path::new(data_dir).to_path_buf(),
        }
    }

    fn path(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{key}.json"))
    }

    pub(crate) fn get(&self, key: &str) -> Option<String> {
        match std::fs::read_to_string(self.path(key)) {
            Ok(s) => Some(s),
            Err(e) => {
                if e.kind() != std::io::ErrorKind::NotFound {
                    tracing::debug!(key, err = %e, "store read failed");
                }
                None
            }
        }
    }

    pub(crate) fn set(&self, key: &str, value: &str) {
        if let Err(e) = std::fs::write(self.path(key), value) {
            tracing::debug!(key, err = %e, "store write failed");
        }
    }

    #[allow(dead_code)]
    pub(crate) fn remove(&self, key: &str) {
        let _ = std::fs::remove_file(self.path(key));
    }
}
