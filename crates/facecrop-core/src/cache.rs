//! Durable face-detection cache.
//!
//! One JSON object on disk mapping a source image key to its
//! [`BoundingBox`]. A missing key means "never detected"; a key holding the
//! no-face sentinel means "detected, nothing found" and is authoritative.

use crate::types::BoundingBox;
use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("failed to read face cache {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("face cache {path} is malformed: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("failed to serialize face cache: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("failed to write face cache {path}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// In-memory snapshot of the face cache.
///
/// Keys are kept sorted so equal caches persist to identical files.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FaceCache {
    entries: BTreeMap<String, BoundingBox>,
}

impl FaceCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Read a snapshot from `path`. An absent file is an empty cache.
    pub fn load(path: &Path) -> Result<Self, CacheError> {
        let raw = match std::fs::read(path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "no face cache yet, starting empty");
                return Ok(Self::new());
            }
            Err(source) => {
                return Err(CacheError::Read {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };

        let entries = serde_json::from_slice(&raw).map_err(|source| CacheError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(Self { entries })
    }

    /// Keys from `keys` with no cached result, in the order given.
    pub fn missing(&self, keys: &[String]) -> Vec<String> {
        keys.iter()
            .filter(|key| !self.entries.contains_key(key.as_str()))
            .cloned()
            .collect()
    }

    /// Insert detection results. A key merged twice keeps the last value.
    pub fn merge<I>(&mut self, entries: I)
    where
        I: IntoIterator<Item = (String, BoundingBox)>,
    {
        self.entries.extend(entries);
    }

    pub fn get(&self, key: &str) -> Option<BoundingBox> {
        self.entries.get(key).copied()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Write the whole cache to `path`, replacing any previous snapshot.
    ///
    /// The snapshot goes to a temp file in the target directory first and is
    /// then renamed into place, so readers never see a half-written file.
    pub fn persist(&self, path: &Path) -> Result<(), CacheError> {
        let json = serde_json::to_vec_pretty(&self.entries)?;

        let write_err = |source| CacheError::Write {
            path: path.to_path_buf(),
            source,
        };

        let dir = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        std::fs::create_dir_all(&dir).map_err(write_err)?;

        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "faces.json".to_string());
        let tmp = dir.join(format!(".{file_name}.{}.tmp", uuid::Uuid::new_v4()));

        if let Err(e) = std::fs::write(&tmp, &json) {
            let _ = std::fs::remove_file(&tmp);
            return Err(write_err(e));
        }
        if let Err(e) = std::fs::rename(&tmp, path) {
            let _ = std::fs::remove_file(&tmp);
            return Err(write_err(e));
        }

        tracing::info!(path = %path.display(), entries = self.entries.len(), "face cache persisted");
        Ok(())
    }
}
