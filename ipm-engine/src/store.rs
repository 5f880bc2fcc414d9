//! Durable record store.
//!
//! Keyed JSON documents for idempotency markers plus append-only JSONL
//! streams for error records. [`FileStore`] keeps one file per key under the
//! state directory and replaces it atomically; [`MemoryStore`] backs tests
//! and mock runs.

use serde::Serialize;
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store I/O on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("record {key} is not valid JSON: {source}")]
    Decode {
        key: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("record {key} could not be encoded: {source}")]
    Encode {
        key: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Raw key/value and stream operations.
pub trait RecordStore: Send + Sync {
    fn get_raw(&self, key: &str) -> Result<Option<String>, StoreError>;
    fn put_raw(&self, key: &str, value: &str) -> Result<(), StoreError>;
    fn delete(&self, key: &str) -> Result<(), StoreError>;
    /// Keys starting with `prefix`.
    fn keys(&self, prefix: &str) -> Result<Vec<String>, StoreError>;
    fn append_line(&self, stream: &str, line: &str) -> Result<(), StoreError>;
    fn read_lines(&self, stream: &str) -> Result<Vec<String>, StoreError>;
}

/// Typed helpers over any [`RecordStore`].
pub trait RecordStoreExt: RecordStore {
    fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, StoreError> {
        self.get_raw(key)?
            .map(|raw| {
                serde_json::from_str(&raw).map_err(|source| StoreError::Decode {
                    key: key.to_string(),
                    source,
                })
            })
            .transpose()
    }

    fn put<T: Serialize>(&self, key: &str, value: &T) -> Result<(), StoreError> {
        let raw = serde_json::to_string_pretty(value).map_err(|source| StoreError::Encode {
            key: key.to_string(),
            source,
        })?;
        self.put_raw(key, &raw)
    }

    fn append<T: Serialize>(&self, stream: &str, record: &T) -> Result<(), StoreError> {
        let line = serde_json::to_string(record).map_err(|source| StoreError::Encode {
            key: stream.to_string(),
            source,
        })?;
        self.append_line(stream, &line)
    }

    /// Decode every line of `stream`, skipping lines that do not parse.
    fn read_stream<T: DeserializeOwned>(&self, stream: &str) -> Result<Vec<T>, StoreError> {
        Ok(self
            .read_lines(stream)?
            .into_iter()
            .filter(|line| !line.trim().is_empty())
            .filter_map(|line| match serde_json::from_str(&line) {
                Ok(record) => Some(record),
                Err(e) => {
                    warn!(stream, "Skipping invalid record line: {}", e);
                    None
                }
            })
            .collect())
    }
}

impl<S: RecordStore + ?Sized> RecordStoreExt for S {}

// ── File store ──────────────────────────────────────────────────────────

/// One JSON file per key under a root directory.
#[derive(Debug, Clone)]
pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        fs::create_dir_all(&root).map_err(|source| StoreError::Io {
            path: root.clone(),
            source,
        })?;
        debug!("Opened record store at {:?}", root);
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn key_path(&self, key: &str) -> PathBuf {
        let mut path = self.root.clone();
        for segment in key.split('/').filter(|s| !s.is_empty() && *s != "." && *s != "..") {
            path.push(segment);
        }
        path.set_extension("json");
        path
    }

    fn stream_path(&self, stream: &str) -> PathBuf {
        self.root.join(format!("{stream}.jsonl"))
    }

    fn collect_keys(&self, dir: &Path, prefix: &str, out: &mut Vec<String>) -> std::io::Result<()> {
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            let path = entry.path();
            if entry.file_type()?.is_dir() {
                self.collect_keys(&path, prefix, out)?;
            } else if path.extension().is_some_and(|e| e == "json")
                && let Ok(rel) = path.with_extension("").strip_prefix(&self.root)
            {
                let key = rel
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy())
                    .collect::<Vec<_>>()
                    .join("/");
                if key.starts_with(prefix) {
                    out.push(key);
                }
            }
        }
        Ok(())
    }
}

impl RecordStore for FileStore {
    fn get_raw(&self, key: &str) -> Result<Option<String>, StoreError> {
        let path = self.key_path(key);
        match fs::read_to_string(&path) {
            Ok(raw) => Ok(Some(raw)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(source) => Err(StoreError::Io { path, source }),
        }
    }

    fn put_raw(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let path = self.key_path(key);
        let io_err = |source| StoreError::Io {
            path: path.clone(),
            source,
        };
        let dir = path.parent().unwrap_or(&self.root);
        fs::create_dir_all(dir).map_err(io_err)?;

        let mut tmp = tempfile::NamedTempFile::new_in(dir).map_err(io_err)?;
        tmp.write_all(value.as_bytes()).map_err(io_err)?;
        tmp.as_file().sync_all().map_err(io_err)?;
        tmp.persist(&path).map_err(|e| io_err(e.error))?;
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<(), StoreError> {
        let path = self.key_path(key);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(StoreError::Io { path, source }),
        }
    }

    fn keys(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let mut keys = Vec::new();
        self.collect_keys(&self.root, prefix, &mut keys)
            .map_err(|source| StoreError::Io {
                path: self.root.clone(),
                source,
            })?;
        keys.sort();
        Ok(keys)
    }

    fn append_line(&self, stream: &str, line: &str) -> Result<(), StoreError> {
        let path = self.stream_path(stream);
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|source| StoreError::Io {
                path: path.clone(),
                source,
            })?;
        writeln!(file, "{line}")
            .and_then(|()| file.flush())
            .map_err(|source| StoreError::Io { path, source })
    }

    fn read_lines(&self, stream: &str) -> Result<Vec<String>, StoreError> {
        let path = self.stream_path(stream);
        let file = match File::open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => return Err(StoreError::Io { path, source }),
        };
        BufReader::new(file)
            .lines()
            .collect::<Result<Vec<_>, _>>()
            .map_err(|source| StoreError::Io { path, source })
    }
}

// ── Memory store ────────────────────────────────────────────────────────

#[derive(Debug, Default)]
pub struct MemoryStore {
    records: Mutex<HashMap<String, String>>,
    streams: Mutex<HashMap<String, Vec<String>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn records(&self) -> MutexGuard<'_, HashMap<String, String>> {
        self.records.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn streams(&self) -> MutexGuard<'_, HashMap<String, Vec<String>>> {
        self.streams.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl RecordStore for MemoryStore {
    fn get_raw(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self.records().get(key).cloned())
    }

    fn put_raw(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.records().insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.records().remove(key);
        Ok(())
    }

    fn keys(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let mut keys: Vec<String> = self
            .records()
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect();
        keys.sort();
        Ok(keys)
    }

    fn append_line(&self, stream: &str, line: &str) -> Result<(), StoreError> {
        self.streams()
            .entry(stream.to_string())
            .or_default()
            .push(line.to_string());
        Ok(())
    }

    fn read_lines(&self, stream: &str) -> Result<Vec<String>, StoreError> {
        Ok(self.streams().get(stream).cloned().unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Doc {
        stage: u32,
    }

    #[test]
    fn test_file_store_round_trips_and_overwrites() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::open(dir.path()).unwrap();

        store.put("marker/abc/cell", &Doc { stage: 1 }).unwrap();
        store.put("marker/abc/cell", &Doc { stage: 2 }).unwrap();
        assert_eq!(store.get::<Doc>("marker/abc/cell").unwrap(), Some(Doc { stage: 2 }));
        assert!(dir.path().join("marker/abc/cell.json").exists());

        assert_eq!(store.keys("marker/").unwrap(), vec!["marker/abc/cell".to_string()]);
        store.delete("marker/abc/cell").unwrap();
        store.delete("marker/abc/cell").unwrap();
        assert_eq!(store.get::<Doc>("marker/abc/cell").unwrap(), None);
    }

    #[test]
    fn test_file_store_keys_cannot_escape_root() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::open(dir.path().join("state")).unwrap();
        store.put("../../etc/x", &Doc { stage: 1 }).unwrap();
        assert!(dir.path().join("state/etc/x.json").exists());
    }

    #[test]
    fn test_corrupt_record_is_a_decode_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::open(dir.path()).unwrap();
        store.put_raw("marker/x", "{not json").unwrap();
        assert!(matches!(
            store.get::<Doc>("marker/x"),
            Err(StoreError::Decode { .. })
        ));
    }

    #[test]
    fn test_stream_skips_invalid_lines() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::open(dir.path()).unwrap();
        store.append("errors", &Doc { stage: 1 }).unwrap();
        store.append_line("errors", "garbage").unwrap();
        store.append("errors", &Doc { stage: 3 }).unwrap();

        let docs: Vec<Doc> = store.read_stream("errors").unwrap();
        assert_eq!(docs, vec![Doc { stage: 1 }, Doc { stage: 3 }]);
        assert!(store.read_stream::<Doc>("missing").unwrap().is_empty());
    }

    #[test]
    fn test_memory_store_behaves_like_file_store() {
        let store = MemoryStore::new();
        store.put("a/1", &Doc { stage: 1 }).unwrap();
        store.put("b/1", &Doc { stage: 2 }).unwrap();
        assert_eq!(store.keys("a/").unwrap(), vec!["a/1".to_string()]);
        store.append("errors", &Doc { stage: 9 }).unwrap();
        assert_eq!(store.read_stream::<Doc>("errors").unwrap(), vec![Doc { stage: 9 }]);
    }
}
