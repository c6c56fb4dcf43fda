//! Durable per-book client storage.
//!
//! Files are stored under the cache directory using a hash of the book id as
//! the directory name to avoid filesystem issues. Each record is a small TOML
//! file. Writes are synchronous and last-write-wins.

use crate::error::StorageError;
use crate::model::CharacterRecord;
use crate::navigation::Cursor;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{debug, warn};

const POSITION_KEY: &str = "position";
const CHARACTERS_KEY: &str = "characters";

pub trait KeyValueStore: Send {
    fn read(&self, book_id: &str, key: &str) -> Option<String>;
    fn write(&self, book_id: &str, key: &str, contents: &str) -> Result<(), StorageError>;
}

impl<T: KeyValueStore + Sync> KeyValueStore for std::sync::Arc<T> {
    fn read(&self, book_id: &str, key: &str) -> Option<String> {
        (**self).read(book_id, key)
    }

    fn write(&self, book_id: &str, key: &str, contents: &str) -> Result<(), StorageError> {
        (**self).write(book_id, key, contents)
    }
}

/// TOML files under `<root>/<sha256(book_id)>/<key>.toml`.
#[derive(Debug, Clone)]
pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn hash_dir(&self, book_id: &str) -> PathBuf {
        let mut hasher = Sha256::new();
        hasher.update(book_id.as_bytes());
        let hash = format!("{:x}", hasher.finalize());
        self.root.join(hash)
    }

    fn record_path(&self, book_id: &str, key: &str) -> PathBuf {
        self.hash_dir(book_id).join(format!("{key}.toml"))
    }
}

impl KeyValueStore for FileStore {
    fn read(&self, book_id: &str, key: &str) -> Option<String> {
        fs::read_to_string(self.record_path(book_id, key)).ok()
    }

    fn write(&self, book_id: &str, key: &str, contents: &str) -> Result<(), StorageError> {
        let path = self.record_path(book_id, key);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|source| io_error(parent, source))?;
        }
        fs::write(&path, contents).map_err(|source| io_error(&path, source))
    }
}

fn io_error(path: &Path, source: std::io::Error) -> StorageError {
    StorageError::Io {
        path: path.display().to_string(),
        source,
    }
}

/// Volatile store for tests and hosts without a writable disk.
#[derive(Debug, Default)]
pub struct MemoryStore {
    records: Mutex<HashMap<(String, String), String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyValueStore for MemoryStore {
    fn read(&self, book_id: &str, key: &str) -> Option<String> {
        let records = self.records.lock().ok()?;
        records
            .get(&(book_id.to_string(), key.to_string()))
            .cloned()
    }

    fn write(&self, book_id: &str, key: &str, contents: &str) -> Result<(), StorageError> {
        if let Ok(mut records) = self.records.lock() {
            records.insert(
                (book_id.to_string(), key.to_string()),
                contents.to_string(),
            );
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
struct PositionEntry {
    chapter_index: usize,
    page_index: usize,
    paragraph_index: usize,
}

/// Monotonic record of the characters revealed for one book.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CharacterHistory {
    #[serde(default)]
    pub discovered: Vec<String>,
    #[serde(default)]
    pub details: BTreeMap<String, CharacterRecord>,
    #[serde(default)]
    pub last_checked_unix_ms: u64,
}

/// Load the saved reading position for a book, if present.
pub fn load_position(store: &dyn KeyValueStore, book_id: &str) -> Option<Cursor> {
    let data = store.read(book_id, POSITION_KEY)?;
    let entry: PositionEntry = toml::from_str(&data).ok()?;
    Some(Cursor {
        chapter_index: entry.chapter_index,
        page_index: entry.page_index,
        paragraph_index: entry.paragraph_index,
    })
}

/// Persist the reading position. Errors are logged and ignored so navigation
/// never fails on storage.
pub fn save_position(store: &dyn KeyValueStore, book_id: &str, cursor: &Cursor) {
    let entry = PositionEntry {
        chapter_index: cursor.chapter_index,
        page_index: cursor.page_index,
        paragraph_index: cursor.paragraph_index,
    };
    persist(store, book_id, POSITION_KEY, &entry);
}

pub fn load_character_history(store: &dyn KeyValueStore, book_id: &str) -> CharacterHistory {
    store
        .read(book_id, CHARACTERS_KEY)
        .and_then(|data| toml::from_str(&data).ok())
        .unwrap_or_default()
}

pub fn save_character_history(store: &dyn KeyValueStore, book_id: &str, history: &CharacterHistory) {
    persist(store, book_id, CHARACTERS_KEY, history);
}

fn persist<T: Serialize>(store: &dyn KeyValueStore, book_id: &str, key: &str, value: &T) {
    let result = toml::to_string(value)
        .map_err(StorageError::from)
        .and_then(|contents| store.write(book_id, key, &contents));
    match result {
        Ok(()) => debug!(book_id, key, "Persisted session record"),
        Err(err) => warn!(book_id, key, "Failed to persist session record: {err}"),
    }
}
