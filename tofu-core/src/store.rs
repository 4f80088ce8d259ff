//! Per-document state, one JSON object per document title.

use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

pub const PAGE_NUMBER_KEY: &str = "pageNumber";

const RECORD_EXTENSION: &str = "json";

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("failed to create state directory at {path:?}")]
    CreateRoot {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// The state remembered for one document.
///
/// Known keys get typed fields; everything else is carried in `extra` so a
/// load-modify-save cycle never drops data written by a newer version.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(from = "Map<String, Value>", into = "Map<String, Value>")]
pub struct DocumentRecord {
    pub page_number: Option<usize>,
    pub extra: Map<String, Value>,
}

impl From<Map<String, Value>> for DocumentRecord {
    fn from(mut map: Map<String, Value>) -> Self {
        let page_number = match map.get(PAGE_NUMBER_KEY).and_then(Value::as_u64) {
            Some(page) => {
                map.remove(PAGE_NUMBER_KEY);
                usize::try_from(page).ok()
            }
            None => None,
        };
        Self {
            page_number,
            extra: map,
        }
    }
}

impl From<DocumentRecord> for Map<String, Value> {
    fn from(record: DocumentRecord) -> Self {
        let mut map = record.extra;
        if let Some(page) = record.page_number {
            map.insert(PAGE_NUMBER_KEY.to_owned(), Value::from(page));
        }
        map
    }
}

impl DocumentRecord {
    /// Parses a stored record. Anything that is not a JSON object is an error.
    pub fn from_json(text: &str) -> serde_json::Result<Self> {
        serde_json::from_str(text)
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }

    pub fn is_empty(&self) -> bool {
        self.page_number.is_none() && self.extra.is_empty()
    }

    pub fn value(&self, key: &str) -> Option<Value> {
        if key == PAGE_NUMBER_KEY {
            if let Some(page) = self.page_number {
                return Some(Value::from(page));
            }
        }
        self.extra.get(key).cloned()
    }

    /// Returns the value under `key`, or `default` when it is absent or has a
    /// different shape than `T`.
    pub fn get<T: DeserializeOwned>(&self, key: &str, default: T) -> T {
        self.value(key)
            .and_then(|value| serde_json::from_value(value).ok())
            .unwrap_or(default)
    }

    pub fn set(&mut self, key: &str, value: Value) {
        if key == PAGE_NUMBER_KEY {
            if let Some(page) = value.as_u64().and_then(|p| usize::try_from(p).ok()) {
                self.page_number = Some(page);
                self.extra.remove(key);
                return;
            }
            self.page_number = None;
        }
        self.extra.insert(key.to_owned(), value);
    }
}

pub trait StateStore: Send + Sync {
    /// Never fails: a missing or unreadable record is an empty one.
    fn load(&self, title: &str) -> DocumentRecord;
    fn save(&self, title: &str, key: &str, value: Value) -> Result<()>;
}

pub struct FileStateStore {
    root: PathBuf,
}

impl FileStateStore {
    pub fn new(root: PathBuf) -> Result<Self, StoreError> {
        let store = Self { root };
        store.ensure_storage_root()?;
        Ok(store)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn ensure_storage_root(&self) -> Result<(), StoreError> {
        fs::create_dir_all(&self.root).map_err(|source| StoreError::CreateRoot {
            path: self.root.clone(),
            source,
        })
    }

    pub fn record_path(&self, title: &str) -> PathBuf {
        self.root
            .join(format!("{}.{}", record_file_stem(title), RECORD_EXTENSION))
    }

    fn read_record(&self, path: &Path) -> Result<Option<DocumentRecord>> {
        let text = match fs::read_to_string(path) {
            Ok(text) => text,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(err) => {
                return Err(err).with_context(|| format!("failed to read state file {:?}", path))
            }
        };
        let record = DocumentRecord::from_json(&text)
            .with_context(|| format!("failed to decode state file {:?}", path))?;
        Ok(Some(record))
    }

    fn write_record(&self, path: &Path, record: &DocumentRecord) -> Result<()> {
        let tmp = path.with_extension(format!("{}.tmp", RECORD_EXTENSION));
        let payload = record.to_json()?;
        let replaced = write_file(&tmp, payload.as_bytes()).and_then(|()| {
            fs::rename(&tmp, path)
                .with_context(|| format!("failed to replace state file {:?}", path))
        });
        if replaced.is_err() {
            if let Err(err) = fs::remove_file(&tmp) {
                if err.kind() != io::ErrorKind::NotFound {
                    warn!(?err, path = %tmp.display(), "failed to remove temp state file");
                }
            }
        }
        replaced
    }
}

fn write_file(path: &Path, contents: &[u8]) -> Result<()> {
    let mut file = File::create(path)
        .with_context(|| format!("failed to open temp state file {:?}", path))?;
    file.write_all(contents)
        .and_then(|()| file.flush())
        .with_context(|| format!("failed to write temp state file {:?}", path))
}

impl StateStore for FileStateStore {
    fn load(&self, title: &str) -> DocumentRecord {
        let path = self.record_path(title);
        match self.read_record(&path) {
            Ok(Some(record)) => record,
            Ok(None) => {
                debug!(title, "no saved state");
                DocumentRecord::default()
            }
            Err(err) => {
                warn!(?err, title, "ignoring unreadable state file");
                DocumentRecord::default()
            }
        }
    }

    fn save(&self, title: &str, key: &str, value: Value) -> Result<()> {
        let path = self.record_path(title);
        let mut record = self.load(title);
        record.set(key, value);
        self.write_record(&path, &record)?;
        info!(title, key, path = %path.display(), "saved document state");
        Ok(())
    }
}

/// Maps a title to a file stem, one stem per title.
///
/// `%`, path separators, `:` and control characters are written as `%XX`
/// (UTF-8 bytes), so the stem never leaves the root and decodes back to the
/// title. The empty title becomes a lone `%` and the dot titles `.` and `..`
/// are fully escaped, neither of which the escaping itself can produce.
fn record_file_stem(title: &str) -> String {
    match title {
        "" => return "%".to_owned(),
        "." | ".." => return "%2E".repeat(title.len()),
        _ => {}
    }
    let mut stem = String::with_capacity(title.len());
    for c in title.chars() {
        if matches!(c, '%' | '/' | '\\' | ':') || c.is_control() {
            let mut buf = [0u8; 4];
            for byte in c.encode_utf8(&mut buf).bytes() {
                stem.push_str(&format!("%{:02X}", byte));
            }
        } else {
            stem.push(c);
        }
    }
    stem
}

pub struct MemoryStateStore {
    inner: Mutex<HashMap<String, DocumentRecord>>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_record(title: &str, record: DocumentRecord) -> Self {
        let store = Self::new();
        store.inner.lock().insert(title.to_owned(), record);
        store
    }
}

impl Default for MemoryStateStore {
    fn default() -> Self {
        Self::new()
    }
}

impl StateStore for MemoryStateStore {
    fn load(&self, title: &str) -> DocumentRecord {
        self.inner.lock().get(title).cloned().unwrap_or_default()
    }

    fn save(&self, title: &str, key: &str, value: Value) -> Result<()> {
        self.inner
            .lock()
            .entry(title.to_owned())
            .or_default()
            .set(key, value);
        Ok(())
    }
}
