//! Dictionary persistence.
//!
//! A [`DictionaryStore`] persists one language's flat dictionary somewhere
//! (local files, PostgreSQL, a remote HTTP host, memory). Every store
//! declares up front which operations it supports through a
//! [`StoreCapabilities`] value; callers consult that value before calling,
//! and a store asked for something it does not support answers
//! [`StoreError::Unsupported`] instead of guessing.

mod chain;
mod database;
mod filesystem;
mod memory;
mod remote;

pub use chain::{BackendChain, SaveOutcome};
pub use database::DatabaseStore;
pub use filesystem::FilesystemStore;
pub(crate) use filesystem::write_atomically;
pub use memory::MemoryStore;
pub use remote::RemoteStore;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use thiserror::Error;

/// Flat key → value phrase mapping, ordered for stable serialization.
pub type FlatDictionary = BTreeMap<String, String>;

/// Hex SHA-256 of a canonical value.
///
/// Recorded next to every stored translation so that drift in the canonical
/// value can be detected without comparing text across languages.
pub fn fingerprint(value: &str) -> String {
    hex::encode(Sha256::digest(value.as_bytes()))
}

/// What a store persists for one language.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredDictionary {
    /// Translated phrases
    pub entries: FlatDictionary,

    /// Fingerprint of the canonical value each entry was translated from
    #[serde(default)]
    pub fingerprints: BTreeMap<String, String>,
}

impl StoredDictionary {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wrap a plain dictionary with no recorded fingerprints.
    pub fn from_entries(entries: FlatDictionary) -> Self {
        Self {
            entries,
            fingerprints: BTreeMap::new(),
        }
    }

    /// Insert a translation together with the fingerprint of its source.
    pub fn insert_translated(&mut self, key: &str, value: String, source_fingerprint: String) {
        self.entries.insert(key.to_string(), value);
        self.fingerprints
            .insert(key.to_string(), source_fingerprint);
    }

    /// Insert a value with no fingerprint, so the key is revisited next cycle.
    pub fn insert_unverified(&mut self, key: &str, value: String) {
        self.entries.insert(key.to_string(), value);
        self.fingerprints.remove(key);
    }

    /// Drop a key's fingerprint but keep its value, so the key is revisited
    /// next cycle without losing the translation already stored.
    pub fn mark_unverified(&mut self, key: &str) {
        self.fingerprints.remove(key);
    }

    pub fn remove(&mut self, key: &str) {
        self.entries.remove(key);
        self.fingerprints.remove(key);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Declarative record of the operations a store supports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StoreCapabilities {
    pub can_read: bool,
    pub can_write: bool,
    pub can_delete: bool,
    pub can_list_languages: bool,
    pub can_check_existence: bool,
    pub is_read_only: bool,
}

impl StoreCapabilities {
    /// Every operation supported.
    pub const FULL: StoreCapabilities = StoreCapabilities {
        can_read: true,
        can_write: true,
        can_delete: true,
        can_list_languages: true,
        can_check_existence: true,
        is_read_only: false,
    };

    /// Reads only; listing and existence checks are not assumed.
    pub const READ_ONLY: StoreCapabilities = StoreCapabilities {
        can_read: true,
        can_write: false,
        can_delete: false,
        can_list_languages: false,
        can_check_existence: false,
        is_read_only: true,
    };

    /// Whether writes are both supported and allowed.
    pub fn writable(&self) -> bool {
        self.can_write && !self.is_read_only
    }

    /// Whether deletes are both supported and allowed.
    pub fn deletable(&self) -> bool {
        self.can_delete && !self.is_read_only
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("no dictionary stored for language '{0}'")]
    NotFound(String),

    #[error("{store} does not support {operation}")]
    Unsupported {
        store: String,
        operation: &'static str,
    },

    #[error("dictionary for '{language}' is corrupt: {reason}")]
    Corrupt { language: String, reason: String },

    #[error("invalid language code for storage: '{0}'")]
    InvalidLanguage(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("remote store error: {0}")]
    Remote(String),
}

impl StoreError {
    pub(crate) fn unsupported(store: &str, operation: &'static str) -> Self {
        StoreError::Unsupported {
            store: store.to_string(),
            operation,
        }
    }
}

/// Persistence for per-language dictionaries.
///
/// Implementations must make `save_dictionary` all-or-nothing: a reader
/// never observes a half-written dictionary.
#[async_trait]
pub trait DictionaryStore: Send + Sync {
    /// Short name for logs (e.g., "filesystem:/srv/dictionaries").
    fn name(&self) -> String;

    fn capabilities(&self) -> StoreCapabilities;

    fn is_read_only(&self) -> bool {
        self.capabilities().is_read_only
    }

    async fn save_dictionary(&self, language: &str, data: &StoredDictionary)
        -> Result<(), StoreError>;

    /// Load a stored dictionary. Absent dictionaries are `StoreError::NotFound`.
    async fn load_dictionary(&self, language: &str) -> Result<StoredDictionary, StoreError>;

    async fn list_available_languages(&self) -> Result<Vec<String>, StoreError>;

    async fn dictionary_exists(&self, language: &str) -> Result<bool, StoreError>;

    async fn delete_dictionary(&self, language: &str) -> Result<(), StoreError>;

    /// Single-phrase lookup. The default loads the whole dictionary.
    async fn get_translation(
        &self,
        language: &str,
        key: &str,
    ) -> Result<Option<String>, StoreError> {
        let dictionary = self.load_dictionary(language).await?;
        Ok(dictionary.entries.get(key).cloned())
    }
}

/// Serialized shapes accepted when decoding.
///
/// Plain `{"key": "value"}` documents (hand-maintained or produced by other
/// tools) decode with no fingerprints.
#[derive(Deserialize)]
#[serde(untagged)]
enum Encoded {
    Stored(StoredDictionary),
    Flat(FlatDictionary),
}

pub(crate) fn decode_dictionary(
    language: &str,
    bytes: &[u8],
) -> Result<StoredDictionary, StoreError> {
    match serde_json::from_slice::<Encoded>(bytes) {
        Ok(Encoded::Stored(stored)) => Ok(stored),
        Ok(Encoded::Flat(entries)) => Ok(StoredDictionary::from_entries(entries)),
        Err(e) => Err(StoreError::Corrupt {
            language: language.to_string(),
            reason: e.to_string(),
        }),
    }
}

/// Reject codes that could escape a storage namespace (paths, URLs).
pub(crate) fn ensure_storable(language: &str) -> Result<(), StoreError> {
    if crate::i18n::is_valid_code(language) {
        Ok(())
    } else {
        Err(StoreError::InvalidLanguage(language.to_string()))
    }
}
