use super::{DictionaryStore, StoreCapabilities, StoreError, StoredDictionary};
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, warn};

/// Where a save landed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SaveOutcome {
    /// Written to the named store
    Saved(String),
    /// No store in the chain accepts writes
    Skipped,
}

struct Backend {
    tag: String,
    store: Arc<dyn DictionaryStore>,
}

/// Ordered composition of stores.
///
/// - reads: first store that has the language wins; a store that is missing
///   the language or fails to read falls through to the next one
/// - writes: the first writable store takes the write, later ones are never
///   touched
/// - capability flags are checked before every call, so a store is never
///   asked for something it declared unsupported
#[derive(Default, Clone)]
pub struct BackendChain {
    backends: Vec<Arc<Backend>>,
}

impl BackendChain {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a store; earlier stores take precedence.
    pub fn with_store(mut self, tag: impl Into<String>, store: Arc<dyn DictionaryStore>) -> Self {
        self.backends.push(Arc::new(Backend {
            tag: tag.into(),
            store,
        }));
        self
    }

    pub fn len(&self) -> usize {
        self.backends.len()
    }

    pub fn is_empty(&self) -> bool {
        self.backends.is_empty()
    }

    /// Tags and capabilities in chain order.
    pub fn describe(&self) -> Vec<(String, StoreCapabilities)> {
        self.backends
            .iter()
            .map(|b| (b.tag.clone(), b.store.capabilities()))
            .collect()
    }

    pub fn has_readable(&self) -> bool {
        self.backends.iter().any(|b| b.store.capabilities().can_read)
    }

    pub fn has_writable(&self) -> bool {
        self.backends
            .iter()
            .any(|b| b.store.capabilities().writable())
    }

    /// Load from the first store that has the language.
    ///
    /// Returns `NotFound` only when no readable store has it; otherwise the
    /// first real failure (corrupt data, I/O) is reported if nothing succeeded.
    pub async fn load(&self, language: &str) -> Result<StoredDictionary, StoreError> {
        let mut first_failure: Option<StoreError> = None;

        for backend in &self.backends {
            if !backend.store.capabilities().can_read {
                continue;
            }

            match backend.store.load_dictionary(language).await {
                Ok(dictionary) => {
                    debug!("Loaded '{}' from {}", language, backend.tag);
                    return Ok(dictionary);
                }
                Err(StoreError::NotFound(_)) => continue,
                Err(e) => {
                    warn!(
                        "Reading '{}' from {} failed, trying next store: {}",
                        language, backend.tag, e
                    );
                    first_failure.get_or_insert(e);
                }
            }
        }

        Err(first_failure.unwrap_or_else(|| StoreError::NotFound(language.to_string())))
    }

    /// Save through the first writable store.
    pub async fn save(
        &self,
        language: &str,
        data: &StoredDictionary,
    ) -> Result<SaveOutcome, StoreError> {
        let Some(backend) = self
            .backends
            .iter()
            .find(|b| b.store.capabilities().writable())
        else {
            return Ok(SaveOutcome::Skipped);
        };

        backend.store.save_dictionary(language, data).await?;
        Ok(SaveOutcome::Saved(backend.tag.clone()))
    }

    /// Union of the languages reported by every store that can list.
    pub async fn list_available_languages(&self) -> Result<Vec<String>, StoreError> {
        let mut languages = BTreeSet::new();
        for backend in &self.backends {
            if !backend.store.capabilities().can_list_languages {
                continue;
            }
            languages.extend(backend.store.list_available_languages().await?);
        }
        Ok(languages.into_iter().collect())
    }

    /// Whether any store that can answer says the language exists.
    pub async fn exists(&self, language: &str) -> Result<bool, StoreError> {
        for backend in &self.backends {
            if !backend.store.capabilities().can_check_existence {
                continue;
            }
            if backend.store.dictionary_exists(language).await? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Delete the language from every store that allows it; returns the
    /// number of stores it was removed from.
    pub async fn delete(&self, language: &str) -> Result<usize, StoreError> {
        let mut deleted = 0;
        for backend in &self.backends {
            if !backend.store.capabilities().deletable() {
                continue;
            }
            match backend.store.delete_dictionary(language).await {
                Ok(()) => deleted += 1,
                Err(StoreError::NotFound(_)) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(deleted)
    }

    /// Single phrase lookup with the same fallback as [`BackendChain::load`].
    pub async fn get_translation(
        &self,
        language: &str,
        key: &str,
    ) -> Result<Option<String>, StoreError> {
        for backend in &self.backends {
            if !backend.store.capabilities().can_read {
                continue;
            }
            match backend.store.get_translation(language, key).await {
                Ok(Some(value)) => return Ok(Some(value)),
                Ok(None) | Err(StoreError::NotFound(_)) => continue,
                Err(e) => {
                    warn!("Lookup in {} failed, trying next store: {}", backend.tag, e);
                }
            }
        }
        Ok(None)
    }
}
