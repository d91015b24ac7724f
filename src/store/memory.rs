use super::{ensure_storable, DictionaryStore, StoreCapabilities, StoreError, StoredDictionary};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

/// In-process store with configurable capabilities.
///
/// Used for embedding (e.g., a canonical dictionary compiled into the host)
/// and for exercising capability handling in tests. Languages can be flagged
/// corrupt to simulate unreadable stored data.
pub struct MemoryStore {
    label: String,
    capabilities: StoreCapabilities,
    dictionaries: Mutex<BTreeMap<String, StoredDictionary>>,
    corrupt: Mutex<HashSet<String>>,
    saves: AtomicUsize,
}

impl MemoryStore {
    pub fn new(label: impl Into<String>) -> Self {
        Self::with_capabilities(label, StoreCapabilities::FULL)
    }

    pub fn with_capabilities(label: impl Into<String>, capabilities: StoreCapabilities) -> Self {
        Self {
            label: label.into(),
            capabilities,
            dictionaries: Mutex::new(BTreeMap::new()),
            corrupt: Mutex::new(HashSet::new()),
            saves: AtomicUsize::new(0),
        }
    }

    /// Seed a dictionary regardless of declared capabilities.
    pub fn insert(&self, language: &str, data: StoredDictionary) {
        self.dictionaries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(language.to_string(), data);
    }

    /// Make every subsequent load of `language` fail as corrupt.
    pub fn mark_corrupt(&self, language: &str) {
        self.corrupt
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(language.to_string());
    }

    /// Snapshot of a stored dictionary, bypassing capabilities.
    pub fn get(&self, language: &str) -> Option<StoredDictionary> {
        self.dictionaries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(language)
            .cloned()
    }

    /// Number of successful `save_dictionary` calls.
    pub fn save_count(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }

    fn require(&self, supported: bool, operation: &'static str) -> Result<(), StoreError> {
        if supported {
            Ok(())
        } else {
            Err(StoreError::unsupported(&self.name(), operation))
        }
    }
}

#[async_trait]
impl DictionaryStore for MemoryStore {
    fn name(&self) -> String {
        format!("memory:{}", self.label)
    }

    fn capabilities(&self) -> StoreCapabilities {
        self.capabilities
    }

    async fn save_dictionary(
        &self,
        language: &str,
        data: &StoredDictionary,
    ) -> Result<(), StoreError> {
        self.require(self.capabilities.writable(), "save_dictionary")?;
        ensure_storable(language)?;
        self.insert(language, data.clone());
        self.corrupt
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(language);
        self.saves.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn load_dictionary(&self, language: &str) -> Result<StoredDictionary, StoreError> {
        self.require(self.capabilities.can_read, "load_dictionary")?;

        let is_corrupt = self
            .corrupt
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .contains(language);
        if is_corrupt {
            return Err(StoreError::Corrupt {
                language: language.to_string(),
                reason: "flagged corrupt".to_string(),
            });
        }

        self.get(language)
            .ok_or_else(|| StoreError::NotFound(language.to_string()))
    }

    async fn list_available_languages(&self) -> Result<Vec<String>, StoreError> {
        self.require(self.capabilities.can_list_languages, "list_available_languages")?;
        Ok(self
            .dictionaries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .keys()
            .cloned()
            .collect())
    }

    async fn dictionary_exists(&self, language: &str) -> Result<bool, StoreError> {
        self.require(self.capabilities.can_check_existence, "dictionary_exists")?;
        Ok(self.get(language).is_some())
    }

    async fn delete_dictionary(&self, language: &str) -> Result<(), StoreError> {
        self.require(self.capabilities.deletable(), "delete_dictionary")?;
        self.dictionaries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(language)
            .map(|_| ())
            .ok_or_else(|| StoreError::NotFound(language.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> StoredDictionary {
        let mut dictionary = StoredDictionary::new();
        dictionary.insert_unverified("a", "1".to_string());
        dictionary
    }

    #[tokio::test]
    async fn test_round_trip() {
        let store = MemoryStore::new("test");
        store.save_dictionary("es", &sample()).await.unwrap();
        assert_eq!(store.load_dictionary("es").await.unwrap(), sample());
        assert_eq!(store.save_count(), 1);
    }

    #[tokio::test]
    async fn test_read_only_refuses_save_but_serves_seeded_data() {
        let store = MemoryStore::with_capabilities("ro", StoreCapabilities::READ_ONLY);
        store.insert("es", sample());

        assert!(matches!(
            store.save_dictionary("es", &StoredDictionary::new()).await,
            Err(StoreError::Unsupported { .. })
        ));
        assert_eq!(store.load_dictionary("es").await.unwrap(), sample());
        assert_eq!(store.save_count(), 0);
    }

    #[tokio::test]
    async fn test_unsupported_listing() {
        let store = MemoryStore::with_capabilities("ro", StoreCapabilities::READ_ONLY);
        let result = store.list_available_languages().await;
        assert!(matches!(
            result,
            Err(StoreError::Unsupported { operation, .. }) if operation == "list_available_languages"
        ));
    }

    #[tokio::test]
    async fn test_corrupt_flag_cleared_by_save() {
        let store = MemoryStore::new("test");
        store.insert("de", sample());
        store.mark_corrupt("de");
        assert!(matches!(
            store.load_dictionary("de").await,
            Err(StoreError::Corrupt { .. })
        ));

        store.save_dictionary("de", &sample()).await.unwrap();
        assert!(store.load_dictionary("de").await.is_ok());
    }

    #[tokio::test]
    async fn test_delete() {
        let store = MemoryStore::new("test");
        store.insert("fr", sample());
        store.delete_dictionary("fr").await.unwrap();
        assert!(!store.dictionary_exists("fr").await.unwrap());
    }
}
