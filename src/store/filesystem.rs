use super::{
    decode_dictionary, ensure_storable, DictionaryStore, StoreCapabilities, StoreError,
    StoredDictionary,
};
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio::io::AsyncWriteExt;
use tracing::debug;

/// One pretty-printed JSON file per language: `<root>/<code>.json`.
pub struct FilesystemStore {
    root: PathBuf,
    read_only: bool,
    write_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl FilesystemStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            read_only: false,
            write_locks: Mutex::new(HashMap::new()),
        }
    }

    /// Open the directory for reading only (e.g., a mounted release bundle).
    pub fn read_only(root: impl Into<PathBuf>) -> Self {
        Self {
            read_only: true,
            ..Self::new(root)
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, language: &str) -> Result<PathBuf, StoreError> {
        ensure_storable(language)?;
        Ok(self.root.join(format!("{}.json", language)))
    }

    /// Per-language writer lock; two saves of the same language never interleave.
    fn lock_for(&self, language: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self
            .write_locks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        locks
            .entry(language.to_ascii_lowercase())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    fn ensure_writable(&self, operation: &'static str) -> Result<(), StoreError> {
        if self.read_only {
            return Err(StoreError::unsupported(&self.name(), operation));
        }
        Ok(())
    }
}

/// Write `content` next to `target` under a unique temporary name, flush it
/// to disk, then rename it over `target`.
pub(crate) async fn write_atomically(target: &Path, content: &[u8]) -> Result<(), StoreError> {
    let parent = target.parent().unwrap_or_else(|| Path::new("."));
    tokio::fs::create_dir_all(parent).await?;

    let file_name = target
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    let tmp_path = parent.join(format!(".{}.tmp.{}", file_name, uuid::Uuid::new_v4()));

    let written = async {
        let mut file = tokio::fs::File::create(&tmp_path).await?;
        file.write_all(content).await?;
        file.sync_all().await?;
        tokio::fs::rename(&tmp_path, target).await
    }
    .await;

    if let Err(e) = written {
        // Try to clean up temp file on error
        let _ = tokio::fs::remove_file(&tmp_path).await;
        return Err(StoreError::Io(e));
    }

    Ok(())
}

#[async_trait]
impl DictionaryStore for FilesystemStore {
    fn name(&self) -> String {
        format!("filesystem:{}", self.root.display())
    }

    fn capabilities(&self) -> StoreCapabilities {
        StoreCapabilities {
            can_write: !self.read_only,
            can_delete: !self.read_only,
            is_read_only: self.read_only,
            ..StoreCapabilities::FULL
        }
    }

    async fn save_dictionary(
        &self,
        language: &str,
        data: &StoredDictionary,
    ) -> Result<(), StoreError> {
        self.ensure_writable("save_dictionary")?;
        let path = self.path_for(language)?;

        let content = serde_json::to_vec_pretty(data).map_err(|e| StoreError::Corrupt {
            language: language.to_string(),
            reason: e.to_string(),
        })?;

        let lock = self.lock_for(language);
        let _guard = lock.lock().await;
        write_atomically(&path, &content).await?;

        debug!(
            "Saved {} entries for '{}' to {}",
            data.len(),
            language,
            path.display()
        );
        Ok(())
    }

    async fn load_dictionary(&self, language: &str) -> Result<StoredDictionary, StoreError> {
        let path = self.path_for(language)?;

        let content = match tokio::fs::read(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(StoreError::NotFound(language.to_string()))
            }
            Err(e) => return Err(StoreError::Io(e)),
        };

        decode_dictionary(language, &content)
    }

    async fn list_available_languages(&self) -> Result<Vec<String>, StoreError> {
        let mut entries = match tokio::fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(StoreError::Io(e)),
        };

        let mut languages = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            if let Some(code) = name.strip_suffix(".json") {
                if crate::i18n::is_valid_code(code) {
                    languages.push(code.to_string());
                }
            }
        }

        languages.sort();
        Ok(languages)
    }

    async fn dictionary_exists(&self, language: &str) -> Result<bool, StoreError> {
        let path = self.path_for(language)?;
        Ok(tokio::fs::try_exists(&path).await?)
    }

    async fn delete_dictionary(&self, language: &str) -> Result<(), StoreError> {
        self.ensure_writable("delete_dictionary")?;
        let path = self.path_for(language)?;

        let lock = self.lock_for(language);
        let _guard = lock.lock().await;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(StoreError::NotFound(language.to_string()))
            }
            Err(e) => Err(StoreError::Io(e)),
        }
    }
}
