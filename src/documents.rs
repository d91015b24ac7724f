//! Markdown document trees.
//!
//! Layout on disk is `<root>/<language>/**/*.md`. The default language's
//! folder is canonical; every target language folder carries a manifest
//! (`.locale-sync.json`) recording, per document, the fingerprint and
//! modification time of the canonical text it was translated from.

use crate::diff::DiffResult;
use crate::store::{fingerprint, write_atomically, StoreError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::io;
use std::path::{Path, PathBuf};
use tracing::warn;

/// Manifest file name inside each target language folder.
pub const MANIFEST_FILE: &str = ".locale-sync.json";

/// One markdown document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentNode {
    /// Path relative to the language folder, `/`-separated
    pub path: String,
    /// File name
    pub name: String,
    pub text: String,
    pub modified: DateTime<Utc>,
}

impl DocumentNode {
    pub fn fingerprint(&self) -> String {
        fingerprint(&self.text)
    }
}

/// What a target document was translated from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub fingerprint: String,
    pub source_modified: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentManifest {
    pub documents: BTreeMap<String, ManifestEntry>,
}

impl DocumentManifest {
    /// Load a folder's manifest. Missing means first sync; an unreadable
    /// manifest is logged and treated the same way.
    pub async fn load(folder: &Path) -> Result<Self, StoreError> {
        let path = folder.join(MANIFEST_FILE);
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(e) => return Err(e.into()),
        };

        match serde_json::from_slice(&bytes) {
            Ok(manifest) => Ok(manifest),
            Err(e) => {
                warn!(
                    "Ignoring corrupt manifest {}: {}",
                    path.display(),
                    e
                );
                Ok(Self::default())
            }
        }
    }

    pub async fn save(&self, folder: &Path) -> Result<(), StoreError> {
        let content = serde_json::to_vec_pretty(self).map_err(io::Error::from)?;
        write_atomically(&folder.join(MANIFEST_FILE), &content).await
    }

    /// Record that `source` has been translated.
    pub fn record(&mut self, source: &DocumentNode) {
        self.documents.insert(
            source.path.clone(),
            ManifestEntry {
                fingerprint: source.fingerprint(),
                source_modified: source.modified,
            },
        );
    }

    pub fn forget(&mut self, path: &str) {
        self.documents.remove(path);
    }

    /// Put back the entry `previous` held for `path`, or forget the path if
    /// it had none.
    pub fn restore(&mut self, path: &str, previous: &DocumentManifest) {
        match previous.get(path) {
            Some(entry) => {
                self.documents.insert(path.to_string(), entry.clone());
            }
            None => self.forget(path),
        }
    }

    pub fn get(&self, path: &str) -> Option<&ManifestEntry> {
        self.documents.get(path)
    }
}

fn is_markdown(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("md"))
}

fn is_hidden(path: &Path) -> bool {
    path.file_name()
        .and_then(|name| name.to_str())
        .is_some_and(|name| name.starts_with('.'))
}

fn relative_path(folder: &Path, path: &Path) -> Option<String> {
    let relative = path.strip_prefix(folder).ok()?;
    let parts: Vec<&str> = relative
        .components()
        .map(|c| c.as_os_str().to_str())
        .collect::<Option<_>>()?;
    Some(parts.join("/"))
}

/// Every markdown file under `folder`, as absolute and relative paths.
async fn walk_markdown(folder: &Path) -> Result<Vec<(PathBuf, String)>, StoreError> {
    let mut found = Vec::new();
    let mut pending = vec![folder.to_path_buf()];

    while let Some(dir) = pending.pop() {
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
            Err(e) => return Err(e.into()),
        };

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if is_hidden(&path) {
                continue;
            }

            let file_type = entry.file_type().await?;
            if file_type.is_dir() {
                pending.push(path);
            } else if file_type.is_file() && is_markdown(&path) {
                match relative_path(folder, &path) {
                    Some(relative) => found.push((path, relative)),
                    None => warn!("Skipping non UTF-8 path {}", path.display()),
                }
            }
        }
    }

    found.sort_by(|a, b| a.1.cmp(&b.1));
    Ok(found)
}

/// Read every markdown document under a language folder.
///
/// A missing folder yields no documents.
pub async fn scan_documents(folder: &Path) -> Result<Vec<DocumentNode>, StoreError> {
    let mut nodes = Vec::new();

    for (path, relative) in walk_markdown(folder).await? {
        let text = tokio::fs::read_to_string(&path).await?;
        let modified: DateTime<Utc> = tokio::fs::metadata(&path).await?.modified()?.into();
        let name = path
            .file_name()
            .and_then(|name| name.to_str())
            .unwrap_or_default()
            .to_string();

        nodes.push(DocumentNode {
            path: relative,
            name,
            text,
            modified,
        });
    }

    Ok(nodes)
}

/// Relative paths of the markdown documents present under a folder.
pub async fn document_paths(folder: &Path) -> Result<BTreeSet<String>, StoreError> {
    Ok(walk_markdown(folder)
        .await?
        .into_iter()
        .map(|(_, relative)| relative)
        .collect())
}

/// Resolve a relative document path inside a language folder.
pub fn document_path(folder: &Path, relative: &str) -> PathBuf {
    relative
        .split('/')
        .fold(folder.to_path_buf(), |path, part| path.join(part))
}

pub async fn write_document(folder: &Path, relative: &str, text: &str) -> Result<(), StoreError> {
    write_atomically(&document_path(folder, relative), text.as_bytes()).await
}

/// Remove a document; already gone is fine.
pub async fn remove_document(folder: &Path, relative: &str) -> Result<(), StoreError> {
    match tokio::fs::remove_file(document_path(folder, relative)).await {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e.into()),
        _ => Ok(()),
    }
}

/// Compare canonical documents with one target language folder.
///
/// - add: no manifest entry, or the target file is missing
/// - remove: a manifest entry or target file with no canonical document
/// - update: the canonical file is newer than recorded and its text
///   fingerprint differs
pub fn compute_tree_diff(
    language: &str,
    canonical: &[DocumentNode],
    manifest: &DocumentManifest,
    present_targets: &BTreeSet<String>,
) -> DiffResult {
    let mut diff = DiffResult {
        language: language.to_string(),
        ..DiffResult::default()
    };

    let canonical_paths: BTreeSet<&str> = canonical.iter().map(|n| n.path.as_str()).collect();

    for node in canonical {
        let recorded = manifest.get(&node.path);
        match recorded {
            Some(entry) if present_targets.contains(&node.path) => {
                if node.modified > entry.source_modified && node.fingerprint() != entry.fingerprint
                {
                    diff.to_update.insert(node.path.clone());
                }
            }
            _ => {
                diff.to_add.insert(node.path.clone());
            }
        }
    }

    diff.to_remove = manifest
        .documents
        .keys()
        .chain(present_targets.iter())
        .filter(|path| !canonical_paths.contains(path.as_str()))
        .cloned()
        .collect();

    diff.existing = canonical.len() - diff.to_add.len();
    diff
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use tempfile::TempDir;

    fn node(path: &str, text: &str, modified: DateTime<Utc>) -> DocumentNode {
        DocumentNode {
            path: path.to_string(),
            name: path.rsplit('/').next().unwrap_or(path).to_string(),
            text: text.to_string(),
            modified,
        }
    }

    fn paths(items: &[&str]) -> BTreeSet<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_manifest_restore() {
        let earlier = Utc::now() - Duration::hours(1);
        let mut previous = DocumentManifest::default();
        previous.record(&node("guide.md", "Old", earlier));

        let mut manifest = previous.clone();
        manifest.record(&node("guide.md", "New", Utc::now()));
        manifest.record(&node("new.md", "Fresh", Utc::now()));

        manifest.restore("guide.md", &previous);
        manifest.restore("new.md", &previous);

        assert_eq!(manifest.get("guide.md"), previous.get("guide.md"));
        assert!(manifest.get("new.md").is_none());
    }

    #[test]
    fn test_tree_diff_first_sync_adds_everything() {
        let now = Utc::now();
        let canonical = vec![node("intro.md", "Hi", now), node("guide/setup.md", "Setup", now)];

        let diff = compute_tree_diff("es", &canonical, &DocumentManifest::default(), &paths(&[]));

        assert_eq!(diff.to_add, paths(&["intro.md", "guide/setup.md"]));
        assert!(diff.to_remove.is_empty());
        assert!(diff.to_update.is_empty());
        assert_eq!(diff.existing, 0);
    }

    #[test]
    fn test_tree_diff_update_needs_newer_and_different() {
        let then = Utc::now() - Duration::hours(1);
        let now = Utc::now();
        let original = node("a.md", "old text", then);

        let mut manifest = DocumentManifest::default();
        manifest.record(&original);
        let present = paths(&["a.md"]);

        // Touched but unchanged text
        let touched = vec![node("a.md", "old text", now)];
        assert!(compute_tree_diff("es", &touched, &manifest, &present).is_empty());

        // Changed text, newer timestamp
        let edited = vec![node("a.md", "new text", now)];
        let diff = compute_tree_diff("es", &edited, &manifest, &present);
        assert_eq!(diff.to_update, paths(&["a.md"]));
        assert_eq!(diff.existing, 1);
    }

    #[test]
    fn test_tree_diff_older_source_is_not_update() {
        let now = Utc::now();
        let mut manifest = DocumentManifest::default();
        manifest.record(&node("a.md", "current text", now));

        // Restored from a backup with its original, older timestamp
        let restored = vec![node("a.md", "backup text", now - Duration::days(3))];
        let diff = compute_tree_diff("es", &restored, &manifest, &paths(&["a.md"]));
        assert!(diff.is_empty());
    }

    #[test]
    fn test_tree_diff_missing_target_file_is_add() {
        let now = Utc::now();
        let source = node("a.md", "text", now);
        let mut manifest = DocumentManifest::default();
        manifest.record(&source);

        let diff = compute_tree_diff("es", &[source], &manifest, &paths(&[]));
        assert_eq!(diff.to_add, paths(&["a.md"]));
    }

    #[test]
    fn test_tree_diff_removed_canonical_document() {
        let now = Utc::now();
        let mut manifest = DocumentManifest::default();
        manifest.record(&node("gone.md", "bye", now));

        let diff = compute_tree_diff(
            "es",
            &[node("kept.md", "hi", now)],
            &manifest,
            &paths(&["gone.md", "stray.md"]),
        );

        assert_eq!(diff.to_remove, paths(&["gone.md", "stray.md"]));
        assert_eq!(diff.to_add, paths(&["kept.md"]));
        assert!(diff.to_add.is_disjoint(&diff.to_remove));
    }

    #[tokio::test]
    async fn test_scan_documents_recurses_and_skips_hidden() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let root = dir.path();
        tokio::fs::create_dir_all(root.join("guide/deep")).await.unwrap();
        tokio::fs::write(root.join("intro.md"), "Intro").await.unwrap();
        tokio::fs::write(root.join("guide/deep/notes.MD"), "Notes").await.unwrap();
        tokio::fs::write(root.join("image.png"), "binary").await.unwrap();
        tokio::fs::write(root.join(MANIFEST_FILE), "{}").await.unwrap();

        let nodes = scan_documents(root).await.expect("Should scan");
        let found: Vec<&str> = nodes.iter().map(|n| n.path.as_str()).collect();

        assert_eq!(found, vec!["guide/deep/notes.MD", "intro.md"]);
        assert_eq!(nodes[1].text, "Intro");
        assert_eq!(nodes[0].name, "notes.MD");
    }

    #[tokio::test]
    async fn test_scan_missing_folder_is_empty() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let nodes = scan_documents(&dir.path().join("nope")).await.unwrap();
        assert!(nodes.is_empty());
    }

    #[tokio::test]
    async fn test_manifest_round_trip_and_corrupt_fallback() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let mut manifest = DocumentManifest::default();
        manifest.record(&node("a.md", "text", Utc::now()));
        manifest.save(dir.path()).await.unwrap();

        assert_eq!(DocumentManifest::load(dir.path()).await.unwrap(), manifest);

        tokio::fs::write(dir.path().join(MANIFEST_FILE), "not json")
            .await
            .unwrap();
        assert_eq!(
            DocumentManifest::load(dir.path()).await.unwrap(),
            DocumentManifest::default()
        );
    }

    #[tokio::test]
    async fn test_write_and_remove_nested_document() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        write_document(dir.path(), "guide/setup.md", "Hola").await.unwrap();

        assert_eq!(
            tokio::fs::read_to_string(dir.path().join("guide").join("setup.md"))
                .await
                .unwrap(),
            "Hola"
        );
        assert_eq!(
            document_paths(dir.path()).await.unwrap(),
            paths(&["guide/setup.md"])
        );

        remove_document(dir.path(), "guide/setup.md").await.unwrap();
        remove_document(dir.path(), "guide/setup.md").await.unwrap();
        assert!(document_paths(dir.path()).await.unwrap().is_empty());
    }
}
