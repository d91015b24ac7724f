//! Drift detection between the canonical dictionary and a stored translation.
//!
//! Translated values can never be compared with canonical values directly
//! (they are in different languages), so drift is detected through the
//! fingerprint recorded next to each stored translation.

use crate::store::{fingerprint, FlatDictionary, StoredDictionary};
use serde::Serialize;
use std::collections::BTreeSet;

/// Per-language reconciliation plan.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DiffResult {
    pub language: String,
    /// Canonical keys missing from the stored translation
    pub to_add: BTreeSet<String>,
    /// Stored keys the canonical dictionary no longer has
    pub to_remove: BTreeSet<String>,
    /// Keys whose canonical value changed since they were translated
    pub to_update: BTreeSet<String>,
    /// Stored keys that survive reconciliation
    pub existing: usize,
}

impl DiffResult {
    /// Nothing to add, remove or update.
    pub fn is_empty(&self) -> bool {
        self.to_add.is_empty() && self.to_remove.is_empty() && self.to_update.is_empty()
    }

    /// Keys that need a call to the translation provider, additions first.
    pub fn keys_to_translate(&self) -> impl Iterator<Item = &String> {
        self.to_add.iter().chain(self.to_update.iter())
    }

    pub fn translation_count(&self) -> usize {
        self.to_add.len() + self.to_update.len()
    }
}

/// Compare the canonical dictionary with one language's stored dictionary.
///
/// A stored key with no recorded fingerprint counts as drifted.
pub fn compute_flat_diff(
    language: &str,
    canonical: &FlatDictionary,
    existing: &StoredDictionary,
) -> DiffResult {
    let mut diff = DiffResult {
        language: language.to_string(),
        ..DiffResult::default()
    };

    for (key, value) in canonical {
        if !existing.entries.contains_key(key) {
            diff.to_add.insert(key.clone());
            continue;
        }

        let current = fingerprint(value);
        if existing.fingerprints.get(key) != Some(&current) {
            diff.to_update.insert(key.clone());
        }
    }

    diff.to_remove = existing
        .entries
        .keys()
        .filter(|key| !canonical.contains_key(*key))
        .cloned()
        .collect();

    diff.existing = existing.len() - diff.to_remove.len();
    diff
}
