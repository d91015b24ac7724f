//! Language set: the frozen collection of languages for one cycle.
//!
//! Unlike a process-wide registry, a `LanguageSet` is built fresh from the
//! settings at the start of every cycle and shared read-only (`Arc`) with
//! every task of that cycle. Edits to the settings file therefore take
//! effect at the next cycle start, never mid-cycle.

use crate::i18n::language::{is_valid_code, LanguageDescriptor};
use std::collections::HashSet;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum LanguageSetError {
    #[error("default language '{0}' is not in the language set")]
    MissingDefault(String),

    #[error("invalid language code: '{0}'")]
    InvalidCode(String),

    #[error("language '{0}' is listed more than once")]
    Duplicate(String),
}

/// Immutable, cheaply cloneable set of languages for one cycle.
#[derive(Debug, Clone)]
pub struct LanguageSet {
    languages: Arc<[LanguageDescriptor]>,
    default_index: usize,
}

impl LanguageSet {
    /// Validate and freeze a language list.
    ///
    /// Fails if a code is malformed, a code appears twice, or the default
    /// language is absent.
    pub fn new(
        languages: Vec<LanguageDescriptor>,
        default_code: &str,
    ) -> Result<Self, LanguageSetError> {
        let mut seen = HashSet::new();
        for lang in &languages {
            if !is_valid_code(&lang.code) {
                return Err(LanguageSetError::InvalidCode(lang.code.clone()));
            }
            if !seen.insert(lang.code.to_ascii_lowercase()) {
                return Err(LanguageSetError::Duplicate(lang.code.clone()));
            }
        }

        let default_index = languages
            .iter()
            .position(|lang| lang.has_code(default_code))
            .ok_or_else(|| LanguageSetError::MissingDefault(default_code.to_string()))?;

        Ok(Self {
            languages: languages.into(),
            default_index,
        })
    }

    /// The canonical (source) language.
    pub fn default_language(&self) -> &LanguageDescriptor {
        &self.languages[self.default_index]
    }

    pub fn get_by_code(&self, code: &str) -> Option<&LanguageDescriptor> {
        self.languages.iter().find(|lang| lang.has_code(code))
    }

    pub fn contains(&self, code: &str) -> bool {
        self.get_by_code(code).is_some()
    }

    pub fn list_all(&self) -> &[LanguageDescriptor] {
        &self.languages
    }

    /// Translation targets: every language except the default and the
    /// ignored ones, in settings order.
    pub fn targets(&self, ignored: &[String]) -> Vec<LanguageDescriptor> {
        self.languages
            .iter()
            .enumerate()
            .filter(|(index, _)| *index != self.default_index)
            .filter(|(_, lang)| !ignored.iter().any(|code| lang.has_code(code)))
            .map(|(_, lang)| lang.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.languages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.languages.is_empty()
    }
}
