//! Language descriptor: the per-language metadata carried through a cycle.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;

static CODE_REGEX: OnceLock<Regex> = OnceLock::new();

/// A language the corpus is kept in.
///
/// Descriptors are loaded from the settings file at cycle start and are
/// immutable for the rest of the cycle (see [`crate::i18n::LanguageSet`]).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct LanguageDescriptor {
    /// BCP 47-style language code (e.g., "en", "pt-BR")
    pub code: String,

    /// Display name, localized into the default language (e.g., "German")
    #[serde(default)]
    pub name: String,

    /// Name of the language in itself (e.g., "Deutsch")
    #[serde(default)]
    pub native_name: String,

    /// Whether the language is written right-to-left
    #[serde(default)]
    pub is_right_to_left: bool,
}

impl LanguageDescriptor {
    /// Create a descriptor with only a code; names are filled in later.
    pub fn new(code: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            name: String::new(),
            native_name: String::new(),
            is_right_to_left: false,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_native_name(mut self, native_name: impl Into<String>) -> Self {
        self.native_name = native_name.into();
        self
    }

    pub fn right_to_left(mut self) -> Self {
        self.is_right_to_left = true;
        self
    }

    /// Whether the localized display name still has to be produced.
    pub fn needs_display_name(&self) -> bool {
        self.name.trim().is_empty()
    }

    /// Primary subtag of the code ("pt" for "pt-BR").
    pub fn primary_subtag(&self) -> &str {
        primary_subtag(&self.code)
    }

    /// Case-insensitive code comparison.
    pub fn has_code(&self, code: &str) -> bool {
        self.code.eq_ignore_ascii_case(code)
    }
}

/// Primary subtag of a language code ("zh" for "zh-Hant", "pt" for "pt_BR").
pub fn primary_subtag(code: &str) -> &str {
    code.split(|c: char| c == '-' || c == '_').next().unwrap_or(code)
}

/// Check that a language code is well formed.
///
/// Accepts a 2-3 letter primary subtag followed by optional `-`/`_`
/// separated subtags of 2-8 alphanumerics.
pub fn is_valid_code(code: &str) -> bool {
    let regex = CODE_REGEX
        .get_or_init(|| Regex::new(r"^[A-Za-z]{2,3}([-_][A-Za-z0-9]{2,8})*$").unwrap());
    regex.is_match(code)
}
