//! Translation quality validation module.
//!
//! Machine translation tends to mangle the non-linguistic parts of a phrase:
//! interpolation placeholders, printf-style specifiers, URLs and markdown
//! link targets. This module compares the original and translated text and
//! reports anything that did not survive.

use regex::Regex;
use std::sync::OnceLock;

/// Validation report containing errors and warnings about a translation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationReport {
    /// Critical errors that indicate translation issues
    pub errors: Vec<String>,

    /// Non-critical warnings about potential issues
    pub warnings: Vec<String>,
}

impl ValidationReport {
    pub fn new() -> Self {
        Self {
            errors: Vec::new(),
            warnings: Vec::new(),
        }
    }

    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    pub fn has_warnings(&self) -> bool {
        !self.warnings.is_empty()
    }

    /// Check if the report is clean (no errors or warnings)
    pub fn is_clean(&self) -> bool {
        !self.has_errors() && !self.has_warnings()
    }
}

impl Default for ValidationReport {
    fn default() -> Self {
        Self::new()
    }
}

/// Validator for translation quality.
pub struct TranslationValidator;

static PLACEHOLDER_REGEX: OnceLock<Regex> = OnceLock::new();
static FORMAT_SPEC_REGEX: OnceLock<Regex> = OnceLock::new();
static URL_REGEX: OnceLock<Regex> = OnceLock::new();
static MARKDOWN_LINK_REGEX: OnceLock<Regex> = OnceLock::new();

impl TranslationValidator {
    /// Validate that a translation preserves machine-readable elements.
    ///
    /// Checks, in order:
    /// - `{name}` / `{{name}}` / `{0}` placeholders (error when missing:
    ///   the phrase will fail at interpolation time)
    /// - `%s`, `%d`, `%1$s` format specifiers (error)
    /// - URLs (warning)
    /// - markdown link targets (warning)
    pub fn validate(original: &str, translated: &str) -> ValidationReport {
        let mut report = ValidationReport::new();

        let mut orig_placeholders = Self::extract_placeholders(original);
        let mut trans_placeholders = Self::extract_placeholders(translated);
        orig_placeholders.sort();
        trans_placeholders.sort();
        if orig_placeholders != trans_placeholders {
            report.errors.push(format!(
                "Placeholder mismatch: original has {:?}, translation has {:?}",
                orig_placeholders, trans_placeholders
            ));
        }

        let orig_specs = Self::extract_format_specifiers(original);
        let trans_specs = Self::extract_format_specifiers(translated);
        if orig_specs.len() != trans_specs.len() {
            report.errors.push(format!(
                "Format specifier mismatch: original has {:?}, translation has {:?}",
                orig_specs, trans_specs
            ));
        }

        let orig_urls = Self::extract_urls(original);
        let trans_urls = Self::extract_urls(translated);
        if orig_urls != trans_urls {
            report.warnings.push(format!(
                "URL mismatch: original has {} URLs, translation has {} URLs",
                orig_urls.len(),
                trans_urls.len()
            ));
        }

        let orig_targets = Self::extract_markdown_link_targets(original);
        let trans_targets = Self::extract_markdown_link_targets(translated);
        if orig_targets != trans_targets {
            report.warnings.push(format!(
                "Markdown link target mismatch: original has {:?}, translation has {:?}",
                orig_targets, trans_targets
            ));
        }

        report
    }

    /// Extract `{name}`, `{{name}}` and `{0}` placeholders
    fn extract_placeholders(text: &str) -> Vec<String> {
        let regex = PLACEHOLDER_REGEX
            .get_or_init(|| Regex::new(r"\{\{?\s*[A-Za-z0-9_.]+\s*\}?\}").unwrap());

        regex
            .find_iter(text)
            .map(|m| m.as_str().to_string())
            .collect()
    }

    /// Extract printf-style specifiers (`%s`, `%d`, `%1$s`)
    fn extract_format_specifiers(text: &str) -> Vec<String> {
        let regex =
            FORMAT_SPEC_REGEX.get_or_init(|| Regex::new(r"%(?:\d+\$)?[sdif@]").unwrap());

        regex
            .find_iter(text)
            .map(|m| m.as_str().to_string())
            .collect()
    }

    fn extract_urls(text: &str) -> Vec<String> {
        let regex = URL_REGEX.get_or_init(|| Regex::new(r"https?://[^\s)\]]+").unwrap());

        regex
            .find_iter(text)
            .map(|m| m.as_str().to_string())
            .collect()
    }

    /// Extract the target part of `[text](target)` links
    fn extract_markdown_link_targets(text: &str) -> Vec<String> {
        let regex =
            MARKDOWN_LINK_REGEX.get_or_init(|| Regex::new(r"\[[^\]]*\]\(([^)]+)\)").unwrap());

        regex
            .captures_iter(text)
            .filter_map(|cap| cap.get(1).map(|m| m.as_str().to_string()))
            .collect()
    }
}
