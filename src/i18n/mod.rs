//! Language model shared by every phase of a cycle.
//!
//! - `language`: [`LanguageDescriptor`], one language's metadata
//! - `registry`: [`LanguageSet`], the set frozen for one cycle
//! - `validator`: placeholder/URL preservation checks for translated text

mod language;
mod registry;
mod validator;

pub use language::{is_valid_code, primary_subtag, LanguageDescriptor};
pub use registry::{LanguageSet, LanguageSetError};
pub use validator::{TranslationValidator, ValidationReport};
