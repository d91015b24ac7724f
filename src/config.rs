use crate::i18n::{is_valid_code, LanguageDescriptor};
use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Mutex;
use std::time::Duration;
use thiserror::Error;

/// Kinds of dictionary store that can be listed in `DICTIONARY_BACKENDS`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    Filesystem,
    Database,
    Remote,
}

impl FromStr for BackendKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "filesystem" | "fs" => Ok(BackendKind::Filesystem),
            "database" | "db" | "postgres" => Ok(BackendKind::Database),
            "remote" | "http" => Ok(BackendKind::Remote),
            other => anyhow::bail!("Unknown dictionary backend: {}", other),
        }
    }
}

/// Translation provider connection settings.
#[derive(Debug, Clone)]
pub struct TranslatorConfig {
    pub host: String,
    pub api_key: Option<String>,
    pub needs_key: bool,
    pub languages_endpoint: String,
    pub translate_endpoint: String,
    pub detect_endpoint: String,
    pub retries_on_failure: u32,
    pub wait_before_retry: Duration,
    pub timeout: Duration,
}

impl Default for TranslatorConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            api_key: None,
            needs_key: false,
            languages_endpoint: "/languages".to_string(),
            translate_endpoint: "/translate".to_string(),
            detect_endpoint: "/detect".to_string(),
            retries_on_failure: 10,
            wait_before_retry: Duration::from_secs(2),
            timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    // Settings + language set, reloaded every cycle
    pub settings_file: PathBuf,

    // Dictionary stores, in chain order
    pub backends: Vec<BackendKind>,
    pub dictionary_dir: PathBuf,
    pub database_url: Option<String>,
    pub remote_dictionary_url: Option<String>,

    // Translation provider
    pub translator: TranslatorConfig,

    // Sync
    pub sync_workers: usize,

    // Web server
    pub port: u16,
    pub api_key: Option<String>,
}

fn env_or(name: &str, default: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T: FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

fn env_optional(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let backends = env_or("DICTIONARY_BACKENDS", "filesystem")
            .split(',')
            .filter(|s| !s.trim().is_empty())
            .map(BackendKind::from_str)
            .collect::<Result<Vec<_>>>()
            .context("Invalid DICTIONARY_BACKENDS")?;
        if backends.is_empty() {
            anyhow::bail!("DICTIONARY_BACKENDS lists no backends");
        }

        let database_url = env_optional("DATABASE_URL");
        if backends.contains(&BackendKind::Database) && database_url.is_none() {
            anyhow::bail!("DATABASE_URL not set (required by the database backend)");
        }

        let remote_dictionary_url = env_optional("REMOTE_DICTIONARY_URL");
        if backends.contains(&BackendKind::Remote) && remote_dictionary_url.is_none() {
            anyhow::bail!("REMOTE_DICTIONARY_URL not set (required by the remote backend)");
        }

        let translator = TranslatorConfig {
            host: std::env::var("TRANSLATOR_HOST").context("TRANSLATOR_HOST not set")?,
            api_key: env_optional("TRANSLATOR_API_KEY"),
            needs_key: env_parse("TRANSLATOR_NEEDS_KEY", false),
            languages_endpoint: env_or("TRANSLATOR_LANGUAGES_ENDPOINT", "/languages"),
            translate_endpoint: env_or("TRANSLATOR_TRANSLATE_ENDPOINT", "/translate"),
            detect_endpoint: env_or("TRANSLATOR_DETECT_ENDPOINT", "/detect"),
            retries_on_failure: env_parse("TRANSLATOR_RETRIES_ON_FAILURE", 10),
            wait_before_retry: Duration::from_secs(env_parse(
                "TRANSLATOR_WAIT_SECONDS_BEFORE_RETRY",
                2,
            )),
            timeout: Duration::from_secs(env_parse("TRANSLATOR_TIMEOUT_SECONDS", 30u64).max(1)),
        };
        if translator.needs_key && translator.api_key.is_none() {
            anyhow::bail!("TRANSLATOR_API_KEY not set (TRANSLATOR_NEEDS_KEY is true)");
        }

        Ok(Self {
            settings_file: PathBuf::from(env_or("SETTINGS_FILE", "config/translation.json")),
            backends,
            dictionary_dir: PathBuf::from(env_or("DICTIONARY_DIR", "data/dictionaries")),
            database_url,
            remote_dictionary_url,
            translator,
            sync_workers: env_parse("SYNC_WORKERS", 4usize).max(1),
            port: env_parse("PORT", 8080),
            api_key: env_optional("API_KEY"),
        })
    }
}

/// Per-cycle synchronization settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct TranslationSettings {
    #[serde(default)]
    pub default_language: String,

    /// Languages whose dictionaries are not synchronized
    #[serde(default)]
    pub ignored_for_json: Vec<String>,

    /// Languages whose documents are not synchronized
    #[serde(default)]
    pub ignored_for_md: Vec<String>,

    /// Document roots laid out as `<root>/<language>/**.md`
    #[serde(default)]
    pub md_folders: Vec<PathBuf>,

    #[serde(default = "default_minutes_between_cycles")]
    pub minutes_between_cycles: u64,

    /// Delete stored dictionaries of languages no longer configured
    #[serde(default)]
    pub prune_orphaned_dictionaries: bool,
}

fn default_minutes_between_cycles() -> u64 {
    60
}

impl Default for TranslationSettings {
    fn default() -> Self {
        Self {
            default_language: "en".to_string(),
            ignored_for_json: Vec::new(),
            ignored_for_md: Vec::new(),
            md_folders: Vec::new(),
            minutes_between_cycles: default_minutes_between_cycles(),
            prune_orphaned_dictionaries: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SettingsError {
    #[error("DefaultLanguage is not set")]
    MissingDefault,

    #[error("DefaultLanguage '{0}' is not a valid language code")]
    InvalidDefault(String),

    #[error("DefaultLanguage '{language}' is listed in {list}")]
    DefaultIgnored { language: String, list: &'static str },

    #[error("'{code}' in {list} is not a valid language code")]
    InvalidIgnored { code: String, list: &'static str },

    #[error("MinutesBetweenCycles must be at least 1")]
    InvalidInterval,
}

impl TranslationSettings {
    /// Consistency checks run before a cycle touches any data.
    pub fn validate(&self) -> Result<(), SettingsError> {
        let default = self.default_language.trim();
        if default.is_empty() {
            return Err(SettingsError::MissingDefault);
        }
        if !is_valid_code(default) {
            return Err(SettingsError::InvalidDefault(default.to_string()));
        }

        for (list, codes) in [
            ("IgnoredForJson", &self.ignored_for_json),
            ("IgnoredForMd", &self.ignored_for_md),
        ] {
            for code in codes {
                if !is_valid_code(code.trim()) {
                    return Err(SettingsError::InvalidIgnored {
                        code: code.clone(),
                        list,
                    });
                }
                if code.trim().eq_ignore_ascii_case(default) {
                    return Err(SettingsError::DefaultIgnored {
                        language: default.to_string(),
                        list,
                    });
                }
            }
        }

        if self.minutes_between_cycles == 0 {
            return Err(SettingsError::InvalidInterval);
        }
        Ok(())
    }

    pub fn cycle_interval(&self) -> Duration {
        Duration::from_secs(self.minutes_between_cycles.max(1) * 60)
    }
}

/// Layout of the settings file.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct SettingsFile {
    #[serde(flatten)]
    settings: TranslationSettings,

    #[serde(default)]
    languages: Vec<LanguageDescriptor>,
}

/// Where a cycle gets its settings and language set from.
#[async_trait]
pub trait SettingsSource: Send + Sync {
    async fn load_settings(&self) -> Result<TranslationSettings>;

    async fn load_languages(&self) -> Result<Vec<LanguageDescriptor>>;
}

/// Settings read from a JSON file on every call.
pub struct FileSettingsSource {
    path: PathBuf,
}

impl FileSettingsSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn read(&self) -> Result<SettingsFile> {
        let content = tokio::fs::read_to_string(&self.path)
            .await
            .with_context(|| format!("Failed to read settings file {}", self.path.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse settings file {}", self.path.display()))
    }
}

#[async_trait]
impl SettingsSource for FileSettingsSource {
    async fn load_settings(&self) -> Result<TranslationSettings> {
        Ok(self.read().await?.settings)
    }

    async fn load_languages(&self) -> Result<Vec<LanguageDescriptor>> {
        Ok(self.read().await?.languages)
    }
}

/// In-memory settings, replaceable between cycles.
pub struct StaticSettingsSource {
    inner: Mutex<(TranslationSettings, Vec<LanguageDescriptor>)>,
}

impl StaticSettingsSource {
    pub fn new(settings: TranslationSettings, languages: Vec<LanguageDescriptor>) -> Self {
        Self {
            inner: Mutex::new((settings, languages)),
        }
    }

    pub fn set_settings(&self, settings: TranslationSettings) {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .0 = settings;
    }

    pub fn set_languages(&self, languages: Vec<LanguageDescriptor>) {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .1 = languages;
    }
}

#[async_trait]
impl SettingsSource for StaticSettingsSource {
    async fn load_settings(&self) -> Result<TranslationSettings> {
        Ok(self
            .inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .0
            .clone())
    }

    async fn load_languages(&self) -> Result<Vec<LanguageDescriptor>> {
        Ok(self
            .inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .1
            .clone())
    }
}
