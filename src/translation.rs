use crate::config::TranslatorConfig;
use crate::i18n::{primary_subtag, TranslationValidator};
use crate::provider::{Detection, ProviderError, TranslationProvider};
use crate::retry::{with_retry_if, RetryConfig};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TranslationStatus {
    Translated,
    /// The provider does not handle this language pair; text is the original
    Untranslated,
    /// Retries exhausted or a non-retryable error; text is the original
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TranslatedText {
    pub text: String,
    pub status: TranslationStatus,
}

impl TranslatedText {
    fn translated(text: String) -> Self {
        Self {
            text,
            status: TranslationStatus::Translated,
        }
    }

    fn original(text: &str, status: TranslationStatus) -> Self {
        Self {
            text: text.to_string(),
            status,
        }
    }

    pub fn is_translated(&self) -> bool {
        self.status == TranslationStatus::Translated
    }

    pub fn is_failed(&self) -> bool {
        self.status == TranslationStatus::Failed
    }
}

/// Outcome of capability negotiation for the current cycle.
#[derive(Debug, Clone)]
enum Negotiated {
    /// Lowercased code → code as the provider spells it
    Languages(HashMap<String, String>),
    /// Negotiation failed; every language is attempted
    Unknown,
}

impl Negotiated {
    fn resolve(&self, code: &str) -> Option<String> {
        match self {
            Negotiated::Unknown => Some(code.to_string()),
            Negotiated::Languages(codes) => codes
                .get(&code.to_ascii_lowercase())
                .or_else(|| codes.get(&primary_subtag(code).to_ascii_lowercase()))
                .cloned(),
        }
    }
}

/// Translation provider wrapper used by sync cycles.
///
/// - asks the provider for its languages once per cycle and caches the answer
/// - retries transient failures with exponential backoff and jitter
/// - bounds every remote call with a timeout
/// - never fails a unit outright: the original text is returned with a status
pub struct TranslationClient {
    provider: Arc<dyn TranslationProvider>,
    retry: RetryConfig,
    timeout: Duration,
    negotiated: RwLock<Option<Negotiated>>,
}

impl TranslationClient {
    pub fn new(provider: Arc<dyn TranslationProvider>, retry: RetryConfig, timeout: Duration) -> Self {
        Self {
            provider,
            retry,
            timeout,
            negotiated: RwLock::new(None),
        }
    }

    pub fn from_config(provider: Arc<dyn TranslationProvider>, config: &TranslatorConfig) -> Self {
        Self::new(
            provider,
            RetryConfig::translation(config.retries_on_failure, config.wait_before_retry),
            config.timeout,
        )
    }

    /// Forget the negotiated languages; the next call negotiates again.
    pub async fn begin_cycle(&self) {
        *self.negotiated.write().await = None;
    }

    async fn call<T, F, Fut>(&self, operation_name: &str, operation: F) -> Result<T, ProviderError>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = Result<T, ProviderError>>,
    {
        let timeout = self.timeout;
        with_retry_if(
            &self.retry,
            operation_name,
            || {
                let attempt = operation();
                async move {
                    match tokio::time::timeout(timeout, attempt).await {
                        Ok(result) => result,
                        Err(_) => Err(ProviderError::Timeout(timeout)),
                    }
                }
            },
            ProviderError::is_retryable,
        )
        .await
    }

    async fn negotiated(&self) -> Negotiated {
        if let Some(negotiated) = self.negotiated.read().await.as_ref() {
            return negotiated.clone();
        }

        let mut slot = self.negotiated.write().await;
        if let Some(negotiated) = slot.as_ref() {
            return negotiated.clone();
        }

        let negotiated = match self
            .call("Negotiate supported languages", || {
                self.provider.supported_languages()
            })
            .await
        {
            Ok(codes) => {
                debug!("Provider supports: {:?}", codes);
                Negotiated::Languages(
                    codes
                        .into_iter()
                        .map(|code| (code.to_ascii_lowercase(), code))
                        .collect(),
                )
            }
            Err(e) => {
                warn!(
                    "Could not negotiate provider languages, attempting every language: {}",
                    e
                );
                Negotiated::Unknown
            }
        };

        *slot = Some(negotiated.clone());
        negotiated
    }

    /// Whether the provider can translate into `code` this cycle.
    pub async fn supports(&self, code: &str) -> bool {
        self.negotiated().await.resolve(code).is_some()
    }

    /// Translate one unit of text.
    pub async fn translate(&self, text: &str, source: &str, target: &str) -> TranslatedText {
        if text.trim().is_empty() || source.eq_ignore_ascii_case(target) {
            return TranslatedText::original(text, TranslationStatus::Translated);
        }

        let negotiated = self.negotiated().await;
        let (Some(source_code), Some(target_code)) =
            (negotiated.resolve(source), negotiated.resolve(target))
        else {
            debug!("Provider cannot translate {} → {}, keeping original", source, target);
            return TranslatedText::original(text, TranslationStatus::Untranslated);
        };

        let result = self
            .call(&format!("Translation {} → {}", source, target), || {
                self.provider.translate(text, &source_code, &target_code)
            })
            .await;

        match result {
            Ok(translated) => {
                let validation = TranslationValidator::validate(text, &translated);
                if validation.has_errors() {
                    warn!(
                        "Translation validation errors ({} → {}): {:?}",
                        source, target, validation.errors
                    );
                }
                if validation.has_warnings() {
                    warn!(
                        "Translation validation warnings ({} → {}): {:?}",
                        source, target, validation.warnings
                    );
                }
                TranslatedText::translated(translated)
            }
            Err(e) => {
                warn!("Translation {} → {} failed: {}", source, target, e);
                TranslatedText::original(text, TranslationStatus::Failed)
            }
        }
    }

    /// Detect the language of `text`, with the same retry policy.
    pub async fn detect_language(&self, text: &str) -> Result<Detection, ProviderError> {
        self.call("Language detection", || self.provider.detect_language(text))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::status_error;
    use async_trait::async_trait;
    use reqwest::StatusCode;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Provider that fails `failures` times before answering `[target] text`.
    struct FlakyProvider {
        languages: Result<Vec<String>, StatusCode>,
        failures: u32,
        failure: StatusCode,
        translate_calls: AtomicU32,
        language_calls: AtomicU32,
        delay: Duration,
    }

    impl FlakyProvider {
        fn new(failures: u32) -> Self {
            Self {
                languages: Ok(vec!["en".into(), "es".into(), "pt".into()]),
                failures,
                failure: StatusCode::SERVICE_UNAVAILABLE,
                translate_calls: AtomicU32::new(0),
                language_calls: AtomicU32::new(0),
                delay: Duration::ZERO,
            }
        }
    }

    #[async_trait]
    impl TranslationProvider for FlakyProvider {
        async fn supported_languages(&self) -> Result<Vec<String>, ProviderError> {
            self.language_calls.fetch_add(1, Ordering::SeqCst);
            self.languages
                .clone()
                .map_err(|status| status_error(status, "languages unavailable"))
        }

        async fn translate(
            &self,
            text: &str,
            _source: &str,
            target: &str,
        ) -> Result<String, ProviderError> {
            let call = self.translate_calls.fetch_add(1, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            if call < self.failures {
                return Err(status_error(self.failure, "nope"));
            }
            Ok(format!("[{}] {}", target, text))
        }

        async fn detect_language(&self, _text: &str) -> Result<Detection, ProviderError> {
            Ok(Detection {
                language: "es".to_string(),
                confidence: 90.0,
            })
        }
    }

    fn client(provider: Arc<FlakyProvider>, retries: u32) -> TranslationClient {
        TranslationClient::new(
            provider,
            RetryConfig::new(retries + 1, Duration::from_millis(5)),
            Duration::from_secs(5),
        )
    }

    #[tokio::test]
    async fn test_always_failing_provider_makes_exactly_retries_plus_one_attempts() {
        let provider = Arc::new(FlakyProvider::new(u32::MAX));
        let client = client(provider.clone(), 2);

        let result = client.translate("Hello", "en", "es").await;

        assert_eq!(result.status, TranslationStatus::Failed);
        assert_eq!(result.text, "Hello");
        assert_eq!(provider.translate_calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_fail_twice_then_succeed() {
        let provider = Arc::new(FlakyProvider::new(2));
        let client = client(provider.clone(), 2);

        let result = client.translate("Hello", "en", "es").await;

        assert!(result.is_translated());
        assert_eq!(result.text, "[es] Hello");
        assert_eq!(provider.translate_calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_non_retryable_error_fails_immediately() {
        let provider = Arc::new(FlakyProvider {
            failure: StatusCode::BAD_REQUEST,
            ..FlakyProvider::new(u32::MAX)
        });
        let client = client(provider.clone(), 5);

        let result = client.translate("Hello", "en", "es").await;

        assert!(result.is_failed());
        assert_eq!(provider.translate_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_unsupported_target_returns_original_untranslated() {
        let provider = Arc::new(FlakyProvider::new(0));
        let client = client(provider.clone(), 2);

        let result = client.translate("Hello", "en", "ja").await;

        assert_eq!(result.status, TranslationStatus::Untranslated);
        assert_eq!(result.text, "Hello");
        assert_eq!(provider.translate_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_regional_code_falls_back_to_primary_subtag() {
        let provider = Arc::new(FlakyProvider::new(0));
        let client = client(provider, 0);

        let result = client.translate("Hello", "en", "pt-BR").await;
        assert_eq!(result.text, "[pt] Hello");
    }

    #[tokio::test]
    async fn test_negotiation_cached_until_next_cycle() {
        let provider = Arc::new(FlakyProvider::new(0));
        let client = client(provider.clone(), 0);

        client.translate("a", "en", "es").await;
        client.translate("b", "en", "es").await;
        assert!(client.supports("es").await);
        assert_eq!(provider.language_calls.load(Ordering::SeqCst), 1);

        client.begin_cycle().await;
        client.translate("c", "en", "es").await;
        assert_eq!(provider.language_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_failed_negotiation_attempts_every_language() {
        let provider = Arc::new(FlakyProvider {
            languages: Err(StatusCode::NOT_FOUND),
            ..FlakyProvider::new(0)
        });
        let client = client(provider.clone(), 0);

        let result = client.translate("Hello", "en", "ja").await;
        assert_eq!(result.text, "[ja] Hello");
    }

    #[tokio::test]
    async fn test_timeout_counts_as_failed_attempt() {
        let provider = Arc::new(FlakyProvider {
            delay: Duration::from_millis(200),
            ..FlakyProvider::new(0)
        });
        let client = TranslationClient::new(
            provider.clone(),
            RetryConfig::new(2, Duration::from_millis(5)),
            Duration::from_millis(20),
        );

        let result = client.translate("Hello", "en", "es").await;
        assert!(result.is_failed());
        assert_eq!(provider.translate_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_same_language_and_blank_text_skip_provider() {
        let provider = Arc::new(FlakyProvider::new(0));
        let client = client(provider.clone(), 0);

        assert_eq!(client.translate("Hello", "en", "EN").await.text, "Hello");
        assert!(client.translate("   ", "en", "es").await.is_translated());
        assert_eq!(provider.translate_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_detect_language_passes_through() {
        let provider = Arc::new(FlakyProvider::new(0));
        let client = client(provider, 0);

        let detection = client.detect_language("Hola").await.unwrap();
        assert_eq!(detection.language, "es");
    }
}
