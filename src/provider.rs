use crate::config::TranslatorConfig;
use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("provider returned HTTP {status}: {body}")]
    Http { status: u16, body: String },

    #[error("unexpected provider response: {0}")]
    InvalidResponse(String),
}

impl ProviderError {
    /// Rate limits, timeouts, 5xx and transport failures are worth retrying;
    /// other client errors will fail the same way again.
    pub fn is_retryable(&self) -> bool {
        match self {
            ProviderError::Http { status, .. } => {
                *status == 408 || *status == 429 || *status >= 500
            }
            ProviderError::InvalidResponse(_) => false,
            ProviderError::Request(_) | ProviderError::Timeout(_) => true,
        }
    }
}

/// Result of language detection; `confidence` is a percentage (0-100).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub language: String,
    pub confidence: f64,
}

/// A remote machine-translation service.
#[async_trait]
pub trait TranslationProvider: Send + Sync {
    /// Language codes the provider can translate between.
    async fn supported_languages(&self) -> Result<Vec<String>, ProviderError>;

    async fn translate(
        &self,
        text: &str,
        source: &str,
        target: &str,
    ) -> Result<String, ProviderError>;

    async fn detect_language(&self, text: &str) -> Result<Detection, ProviderError>;
}

/// LibreTranslate translate request
#[derive(Debug, Serialize)]
struct TranslateRequest<'a> {
    q: &'a str,
    source: &'a str,
    target: &'a str,
    format: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    api_key: Option<&'a str>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TranslateResponse {
    translated_text: String,
}

#[derive(Debug, Serialize)]
struct DetectRequest<'a> {
    q: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    api_key: Option<&'a str>,
}

#[derive(Debug, Deserialize)]
struct LanguageEntry {
    code: String,
}

/// Provider speaking the LibreTranslate-compatible JSON API.
pub struct HttpProvider {
    client: reqwest::Client,
    config: TranslatorConfig,
}

impl HttpProvider {
    pub fn new(client: reqwest::Client, config: TranslatorConfig) -> Self {
        Self { client, config }
    }

    fn url(&self, endpoint: &str) -> String {
        format!(
            "{}/{}",
            self.config.host.trim_end_matches('/'),
            endpoint.trim_start_matches('/')
        )
    }

    fn api_key(&self) -> Option<&str> {
        if self.config.needs_key {
            self.config.api_key.as_deref()
        } else {
            None
        }
    }

    async fn check(response: reqwest::Response) -> Result<reqwest::Response, ProviderError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response
            .text()
            .await
            .unwrap_or_else(|e| format!("<failed to read body: {}>", e));
        Err(ProviderError::Http {
            status: status.as_u16(),
            body,
        })
    }
}

#[async_trait]
impl TranslationProvider for HttpProvider {
    async fn supported_languages(&self) -> Result<Vec<String>, ProviderError> {
        let response = self
            .client
            .get(self.url(&self.config.languages_endpoint))
            .send()
            .await?;
        let languages: Vec<LanguageEntry> = Self::check(response)
            .await?
            .json()
            .await
            .map_err(|e| ProviderError::InvalidResponse(e.to_string()))?;

        debug!("Provider supports {} languages", languages.len());
        Ok(languages.into_iter().map(|l| l.code).collect())
    }

    async fn translate(
        &self,
        text: &str,
        source: &str,
        target: &str,
    ) -> Result<String, ProviderError> {
        let request = TranslateRequest {
            q: text,
            source,
            target,
            format: "text",
            api_key: self.api_key(),
        };

        let response = self
            .client
            .post(self.url(&self.config.translate_endpoint))
            .json(&request)
            .send()
            .await?;
        let body: TranslateResponse = Self::check(response)
            .await?
            .json()
            .await
            .map_err(|e| ProviderError::InvalidResponse(e.to_string()))?;

        Ok(body.translated_text)
    }

    async fn detect_language(&self, text: &str) -> Result<Detection, ProviderError> {
        let request = DetectRequest {
            q: text,
            api_key: self.api_key(),
        };

        let response = self
            .client
            .post(self.url(&self.config.detect_endpoint))
            .json(&request)
            .send()
            .await?;
        let detections: Vec<Detection> = Self::check(response)
            .await?
            .json()
            .await
            .map_err(|e| ProviderError::InvalidResponse(e.to_string()))?;

        detections
            .into_iter()
            .max_by(|a, b| a.confidence.total_cmp(&b.confidence))
            .ok_or_else(|| ProviderError::InvalidResponse("empty detection list".to_string()))
    }
}

/// Map an HTTP status onto a provider error for non-reqwest callers.
pub fn status_error(status: StatusCode, body: impl Into<String>) -> ProviderError {
    ProviderError::Http {
        status: status.as_u16(),
        body: body.into(),
    }
}
