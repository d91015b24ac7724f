use super::{
    decode_dictionary, ensure_storable, DictionaryStore, StoreCapabilities, StoreError,
    StoredDictionary,
};
use crate::retry::{with_retry_if, RetryConfig};
use async_trait::async_trait;
use reqwest::StatusCode;

/// Read-only dictionaries published over HTTP at `<base_url>/<code>.json`.
///
/// Typically a CDN or a release bucket another system writes to; this store
/// only ever reads from it.
pub struct RemoteStore {
    client: reqwest::Client,
    base_url: String,
    retry: RetryConfig,
}

impl RemoteStore {
    pub fn new(client: reqwest::Client, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            retry: RetryConfig::remote_fetch(),
        }
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    fn url_for(&self, language: &str) -> Result<String, StoreError> {
        ensure_storable(language)?;
        Ok(format!("{}/{}.json", self.base_url, language))
    }
}

/// 404 is an answer, not a failure; other 4xx will not improve on retry.
fn is_retryable(error: &StoreError) -> bool {
    match error {
        StoreError::NotFound(_) | StoreError::Corrupt { .. } => false,
        StoreError::Remote(message) => !message.starts_with("HTTP 4"),
        _ => true,
    }
}

#[async_trait]
impl DictionaryStore for RemoteStore {
    fn name(&self) -> String {
        format!("remote:{}", self.base_url)
    }

    fn capabilities(&self) -> StoreCapabilities {
        StoreCapabilities::READ_ONLY
    }

    async fn save_dictionary(
        &self,
        _language: &str,
        _data: &StoredDictionary,
    ) -> Result<(), StoreError> {
        Err(StoreError::unsupported(&self.name(), "save_dictionary"))
    }

    async fn load_dictionary(&self, language: &str) -> Result<StoredDictionary, StoreError> {
        let url = self.url_for(language)?;

        with_retry_if(
            &self.retry,
            &format!("Fetch remote dictionary '{}'", language),
            || async {
                let response = self
                    .client
                    .get(&url)
                    .send()
                    .await
                    .map_err(|e| StoreError::Remote(format!("request failed: {}", e)))?;

                let status = response.status();
                if status == StatusCode::NOT_FOUND {
                    return Err(StoreError::NotFound(language.to_string()));
                }
                if !status.is_success() {
                    return Err(StoreError::Remote(format!("HTTP {}", status.as_u16())));
                }

                let body = response
                    .bytes()
                    .await
                    .map_err(|e| StoreError::Remote(format!("failed to read body: {}", e)))?;
                decode_dictionary(language, &body)
            },
            is_retryable,
        )
        .await
    }

    async fn list_available_languages(&self) -> Result<Vec<String>, StoreError> {
        Err(StoreError::unsupported(&self.name(), "list_available_languages"))
    }

    async fn dictionary_exists(&self, _language: &str) -> Result<bool, StoreError> {
        Err(StoreError::unsupported(&self.name(), "dictionary_exists"))
    }

    async fn delete_dictionary(&self, _language: &str) -> Result<(), StoreError> {
        Err(StoreError::unsupported(&self.name(), "delete_dictionary"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use wiremock::{
        matchers::{method, path},
        Mock, MockServer, ResponseTemplate,
    };

    fn fast_retry() -> RetryConfig {
        RetryConfig::new(3, Duration::from_millis(10))
    }

    #[tokio::test]
    async fn test_load_flat_remote_dictionary() {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/dictionaries/en.json"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({"greeting": "Hello", "farewell": "Bye"})),
            )
            .mount(&mock_server)
            .await;

        let store = RemoteStore::new(
            reqwest::Client::new(),
            format!("{}/dictionaries/", mock_server.uri()),
        );
        let dictionary = store.load_dictionary("en").await.expect("Should load");

        assert_eq!(dictionary.entries["greeting"], "Hello");
        assert_eq!(dictionary.len(), 2);
    }

    #[tokio::test]
    async fn test_missing_remote_dictionary_is_not_found_without_retry() {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/fr.json"))
            .respond_with(ResponseTemplate::new(404))
            .expect(1)
            .mount(&mock_server)
            .await;

        let store = RemoteStore::new(reqwest::Client::new(), mock_server.uri())
            .with_retry(fast_retry());
        let result = store.load_dictionary("fr").await;

        assert!(matches!(result, Err(StoreError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_server_error_is_retried() {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/de.json"))
            .respond_with(ResponseTemplate::new(503))
            .up_to_n_times(1)
            .mount(&mock_server)
            .await;
        Mock::given(method("GET"))
            .and(path("/de.json"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"a": "b"})))
            .mount(&mock_server)
            .await;

        let store = RemoteStore::new(reqwest::Client::new(), mock_server.uri())
            .with_retry(fast_retry());
        let dictionary = store.load_dictionary("de").await.expect("Should recover");
        assert_eq!(dictionary.entries["a"], "b");
    }

    #[tokio::test]
    async fn test_invalid_body_is_corrupt() {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/it.json"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<html>oops</html>"))
            .expect(1)
            .mount(&mock_server)
            .await;

        let store = RemoteStore::new(reqwest::Client::new(), mock_server.uri())
            .with_retry(fast_retry());
        assert!(matches!(
            store.load_dictionary("it").await,
            Err(StoreError::Corrupt { .. })
        ));
    }

    #[tokio::test]
    async fn test_remote_store_is_read_only() {
        let store = RemoteStore::new(reqwest::Client::new(), "http://unused.test");
        assert!(store.is_read_only());
        assert!(matches!(
            store.save_dictionary("es", &StoredDictionary::new()).await,
            Err(StoreError::Unsupported { .. })
        ));
    }
}
