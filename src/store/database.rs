use super::{ensure_storable, DictionaryStore, StoreCapabilities, StoreError, StoredDictionary};
use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions};
use tracing::{debug, info};

/// PostgreSQL-backed dictionaries.
///
/// Schema:
/// - `dictionary_languages(language, saved_at)` records which languages have
///   a dictionary at all (so an empty dictionary is distinguishable from a
///   missing one)
/// - `dictionary_entries(language, key, value, fingerprint)` holds the phrases
///
/// A save replaces a language's rows inside one transaction.
#[derive(Clone)]
pub struct DatabaseStore {
    pool: PgPool,
}

impl DatabaseStore {
    /// Connect and create tables if they do not exist yet.
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await?;

        let store = Self { pool };
        store.migrate().await?;
        info!("✓ Dictionary database ready");
        Ok(store)
    }

    /// Use an existing pool (tables are created if missing).
    pub async fn from_pool(pool: PgPool) -> Result<Self, StoreError> {
        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS dictionary_languages (
                language TEXT PRIMARY KEY,
                saved_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS dictionary_entries (
                language TEXT NOT NULL REFERENCES dictionary_languages(language) ON DELETE CASCADE,
                key TEXT NOT NULL,
                value TEXT NOT NULL,
                fingerprint TEXT,
                PRIMARY KEY (language, key)
            )",
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

#[async_trait]
impl DictionaryStore for DatabaseStore {
    fn name(&self) -> String {
        "database:postgres".to_string()
    }

    fn capabilities(&self) -> StoreCapabilities {
        StoreCapabilities::FULL
    }

    async fn save_dictionary(
        &self,
        language: &str,
        data: &StoredDictionary,
    ) -> Result<(), StoreError> {
        ensure_storable(language)?;
        let mut tx = self.pool.begin().await?;

        // Row lock on the language serializes concurrent writers
        sqlx::query(
            "INSERT INTO dictionary_languages (language, saved_at) VALUES ($1, NOW())
             ON CONFLICT (language) DO UPDATE SET saved_at = NOW()",
        )
        .bind(language)
        .execute(&mut *tx)
        .await?;

        sqlx::query("DELETE FROM dictionary_entries WHERE language = $1")
            .bind(language)
            .execute(&mut *tx)
            .await?;

        for (key, value) in &data.entries {
            sqlx::query(
                "INSERT INTO dictionary_entries (language, key, value, fingerprint)
                 VALUES ($1, $2, $3, $4)",
            )
            .bind(language)
            .bind(key)
            .bind(value)
            .bind(data.fingerprints.get(key).map(String::as_str))
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        debug!("Saved {} entries for '{}' to database", data.len(), language);
        Ok(())
    }

    async fn load_dictionary(&self, language: &str) -> Result<StoredDictionary, StoreError> {
        if !self.dictionary_exists(language).await? {
            return Err(StoreError::NotFound(language.to_string()));
        }

        let rows: Vec<(String, String, Option<String>)> = sqlx::query_as(
            "SELECT key, value, fingerprint FROM dictionary_entries WHERE language = $1",
        )
        .bind(language)
        .fetch_all(&self.pool)
        .await?;

        let mut dictionary = StoredDictionary::new();
        for (key, value, fingerprint) in rows {
            match fingerprint {
                Some(fingerprint) => dictionary.insert_translated(&key, value, fingerprint),
                None => dictionary.insert_unverified(&key, value),
            }
        }
        Ok(dictionary)
    }

    async fn list_available_languages(&self) -> Result<Vec<String>, StoreError> {
        let rows: Vec<(String,)> =
            sqlx::query_as("SELECT language FROM dictionary_languages ORDER BY language")
                .fetch_all(&self.pool)
                .await?;
        Ok(rows.into_iter().map(|(language,)| language).collect())
    }

    async fn dictionary_exists(&self, language: &str) -> Result<bool, StoreError> {
        let (exists,): (bool,) = sqlx::query_as(
            "SELECT EXISTS(SELECT 1 FROM dictionary_languages WHERE language = $1)",
        )
        .bind(language)
        .fetch_one(&self.pool)
        .await?;
        Ok(exists)
    }

    async fn delete_dictionary(&self, language: &str) -> Result<(), StoreError> {
        let result = sqlx::query("DELETE FROM dictionary_languages WHERE language = $1")
            .bind(language)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(language.to_string()));
        }
        Ok(())
    }

    async fn get_translation(
        &self,
        language: &str,
        key: &str,
    ) -> Result<Option<String>, StoreError> {
        let row: Option<(String,)> = sqlx::query_as(
            "SELECT value FROM dictionary_entries WHERE language = $1 AND key = $2",
        )
        .bind(language)
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|(value,)| value))
    }
}

#[cfg(test)]
mod tests {
    //! These tests need a disposable PostgreSQL database:
    //! `TEST_DATABASE_URL=postgres://... cargo test -- --ignored`

    use super::*;
    use crate::store::fingerprint;

    async fn connect() -> DatabaseStore {
        let url = std::env::var("TEST_DATABASE_URL").expect("TEST_DATABASE_URL not set");
        DatabaseStore::connect(&url).await.expect("Should connect")
    }

    #[tokio::test]
    #[ignore]
    async fn test_round_trip_with_fingerprints() {
        let store = connect().await;
        let mut dictionary = StoredDictionary::new();
        dictionary.insert_translated("greeting", "Hola".to_string(), fingerprint("Hello"));
        dictionary.insert_unverified("farewell", "Goodbye".to_string());

        store.save_dictionary("es", &dictionary).await.unwrap();
        assert_eq!(store.load_dictionary("es").await.unwrap(), dictionary);
        assert_eq!(
            store.get_translation("es", "greeting").await.unwrap(),
            Some("Hola".to_string())
        );
    }

    #[tokio::test]
    #[ignore]
    async fn test_save_replaces_previous_entries() {
        let store = connect().await;
        let mut first = StoredDictionary::new();
        first.insert_unverified("old", "x".to_string());
        store.save_dictionary("de", &first).await.unwrap();

        let mut second = StoredDictionary::new();
        second.insert_unverified("new", "y".to_string());
        store.save_dictionary("de", &second).await.unwrap();

        assert_eq!(store.load_dictionary("de").await.unwrap(), second);
    }

    #[tokio::test]
    #[ignore]
    async fn test_empty_dictionary_exists_and_delete() {
        let store = connect().await;
        store
            .save_dictionary("fr", &StoredDictionary::new())
            .await
            .unwrap();
        assert!(store.dictionary_exists("fr").await.unwrap());
        assert!(store.load_dictionary("fr").await.unwrap().is_empty());

        store.delete_dictionary("fr").await.unwrap();
        assert!(matches!(
            store.load_dictionary("fr").await,
            Err(StoreError::NotFound(_))
        ));
    }
}
