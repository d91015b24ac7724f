use anyhow::{Context, Result};
use locale_sync::config::{BackendKind, Config, FileSettingsSource};
use locale_sync::orchestrator::{trigger_channel, Orchestrator, Trigger};
use locale_sync::progress::ProgressPublisher;
use locale_sync::provider::HttpProvider;
use locale_sync::scheduler::{period_for_minutes, CycleTimer};
use locale_sync::server::{self, AppState};
use locale_sync::store::{BackendChain, DatabaseStore, FilesystemStore, RemoteStore};
use locale_sync::translation::TranslationClient;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file (ignored in production)
    let _ = dotenvy::dotenv();

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("locale_sync=info".parse()?),
        )
        .init();

    info!("Starting locale-sync");

    let config = Config::from_env()?;
    let http = reqwest::Client::new();

    let chain = build_chain(&config, &http).await?;
    for (tag, capabilities) in chain.describe() {
        info!("Dictionary store '{}': {:?}", tag, capabilities);
    }

    let provider = Arc::new(HttpProvider::new(http, config.translator.clone()));
    let client = Arc::new(TranslationClient::from_config(provider, &config.translator));
    let publisher = Arc::new(ProgressPublisher::default());
    let settings = Arc::new(FileSettingsSource::new(&config.settings_file));

    let orchestrator = Arc::new(Orchestrator::new(
        settings,
        chain,
        client,
        publisher.clone(),
        config.sync_workers,
    ));

    let cancel = CancellationToken::new();
    let (trigger, triggers) = trigger_channel();

    let minutes = orchestrator.interval_updates();
    let initial = period_for_minutes(*minutes.borrow());
    let timer = Arc::new(CycleTimer::start(trigger.clone(), initial).await?);
    let follower = timer.clone().follow(minutes, cancel.clone());

    // First cycle runs right away
    trigger.trigger(Trigger::Manual);

    let cycles = {
        let orchestrator = orchestrator.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { orchestrator.run(triggers, cancel).await })
    };

    let state = AppState {
        publisher,
        trigger,
        api_key: config.api_key.clone(),
        cancel: cancel.clone(),
    };
    let server = tokio::spawn(server::serve(state, config.port));

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    info!("Shutdown requested");
    cancel.cancel();

    if let Err(e) = timer.shutdown().await {
        error!("Failed to stop scheduler: {}", e);
    }
    let _ = follower.await;
    let _ = cycles.await;
    match server.await {
        Ok(Err(e)) => error!("HTTP server failed: {}", e),
        Err(e) => error!("HTTP server task panicked: {}", e),
        Ok(Ok(())) => {}
    }

    info!("✓ locale-sync stopped");
    Ok(())
}

/// Stores in `DICTIONARY_BACKENDS` order; the first one that answers wins.
async fn build_chain(config: &Config, http: &reqwest::Client) -> Result<BackendChain> {
    let mut chain = BackendChain::new();
    for backend in &config.backends {
        chain = match backend {
            BackendKind::Filesystem => chain.with_store(
                "filesystem",
                Arc::new(FilesystemStore::new(&config.dictionary_dir)),
            ),
            BackendKind::Database => {
                let url = config
                    .database_url
                    .as_deref()
                    .context("DATABASE_URL not set")?;
                let store = DatabaseStore::connect(url)
                    .await
                    .context("Failed to connect to dictionary database")?;
                chain.with_store("database", Arc::new(store))
            }
            BackendKind::Remote => {
                let url = config
                    .remote_dictionary_url
                    .as_deref()
                    .context("REMOTE_DICTIONARY_URL not set")?;
                chain.with_store("remote", Arc::new(RemoteStore::new(http.clone(), url)))
            }
        };
    }
    Ok(chain)
}
