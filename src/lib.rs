pub mod config;
pub mod diff;
pub mod documents;
pub mod i18n;
pub mod orchestrator;
pub mod progress;
pub mod provider;
pub mod retry;
pub mod scheduler;
pub mod server;
pub mod store;
pub mod translation;
