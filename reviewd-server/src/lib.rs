pub mod admin;
pub mod config;
pub mod db;
pub mod fetcher;
pub mod gitlab;
pub mod orchestrator;
pub mod poster;
pub mod reviewer;
pub mod runtime;
#[cfg(test)]
pub mod test_support;
pub mod webhook;

use std::sync::Arc;

use crate::db::SqliteDb;
use crate::gitlab::ProviderFactory;
use crate::runtime::Dispatcher;

/// Shared state for the HTTP handlers.
pub struct AppState {
    pub db: Arc<SqliteDb>,
    pub dispatcher: Arc<dyn Dispatcher>,
    pub providers: Arc<dyn ProviderFactory>,
    pub encryption_key: Vec<u8>,
}
