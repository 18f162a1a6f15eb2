pub mod auth;
pub mod config;
pub mod db;
pub mod error;
pub mod gateway;
pub mod models;
pub mod routes;

use std::sync::Arc;

use config::Config;
use db::kv::{KeyValueStore, MemoryKv};
use db::memory::MemoryStore;
use gateway::{Hub, MessageRouter};

/// Shared application state available to all route handlers.
#[derive(Clone)]
pub struct AppState {
    pub hub: Hub,
    pub router: Arc<MessageRouter>,
    pub store: Arc<MemoryStore>,
    pub kv: Arc<dyn KeyValueStore>,
    pub config: Arc<Config>,
}

impl AppState {
    /// Wire the in-memory collaborators, start the hub and build the inbound
    /// router on top of it. Must be called inside a tokio runtime.
    pub fn new(config: Config) -> Self {
        let store = Arc::new(MemoryStore::new());
        let kv: Arc<dyn KeyValueStore> = Arc::new(MemoryKv::new());

        let hub = Hub::spawn(config.hub.clone(), store.clone());
        let router = Arc::new(MessageRouter::new(
            store.clone(),
            Arc::new(hub.clone()),
            config.router.clone(),
        ));

        Self {
            hub,
            router,
            store,
            kv,
            config: Arc::new(config),
        }
    }
}
