//! Application state management

use std::sync::Arc;

use sqlx::SqlitePool;

use crate::config::Config;
use crate::entities::{EntityStore, SqliteEntityStore};
use crate::events::EventBus;
use crate::sync::SyncEngine;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    config: Config,
    db: SqlitePool,
    store: Arc<dyn EntityStore>,
    events: EventBus,
    engine: SyncEngine,
}

impl AppState {
    /// Create the state over a SQLite-backed entity store
    pub fn new(config: Config, db: SqlitePool) -> Self {
        let store: Arc<dyn EntityStore> = Arc::new(SqliteEntityStore::new(db.clone()));
        Self::with_store(config, db, store)
    }

    /// Create the state over a custom entity store
    pub fn with_store(config: Config, db: SqlitePool, store: Arc<dyn EntityStore>) -> Self {
        let events = EventBus::new();
        let engine = SyncEngine::new(db.clone(), store.clone(), events.clone(), config.sync.clone());

        Self {
            inner: Arc::new(AppStateInner {
                config,
                db,
                store,
                events,
                engine,
            }),
        }
    }

    /// Get the configuration
    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    /// Get the database pool
    pub fn db(&self) -> &SqlitePool {
        &self.inner.db
    }

    /// Get the entity store
    pub fn store(&self) -> &dyn EntityStore {
        self.inner.store.as_ref()
    }

    /// Get the change event bus
    pub fn events(&self) -> &EventBus {
        &self.inner.events
    }

    /// Get the sync engine
    pub fn engine(&self) -> &SyncEngine {
        &self.inner.engine
    }
}
