use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;

use crate::alert::{AlertDispatcher, AlertHistory};
use crate::config::EngineConfig;
use crate::detect::{DetectorConfig, DetectorRegistry};
use crate::query::QueryEngine;
use crate::scheduler::{DetectionRunner, Scheduler};
use crate::storage::{open_pool, EventStore, Ingestor, Journal, StoreOptions};

/// Everything a running engine shares between the API, scheduler and CLI.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<EngineConfig>,
    pub store: EventStore,
    pub ingestor: Ingestor,
    pub runner: DetectionRunner,
    pub scheduler: Scheduler,
}

impl AppState {
    /// Open the journal (if configured) and wire every component.
    pub fn from_config(config: EngineConfig) -> Result<Self> {
        let options = StoreOptions::from(&config.storage);
        let (store, pool) = match &config.storage.journal_path {
            Some(path) => {
                let path = path.to_string_lossy();
                tracing::info!(db_path = %path, "Initializing database");
                let pool = open_pool(&path)
                    .with_context(|| format!("failed to open journal at {path}"))?;
                let store = EventStore::open(options, Journal::new(pool.clone()))
                    .context("failed to replay journal")?;
                (store, Some(pool))
            }
            None => (EventStore::in_memory(options), None),
        };

        let engine = if config.engine.cache_enabled {
            QueryEngine::with_cache_capacity(store.clone(), config.engine.cache_capacity)
        } else {
            QueryEngine::new(store.clone())
        };

        let mut dispatcher = AlertDispatcher::from_config(config.rules.clone(), &config.channels)
            .context("failed to configure alert channels")?;
        if let Some(pool) = pool {
            dispatcher = dispatcher.with_history(AlertHistory::new(pool));
        }

        let runner = DetectionRunner {
            engine,
            registry: Arc::new(DetectorRegistry::new(DetectorConfig::from(&config.engine))),
            dispatcher: Arc::new(dispatcher),
            query_timeout: config.engine.query_timeout,
        };
        let scheduler = Scheduler::new(config.detections.clone(), Utc::now())?;
        let ingestor = Ingestor::new(store.clone(), config.engine.ingest_retries);

        Ok(Self {
            config: Arc::new(config),
            store,
            ingestor,
            runner,
            scheduler,
        })
    }

    pub fn engine(&self) -> &QueryEngine {
        &self.runner.engine
    }
}
