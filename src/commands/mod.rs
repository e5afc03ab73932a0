//! CLI command implementations
//!
//! [`Engine`] wires the components together the same way for every command:
//! one store, one governor (the single choke point for the remote host), one
//! API client, and a fresh scheduler per sweep.

pub mod crawl;
pub mod report;

use std::sync::Arc;

use anyhow::{Context, Result};

use crate::analysis::AggregationEngine;
use crate::config::Config;
use crate::crawler::{host_of, FetchScheduler, HttpStayApi, IdentityPool, RateGovernor, StayApi, Sweeper};
use crate::reconcile::ReconciliationEngine;
use crate::storage::SnapshotStore;
use crate::utils::{Clock, SystemClock};

/// Shared component wiring for all commands
pub struct Engine {
    pub config: Config,
    pub store: Arc<SnapshotStore>,
    pub governor: Arc<RateGovernor>,
    pub clock: Arc<dyn Clock>,
    api: Arc<dyn StayApi>,
    host: String,
}

impl Engine {
    pub fn new(config: Config) -> Result<Self> {
        config.validate().context("Invalid configuration")?;

        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let store = Arc::new(SnapshotStore::new(&config.database.sqlite_path)?);
        let identities = IdentityPool::new(config.user_agents(), &config.identity, clock.clone());
        let governor = Arc::new(RateGovernor::new(
            config.governor.clone(),
            identities,
            clock.clone(),
        ));
        let api: Arc<dyn StayApi> = Arc::new(
            HttpStayApi::new(config.api.clone(), config.crawl.clone(), governor.clone())
                .context("Failed to create API client")?,
        );
        let host = host_of(&config.api.base_url).context("Invalid api.base_url")?;

        Ok(Self {
            config,
            store,
            governor,
            clock,
            api,
            host,
        })
    }

    /// Governor key of the configured API host
    pub fn host(&self) -> &str {
        &self.host
    }

    /// A scheduler wired to a fresh sweeper (one per sweep run)
    pub fn scheduler(&self) -> Arc<FetchScheduler> {
        let sweeper = Arc::new(Sweeper::new(
            self.api.clone(),
            self.store.clone(),
            self.governor.clone(),
            self.clock.clone(),
            self.config.crawl.clone(),
            self.host.clone(),
        ));
        Arc::new(FetchScheduler::new(
            self.governor.clone(),
            sweeper,
            self.clock.clone(),
            self.config.scheduler.clone(),
        ))
    }

    pub fn reconciler(&self) -> ReconciliationEngine {
        ReconciliationEngine::new(
            self.store.clone(),
            self.config.reconcile.clone(),
            self.clock.clone(),
        )
    }

    pub fn aggregator(&self) -> AggregationEngine {
        AggregationEngine::new(
            self.store.clone(),
            self.config.aggregate.clone(),
            self.clock.clone(),
        )
    }
}
