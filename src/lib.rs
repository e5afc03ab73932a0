//! ondol - Seoul Stay-Market Occupancy Crawler
//!
//! Periodically samples a stay marketplace's per-listing availability
//! calendars around geographic targets and turns the repeated snapshots
//! into an estimate of real bookings, occupancy and revenue, while
//! respecting an anti-scraping posture.
//!
//! # Architecture
//!
//! The library is organized into several modules:
//!
//! - [`config`] - Tiered configuration (coverage, pacing, budgets, policies)
//! - [`crawler`] - Governed fetch scheduling, identity rotation, sweeps
//! - [`storage`] - Append-only observation store (SQLite)
//! - [`reconcile`] - Booking inference from observation history
//! - [`analysis`] - Daily occupancy and revenue statistics
//! - [`models`] - Core data structures and types
//! - [`metrics`] - Prometheus observability surface
//! - [`utils`] - Clock abstraction and helpers
//!
//! # Example
//!
//! ```no_run
//! use ondol::commands::Engine;
//! use ondol::config::Config;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::from_env()?;
//!     let engine = Engine::new(config)?;
//!     ondol::commands::crawl::run_search_sweep(&engine).await?;
//!     Ok(())
//! }
//! ```

pub mod analysis;
pub mod commands;
pub mod config;
pub mod crawler;
pub mod error;
pub mod metrics;
pub mod models;
pub mod reconcile;
pub mod storage;
pub mod utils;

/// Re-export commonly used types
pub mod prelude {
    pub use crate::analysis::AggregationEngine;
    pub use crate::config::{Config, CrawlTier};
    pub use crate::crawler::{FetchScheduler, RateGovernor, StayApi, Sweeper, TaskKind};
    pub use crate::error::{Error, ErrorCategory, OndolErrorTrait, Result};
    pub use crate::models::{
        CalendarObservation, DailyStat, DateClassification, DateStatus, Listing, Target,
    };
    pub use crate::reconcile::ReconciliationEngine;
    pub use crate::storage::SnapshotStore;
    pub use crate::utils::{Clock, ManualClock, SystemClock};
}

// Direct re-exports for convenience
pub use models::{DateStatus, Listing, Target};
