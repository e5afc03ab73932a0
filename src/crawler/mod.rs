//! Crawl orchestration with anti-blocking controls
//!
//! The crawl side of the engine: per-host pacing and circuit breaking
//! ([`governor`]), identity rotation ([`identity`]), the priority task queue
//! ([`scheduler`]), payload extraction ([`parse`]), the marketplace API
//! boundary ([`client`]) and sweep execution ([`sweep`]).
//!
//! The governor is the single choke point for the remote host: the scheduler
//! consults it before every dispatch and the sweeper reports every outcome
//! back to it. No component issues a request around it.

pub mod client;
pub mod governor;
pub mod identity;
pub mod parse;
pub mod scheduler;
pub mod sweep;

pub use client::{host_of, HttpStayApi, StayApi};
pub use governor::{Decision, FetchOutcome, GovernorStats, RateGovernor};
pub use identity::{Identity, IdentityPool};
pub use scheduler::{FetchScheduler, FetchTask, SchedulerReport, TaskKind, TaskRunner};
pub use sweep::Sweeper;
