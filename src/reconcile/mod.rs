//! Booking inference from repeated calendar observations
//!
//! A single "unavailable" observation is ambiguous: the host may have sold
//! the night, or blocked it. The only signal available is how the date's
//! availability *changes* across repeated crawls, so classification is a
//! state machine over the observation history of each (listing, date):
//!
//! - no observation: `unknown`
//! - first observation available: `available` (baseline)
//! - available → available: corroboration, confidence grows
//! - available → unavailable: `booked`, confidence weighted by lead time
//!   (near-term flips are more likely genuine bookings than far-future
//!   ones, which are more often host blocks placed in advance)
//! - unavailable → available: a cancellation; back to `available` with
//!   confidence reset low
//! - unavailable → unavailable: corroboration of `booked`/`blocked`
//! - first observation ever unavailable: `blocked`, never `booked`; with
//!   no availability baseline there is no evidence of a transaction
//!
//! A date that has passed is frozen: observations stamped later than the
//! date itself are ignored. Gaps in crawl coverage never invent
//! transitions; they only cap how confident the result may claim to be.
//!
//! Classification is a pure function of the ordered history plus the
//! policy, so replaying the same history always reproduces the same
//! result.

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::Result;
use chrono::NaiveDate;
use tracing::debug;

use crate::config::ReconcileConfig;
use crate::metrics;
use crate::models::{CalendarObservation, DateClassification, DateStatus};
use crate::storage::SnapshotStore;
use crate::utils::Clock;

/// Classify one date's observation history
///
/// `observations` must be ordered by `observed_at` ascending and all refer
/// to the same calendar date. Pure: no I/O, no wall clock; `computed_at`
/// is stamped by the caller.
pub fn classify_history(
    observations: &[CalendarObservation],
    cfg: &ReconcileConfig,
) -> (DateStatus, f64) {
    let Some(first) = observations.first() else {
        return (DateStatus::Unknown, 0.0);
    };
    let date = first.date;

    let mut status = DateStatus::Unknown;
    let mut confidence = 0.0_f64;
    let mut prev_available: Option<bool> = None;
    let mut prev_observed_at: Option<chrono::DateTime<chrono::Utc>> = None;
    let mut max_gap_days = 0_i64;

    for obs in observations {
        // Past-date freeze: an observation stamped after the date itself has
        // passed cannot exist naturally and never changes the outcome
        if obs.observed_at.date_naive() > date {
            continue;
        }

        if let Some(prev) = prev_observed_at {
            let gap = (obs.observed_at - prev).num_days();
            max_gap_days = max_gap_days.max(gap);
        }

        match (prev_available, obs.available) {
            // First observation sets the baseline
            (None, true) => {
                status = DateStatus::Available;
                confidence = cfg.baseline_confidence;
            }
            // Unavailable with no prior baseline: no evidence of a state
            // change, so no evidence of a transaction
            (None, false) => {
                status = DateStatus::Blocked;
                confidence = cfg.blocked_confidence;
            }
            // Corroboration of the current state
            (Some(true), true) | (Some(false), false) => {
                confidence = (confidence + cfg.corroboration_step).min(cfg.confidence_cap);
            }
            // The flip: the date closed between two observations
            (Some(true), false) => {
                status = DateStatus::Booked;
                let lead_days = (date - obs.observed_at.date_naive()).num_days();
                confidence = cfg.flip.confidence(lead_days);
            }
            // Reversal: the date reopened; history is ambiguous again
            (Some(false), true) => {
                status = DateStatus::Available;
                confidence = cfg.reversal_confidence;
            }
        }

        prev_available = Some(obs.available);
        prev_observed_at = Some(obs.observed_at);
    }

    // Coverage gaps widen uncertainty without inventing transitions
    if max_gap_days > cfg.gap_days {
        confidence = confidence.min(cfg.gap_confidence_cap);
    }

    (status, confidence)
}

/// Recomputes per-date classifications from stored observation history
pub struct ReconciliationEngine {
    store: Arc<SnapshotStore>,
    cfg: ReconcileConfig,
    clock: Arc<dyn Clock>,
}

impl ReconciliationEngine {
    pub fn new(store: Arc<SnapshotStore>, cfg: ReconcileConfig, clock: Arc<dyn Clock>) -> Self {
        Self { store, cfg, clock }
    }

    /// Recompute every observed date of one listing and persist the result
    ///
    /// Idempotent: replaying an unchanged history yields an identical map.
    pub fn reconcile(&self, listing_id: i64) -> Result<BTreeMap<NaiveDate, DateClassification>> {
        let computed_at = self.clock.now();
        let grouped = self.store.listing_observations(listing_id)?;

        let mut classifications = BTreeMap::new();
        for (date, observations) in &grouped {
            let (status, confidence) = classify_history(observations, &self.cfg);
            classifications.insert(
                *date,
                DateClassification {
                    status,
                    confidence,
                    computed_at,
                },
            );
        }

        self.store
            .replace_classifications(listing_id, &classifications)?;
        metrics::record_reconciled_dates(classifications.len() as u64);
        debug!(
            listing_id,
            dates = classifications.len(),
            "Reconciled listing"
        );
        Ok(classifications)
    }

    /// Reconcile every listing in the store; returns (listings, dates)
    pub fn reconcile_all(&self) -> Result<(usize, usize)> {
        let listings = self.store.all_listings()?;
        let mut dates = 0;
        for listing in &listings {
            dates += self.reconcile(listing.id)?.len();
        }
        Ok((listings.len(), dates))
    }
}
