//! Daily occupancy and revenue statistics
//!
//! Statistics are always recomputed from scratch out of the derived
//! classifications plus the price history, never accumulated
//! incrementally, so a recompute over unchanged inputs is bit-identical
//! and drift cannot build up.
//!
//! Occupancy counts `booked` against the sellable denominator
//! (`booked` + `available`). `unknown` dates carry no evidence and are
//! always excluded; host-`blocked` dates were never sellable and are
//! excluded by default, though the denominator policy is configurable.
//! Estimated revenue sums the last observed price of each booked date.

use std::sync::Arc;

use anyhow::Result;
use chrono::{Datelike, NaiveDate};
use statrs::statistics::{Data, Distribution};
use tracing::{debug, info};

use crate::config::AggregateConfig;
use crate::models::{DailyStat, DateStatus, RoomType};
use crate::storage::SnapshotStore;
use crate::utils::Clock;

/// Summary of one aggregation run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AggregateSummary {
    pub targets_processed: usize,
    pub rows_written: usize,
}

/// Recomputes per-(target, date, room-type) statistics
pub struct AggregationEngine {
    store: Arc<SnapshotStore>,
    cfg: AggregateConfig,
    clock: Arc<dyn Clock>,
}

impl AggregationEngine {
    pub fn new(store: Arc<SnapshotStore>, cfg: AggregateConfig, clock: Arc<dyn Clock>) -> Self {
        Self { store, cfg, clock }
    }

    /// Recompute and persist one daily stat row
    pub fn aggregate(
        &self,
        target_id: i64,
        date: NaiveDate,
        room_type: Option<RoomType>,
    ) -> Result<DailyStat> {
        let listings = self.store.listings_for_target(target_id, room_type)?;

        let mut booked = 0_i64;
        let mut available = 0_i64;
        let mut blocked = 0_i64;
        let mut booked_prices = Vec::new();

        for listing in &listings {
            let status = self
                .store
                .classification(listing.id, date)?
                .map(|c| c.status)
                .unwrap_or(DateStatus::Unknown);
            match status {
                DateStatus::Booked => {
                    booked += 1;
                    if let Some(price) = self
                        .store
                        .latest_observation(listing.id, date)?
                        .and_then(|obs| obs.price)
                    {
                        booked_prices.push(price);
                    }
                }
                DateStatus::Available => available += 1,
                DateStatus::Blocked => blocked += 1,
                DateStatus::Unknown => {}
            }
        }

        let mut denominator = booked + available;
        if self.cfg.count_blocked_in_denominator {
            denominator += blocked;
        }
        let occupancy_rate = if denominator > 0 {
            booked as f64 / denominator as f64
        } else {
            0.0
        };

        let estimated_revenue: f64 = booked_prices.iter().sum();
        let avg_daily_price = if booked_prices.is_empty() {
            0.0
        } else {
            Data::new(booked_prices).mean().unwrap_or(0.0)
        };

        let stat = DailyStat {
            target_id,
            date,
            room_type,
            total_listings: listings.len() as i64,
            booked_count: booked,
            occupancy_rate,
            avg_daily_price,
            estimated_revenue,
        };
        self.store.replace_daily_stat(&stat)?;

        debug!(
            target_id,
            %date,
            room_type = room_type.map(|rt| rt.as_str()).unwrap_or("all"),
            booked,
            available,
            blocked,
            occupancy = format!("{occupancy_rate:.2}"),
            "Aggregated"
        );
        Ok(stat)
    }

    /// Recompute every target for one date, per room type plus the rollup
    ///
    /// Room-type slices with no listings are skipped, matching how the
    /// stats are consumed (a missing row means no inventory, not zero).
    pub fn aggregate_all(&self, date: NaiveDate) -> Result<AggregateSummary> {
        let targets = self.store.targets(&[])?;
        let mut summary = AggregateSummary::default();

        for target in &targets {
            let mut wrote = false;
            for room_type in RoomType::all().into_iter().map(Some).chain([None]) {
                let listings = self.store.listings_for_target(target.id, room_type)?;
                if listings.is_empty() {
                    continue;
                }
                self.aggregate(target.id, date, room_type)?;
                summary.rows_written += 1;
                wrote = true;
            }
            if wrote {
                summary.targets_processed += 1;
            }
        }

        info!(
            %date,
            targets = summary.targets_processed,
            rows = summary.rows_written,
            "Daily aggregation complete"
        );
        Ok(summary)
    }

    /// Recompute the `days_back` days preceding "today"
    pub fn aggregate_recent(&self, days_back: u32) -> Result<AggregateSummary> {
        let today = self.clock.now().date_naive();
        let mut total = AggregateSummary::default();
        for offset in 1..=days_back.max(1) as i64 {
            let summary = self.aggregate_all(today - chrono::Duration::days(offset))?;
            total.targets_processed = total.targets_processed.max(summary.targets_processed);
            total.rows_written += summary.rows_written;
        }
        Ok(total)
    }

    /// Estimated revenue of one listing over one calendar month:
    /// the sum of last-observed prices of its booked dates
    pub fn estimate_monthly_revenue(&self, listing_id: i64, year: i32, month: u32) -> Result<f64> {
        let first = NaiveDate::from_ymd_opt(year, month, 1)
            .ok_or_else(|| anyhow::anyhow!("invalid month {year}-{month}"))?;

        let mut total = 0.0;
        let mut date = first;
        while date.month() == month {
            let booked = self
                .store
                .classification(listing_id, date)?
                .map(|c| c.status == DateStatus::Booked)
                .unwrap_or(false);
            if booked {
                if let Some(price) = self
                    .store
                    .latest_observation(listing_id, date)?
                    .and_then(|obs| obs.price)
                {
                    total += price;
                }
            }
            date += chrono::Duration::days(1);
        }
        Ok(total)
    }
}
