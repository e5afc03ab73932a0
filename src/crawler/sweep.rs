//! Sweep execution: fetch → parse → persist
//!
//! One sweeper instance serves all task kinds. Every fetch outcome is
//! reported to the governor (success, soft block, hard error, rejection)
//! before the task result is surfaced to the scheduler, so pacing reacts
//! even when the task itself will be retried or requeued.
//!
//! Persistence happens per task: a cancelled sweep keeps whatever the
//! completed tasks already wrote.

use async_trait::async_trait;
use chrono::Datelike;
use serde_json::Value;
use statrs::statistics::{Data, Distribution, Max, Min, OrderStatistics};
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, info};

use crate::config::CrawlConfig;
use crate::crawler::client::StayApi;
use crate::crawler::governor::{FetchOutcome, RateGovernor};
use crate::crawler::parse;
use crate::crawler::scheduler::{FetchTask, TaskKind, TaskRunner};
use crate::error::{Error, FetchError, Result};
use crate::models::{SearchSnapshot, StayWindow};
use crate::storage::SnapshotStore;
use crate::utils::Clock;

/// Executes fetch tasks against the marketplace API
pub struct Sweeper {
    api: Arc<dyn StayApi>,
    store: Arc<SnapshotStore>,
    governor: Arc<RateGovernor>,
    clock: Arc<dyn Clock>,
    crawl: CrawlConfig,
    /// Governor key of the API host
    host: String,
}

impl Sweeper {
    pub fn new(
        api: Arc<dyn StayApi>,
        store: Arc<SnapshotStore>,
        governor: Arc<RateGovernor>,
        clock: Arc<dyn Clock>,
        crawl: CrawlConfig,
        host: String,
    ) -> Self {
        Self {
            api,
            store,
            governor,
            clock,
            crawl,
            host,
        }
    }

    fn outcome_of(err: &FetchError) -> FetchOutcome {
        match err {
            FetchError::Blocked(kind) => FetchOutcome::SoftBlock(*kind),
            FetchError::Http(_) | FetchError::Timeout | FetchError::Decode(_) => {
                FetchOutcome::HardError
            }
            FetchError::Status(code) if (500..600).contains(code) => FetchOutcome::HardError,
            FetchError::Status(_) | FetchError::InvalidUrl(_) => FetchOutcome::Rejected,
        }
    }

    /// Await a fetch and report its outcome to the governor
    async fn checked<Fut>(&self, fut: Fut) -> Result<Value>
    where
        Fut: Future<Output = std::result::Result<Value, FetchError>>,
    {
        match fut.await {
            Ok(payload) => {
                self.governor.report(&self.host, FetchOutcome::Success);
                Ok(payload)
            }
            Err(err) => {
                self.governor.report(&self.host, Self::outcome_of(&err));
                Err(Error::Fetch(err))
            }
        }
    }

    async fn run_search(&self, target_id: i64) -> Result<()> {
        let target = self
            .store
            .target(target_id)?
            .ok_or_else(|| Error::other(format!("unknown target {target_id}")))?;

        let window = StayWindow::next_night(self.clock.now().date_naive());
        debug!(target = %target.name, ?window, "Search sweep");

        let payload = self.checked(self.api.fetch_search(&target, &window)).await?;
        let listings = parse::extract_listings(&payload)?;

        let prices: Vec<f64> = listings.iter().filter_map(|l| l.price).collect();
        let (avg, median, min, max) = if prices.is_empty() {
            (0.0, 0.0, 0.0, 0.0)
        } else {
            let mut data = Data::new(prices);
            (
                data.mean().unwrap_or(0.0),
                data.median(),
                data.min(),
                data.max(),
            )
        };

        let observed_at = self.clock.now();
        let snapshot = SearchSnapshot {
            target_id: target.id,
            observed_at,
            checkin: window.checkin,
            checkout: window.checkout,
            total_listings: listings.len() as i64,
            avg_price: avg,
            min_price: min,
            max_price: max,
            median_price: median,
            available_count: listings.len() as i64,
            payload_hash: parse::payload_hash(&payload),
        };
        self.store.append_search(&snapshot)?;

        for record in &listings {
            self.store.upsert_listing(target.id, record, observed_at)?;
        }

        info!(
            target = %target.name,
            listings = listings.len(),
            avg_price = format!("{avg:.0}"),
            "Search snapshot saved"
        );
        Ok(())
    }

    async fn run_calendar(&self, listing_id: i64) -> Result<()> {
        let listing = self
            .store
            .listing(listing_id)?
            .ok_or_else(|| Error::other(format!("unknown listing {listing_id}")))?;

        let now = self.clock.now();
        let today = now.date_naive();
        debug!(market_id = %listing.market_id, "Calendar sweep");

        let payload = self
            .checked(self.api.fetch_calendar(
                &listing,
                today.year(),
                today.month(),
                self.crawl.calendar_months,
            ))
            .await?;

        let horizon = today + chrono::Duration::days(self.crawl.calendar_lookahead_days);
        let days: Vec<_> = parse::extract_calendar_days(&payload)?
            .into_iter()
            .filter(|day| day.date >= today && day.date <= horizon)
            .collect();

        self.store.append_calendar_days(listing.id, now, &days)?;
        debug!(
            market_id = %listing.market_id,
            days = days.len(),
            "Calendar days appended"
        );
        Ok(())
    }

    async fn run_detail(&self, listing_id: i64) -> Result<()> {
        let listing = self
            .store
            .listing(listing_id)?
            .ok_or_else(|| Error::other(format!("unknown listing {listing_id}")))?;

        let payload = self.checked(self.api.fetch_detail(&listing)).await?;
        let attrs = parse::extract_detail_attrs(&payload);
        self.store
            .update_listing_detail(listing.id, &attrs, self.clock.now())?;
        debug!(market_id = %listing.market_id, "Detail refreshed");
        Ok(())
    }
}

#[async_trait]
impl TaskRunner for Sweeper {
    async fn run(&self, task: &FetchTask) -> Result<()> {
        match task.kind {
            TaskKind::SearchSweep { target_id } => self.run_search(target_id).await,
            TaskKind::CalendarSweep { listing_id } => self.run_calendar(listing_id).await,
            TaskKind::DetailRefresh { listing_id } => self.run_detail(listing_id).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{GovernorConfig, IdentityConfig};
    use crate::crawler::identity::IdentityPool;
    use crate::error::BlockKind;
    use crate::models::{Listing, ListingRecord, RoomType, Target};
    use crate::utils::ManualClock;
    use chrono::{TimeZone, Utc};
    use serde_json::json;
    use std::sync::Mutex;

    const HOST: &str = "www.example.com";

    /// Scripted API: pops the next canned response per operation
    struct ScriptedApi {
        search: Mutex<Vec<std::result::Result<Value, FetchError>>>,
        calendar: Mutex<Vec<std::result::Result<Value, FetchError>>>,
    }

    #[async_trait]
    impl StayApi for ScriptedApi {
        async fn fetch_search(
            &self,
            _target: &Target,
            _window: &StayWindow,
        ) -> std::result::Result<Value, FetchError> {
            self.search.lock().unwrap().remove(0)
        }

        async fn fetch_calendar(
            &self,
            _listing: &Listing,
            _year: i32,
            _month: u32,
            _months: u32,
        ) -> std::result::Result<Value, FetchError> {
            self.calendar.lock().unwrap().remove(0)
        }

        async fn fetch_detail(&self, _listing: &Listing) -> std::result::Result<Value, FetchError> {
            Ok(json!({ "data": { "sections": [
                { "listingTitle": "갱신된 이름", "overallRating": 4.95, "overallCount": 77 }
            ] } }))
        }
    }

    fn setup(
        search: Vec<std::result::Result<Value, FetchError>>,
        calendar: Vec<std::result::Result<Value, FetchError>>,
    ) -> (Sweeper, Arc<SnapshotStore>, Arc<RateGovernor>) {
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2026, 3, 1, 3, 0, 0).unwrap(),
        ));
        let store = Arc::new(SnapshotStore::in_memory().unwrap());
        store
            .insert_target(&Target {
                id: 1,
                name: "을지로".to_string(),
                line: "2호선".to_string(),
                district: None,
                latitude: 37.566,
                longitude: 126.991,
                priority: 1,
            })
            .unwrap();

        let identities = IdentityPool::new(
            vec!["ua".to_string()],
            &IdentityConfig::default(),
            clock.clone(),
        );
        let governor = Arc::new(RateGovernor::with_seed(
            GovernorConfig::default(),
            identities,
            clock.clone(),
            3,
        ));
        let api = Arc::new(ScriptedApi {
            search: Mutex::new(search),
            calendar: Mutex::new(calendar),
        });
        let sweeper = Sweeper::new(
            api,
            store.clone(),
            governor.clone(),
            clock,
            CrawlConfig::default(),
            HOST.to_string(),
        );
        (sweeper, store, governor)
    }

    fn search_payload() -> Value {
        json!({
            "data": { "presentation": { "staysSearch": { "results": { "searchResults": [
                {
                    "propertyId": "100",
                    "nameLocalized": "A",
                    "structuredDisplayPrice": { "primaryLine": { "price": "₩80,000" } },
                    "demandStayListing": {
                        "roomTypeCategory": "entire_home",
                        "location": { "coordinate": { "latitude": 37.56, "longitude": 126.99 } }
                    }
                },
                {
                    "propertyId": "200",
                    "nameLocalized": "B",
                    "structuredDisplayPrice": { "primaryLine": { "price": "₩120,000" } },
                    "demandStayListing": {
                        "roomTypeCategory": "private_room",
                        "location": { "coordinate": { "latitude": 37.57, "longitude": 126.98 } }
                    }
                }
            ] } } } }
        })
    }

    #[tokio::test]
    async fn test_search_sweep_persists_snapshot_and_listings() {
        let (sweeper, store, governor) = setup(vec![Ok(search_payload())], vec![]);

        sweeper.run_search(1).await.unwrap();

        let counts = store.counts().unwrap();
        assert_eq!(counts.search_snapshots, 1);
        assert_eq!(counts.listings, 2);

        let listing = store.listing_by_market_id("100").unwrap().unwrap();
        assert_eq!(listing.room_type, Some(RoomType::EntireHome));
        assert_eq!(listing.base_price, Some(80_000.0));

        let stats = governor.host_stats(HOST).unwrap();
        assert_eq!(stats.success, 1);
    }

    #[tokio::test]
    async fn test_search_sweep_reports_block_to_governor() {
        let (sweeper, store, governor) =
            setup(vec![Err(FetchError::Blocked(BlockKind::Captcha))], vec![]);

        let err = sweeper.run_search(1).await.unwrap_err();
        assert!(err.is_blocked());

        let stats = governor.host_stats(HOST).unwrap();
        assert_eq!(stats.blocked, 1);
        assert!(stats.delay_multiplier > 1.0);
        assert_eq!(store.counts().unwrap().search_snapshots, 0);
    }

    #[tokio::test]
    async fn test_calendar_sweep_appends_window_only() {
        let calendar = json!({
            "data": { "merlin": { "pdpAvailabilityCalendar": { "calendarMonths": [
                { "days": [
                    // Before "today": dropped
                    { "calendarDate": "2026-02-27", "available": true },
                    { "calendarDate": "2026-03-05", "available": true,
                      "price": { "amount": 90000.0 } },
                    { "calendarDate": "2026-03-06", "available": false },
                    // Beyond the 90-day lookahead: dropped
                    { "calendarDate": "2026-08-01", "available": true }
                ] }
            ] } } }
        });
        let (sweeper, store, _) = setup(vec![Ok(search_payload())], vec![Ok(calendar)]);
        sweeper.run_search(1).await.unwrap();
        let listing = store.listing_by_market_id("100").unwrap().unwrap();

        sweeper.run_calendar(listing.id).await.unwrap();

        let obs = store.listing_observations(listing.id).unwrap();
        assert_eq!(obs.len(), 2);
        let march5 = chrono::NaiveDate::from_ymd_opt(2026, 3, 5).unwrap();
        assert_eq!(obs[&march5][0].price, Some(90_000.0));
    }

    #[tokio::test]
    async fn test_detail_refresh_updates_attributes() {
        let (sweeper, store, _) = setup(vec![Ok(search_payload())], vec![]);
        sweeper.run_search(1).await.unwrap();
        let listing = store.listing_by_market_id("100").unwrap().unwrap();

        sweeper.run_detail(listing.id).await.unwrap();

        let updated = store.listing(listing.id).unwrap().unwrap();
        assert_eq!(updated.name, "갱신된 이름");
        assert_eq!(updated.rating, Some(4.95));
        assert_eq!(updated.review_count, Some(77));
    }

    #[tokio::test]
    async fn test_unknown_target_is_an_error() {
        let (sweeper, _, _) = setup(vec![], vec![]);
        assert!(sweeper.run_search(99).await.is_err());
    }

    #[test]
    fn test_outcome_classification() {
        assert_eq!(
            Sweeper::outcome_of(&FetchError::Blocked(BlockKind::RateLimit)),
            FetchOutcome::SoftBlock(BlockKind::RateLimit)
        );
        assert_eq!(
            Sweeper::outcome_of(&FetchError::Timeout),
            FetchOutcome::HardError
        );
        assert_eq!(
            Sweeper::outcome_of(&FetchError::Status(502)),
            FetchOutcome::HardError
        );
        assert_eq!(
            Sweeper::outcome_of(&FetchError::Status(404)),
            FetchOutcome::Rejected
        );
    }

    #[test]
    fn test_upsert_keeps_first_seen() {
        // Covered in storage, but the sweep path matters: repeated sweeps
        // must not reset first_seen
        let (_, store, _) = setup(vec![], vec![]);
        let t0 = Utc.with_ymd_and_hms(2026, 3, 1, 3, 0, 0).unwrap();
        let t1 = Utc.with_ymd_and_hms(2026, 3, 2, 3, 0, 0).unwrap();
        let record = ListingRecord {
            market_id: "m".to_string(),
            ..ListingRecord::default()
        };
        let id = store.upsert_listing(1, &record, t0).unwrap();
        store.upsert_listing(1, &record, t1).unwrap();
        let listing = store.listing(id).unwrap().unwrap();
        assert_eq!(listing.first_seen, t0);
        assert_eq!(listing.last_seen, t1);
    }
}
