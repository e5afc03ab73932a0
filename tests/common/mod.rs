//! Common test utilities

use std::sync::Arc;

use chrono::{DateTime, Duration, NaiveDate, TimeZone, Utc};
use ondol::models::{CalendarDay, ListingRecord, RoomType, Target};
use ondol::storage::SnapshotStore;

/// A fixed "now" all integration tests agree on
pub fn test_now() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 6, 7, 12, 0, 0).unwrap()
}

/// Create a test target with default values
pub fn create_test_target(id: i64) -> Target {
    Target {
        id,
        name: format!("역{id}"),
        line: "2호선".to_string(),
        district: Some("중구".to_string()),
        latitude: 37.56,
        longitude: 126.99,
        priority: 1,
    }
}

/// In-memory store seeded with one target
pub fn store_with_target() -> Arc<SnapshotStore> {
    let store = Arc::new(SnapshotStore::in_memory().unwrap());
    store.insert_target(&create_test_target(1)).unwrap();
    store
}

/// Add a listing under target 1 and return its id
pub fn add_listing(store: &SnapshotStore, market_id: &str) -> i64 {
    store
        .upsert_listing(
            1,
            &ListingRecord {
                market_id: market_id.to_string(),
                name: format!("숙소 {market_id}"),
                room_type: Some(RoomType::EntireHome),
                latitude: Some(37.56),
                longitude: Some(126.99),
                price: Some(100_000.0),
                rating: Some(4.8),
                review_count: Some(12),
            },
            test_now() - Duration::days(30),
        )
        .unwrap()
}

/// Append one observation of `date` made `days_before_now` days before
/// [`test_now`]
#[allow(dead_code)]
pub fn observe(
    store: &SnapshotStore,
    listing_id: i64,
    date: NaiveDate,
    days_before_now: i64,
    available: bool,
    price: Option<f64>,
) {
    store
        .append_calendar_days(
            listing_id,
            test_now() - Duration::days(days_before_now),
            &[CalendarDay {
                date,
                available,
                price,
                min_nights: Some(1),
            }],
        )
        .unwrap();
}
