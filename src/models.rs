// Core data structures for the ondol crawler

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A geographic search anchor (subway station): fixed coordinates + radius.
/// Loaded once from reference data, read-only afterwards.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Target {
    pub id: i64,
    pub name: String,
    pub line: String,
    pub district: Option<String>,
    pub latitude: f64,
    pub longitude: f64,
    /// 1 = highest priority, 3 = lowest
    pub priority: u8,
}

/// Room type categories used by the marketplace
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RoomType {
    EntireHome,
    PrivateRoom,
    SharedRoom,
    Hotel,
}

impl RoomType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::EntireHome => "entire_home",
            Self::PrivateRoom => "private_room",
            Self::SharedRoom => "shared_room",
            Self::Hotel => "hotel",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "entire_home" | "entire_home_apt" => Some(Self::EntireHome),
            "private_room" => Some(Self::PrivateRoom),
            "shared_room" => Some(Self::SharedRoom),
            "hotel" | "hotel_room" => Some(Self::Hotel),
            _ => None,
        }
    }

    pub fn all() -> Vec<Self> {
        vec![
            Self::EntireHome,
            Self::PrivateRoom,
            Self::SharedRoom,
            Self::Hotel,
        ]
    }
}

impl std::fmt::Display for RoomType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A rental unit known to the crawler
///
/// Attribute fields hold last-observed values; `first_seen`/`last_seen`
/// bound the known lifetime. Listings are never deleted, only left stale.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Listing {
    pub id: i64,
    /// Stable external id assigned by the marketplace
    pub market_id: String,
    pub name: String,
    pub room_type: Option<RoomType>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub target_id: i64,
    pub base_price: Option<f64>,
    pub rating: Option<f64>,
    pub review_count: Option<i64>,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

/// One listing entry extracted from a search payload
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ListingRecord {
    pub market_id: String,
    pub name: String,
    pub room_type: Option<RoomType>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub price: Option<f64>,
    pub rating: Option<f64>,
    pub review_count: Option<i64>,
}

/// One calendar day extracted from a calendar payload
#[derive(Debug, Clone, PartialEq)]
pub struct CalendarDay {
    pub date: NaiveDate,
    pub available: bool,
    pub price: Option<f64>,
    pub min_nights: Option<u32>,
}

/// A checkin/checkout stay window used for searches
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StayWindow {
    pub checkin: NaiveDate,
    pub checkout: NaiveDate,
}

impl StayWindow {
    /// One-night window starting the day after `today`
    pub fn next_night(today: NaiveDate) -> Self {
        let checkin = today + chrono::Duration::days(1);
        Self {
            checkin,
            checkout: checkin + chrono::Duration::days(1),
        }
    }
}

/// Aggregate record of one search sweep over one target. Append-only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchSnapshot {
    pub target_id: i64,
    pub observed_at: DateTime<Utc>,
    pub checkin: NaiveDate,
    pub checkout: NaiveDate,
    pub total_listings: i64,
    pub avg_price: f64,
    pub min_price: f64,
    pub max_price: f64,
    pub median_price: f64,
    pub available_count: i64,
    /// Truncated sha256 of the raw payload, for duplicate-response detection
    pub payload_hash: String,
}

/// One observation of one calendar date of one listing. Append-only; the
/// accumulated history is the reconciliation input and is never rewritten.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalendarObservation {
    pub listing_id: i64,
    pub observed_at: DateTime<Utc>,
    pub date: NaiveDate,
    pub available: bool,
    pub price: Option<f64>,
    pub min_nights: Option<u32>,
}

/// Inferred state of one calendar date
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DateStatus {
    Available,
    Booked,
    Blocked,
    Unknown,
}

impl DateStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Available => "available",
            Self::Booked => "booked",
            Self::Blocked => "blocked",
            Self::Unknown => "unknown",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "available" => Some(Self::Available),
            "booked" => Some(Self::Booked),
            "blocked" => Some(Self::Blocked),
            "unknown" => Some(Self::Unknown),
            _ => None,
        }
    }
}

impl std::fmt::Display for DateStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Derived classification of one (listing, date). Replaced on recompute.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DateClassification {
    pub status: DateStatus,
    /// Certainty in [0, 1] that the status reflects reality rather than a
    /// crawling artifact
    pub confidence: f64,
    pub computed_at: DateTime<Utc>,
}

/// Derived daily statistics for one (target, date, room-type). Fully
/// replaced on recompute.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DailyStat {
    pub target_id: i64,
    pub date: NaiveDate,
    /// None = rollup across all room types
    pub room_type: Option<RoomType>,
    pub total_listings: i64,
    pub booked_count: i64,
    pub occupancy_rate: f64,
    pub avg_daily_price: f64,
    pub estimated_revenue: f64,
}

/// Kinds of fetch sweeps
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SweepKind {
    Search,
    Calendar,
    Detail,
}

impl SweepKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Search => "search",
            Self::Calendar => "calendar",
            Self::Detail => "detail",
        }
    }
}

impl std::fmt::Display for SweepKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Outcome of one sweep run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SweepStatus {
    Success,
    Partial,
    Failed,
}

impl SweepStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Partial => "partial",
            Self::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "success" => Some(Self::Success),
            "partial" => Some(Self::Partial),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

impl std::fmt::Display for SweepStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Audit record of one sweep run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SweepLog {
    pub sweep_id: Uuid,
    pub kind: SweepKind,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub status: SweepStatus,
    pub total_tasks: i64,
    pub completed: i64,
    pub failed: i64,
    pub blocked: i64,
    pub error: Option<String>,
}
