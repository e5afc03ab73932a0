//! Append-only snapshot storage
//!
//! SQLite holds four append-only observation tables (targets are reference
//! data; listings, search snapshots and calendar observations accumulate)
//! plus two derived tables (date classifications, daily stats) that are
//! replaced wholesale on recompute.
//!
//! Observation rows are never updated or deleted after insertion: the
//! accumulated history is the audit trail the reconciliation engine replays.
//! Duplicate content is legitimate (re-observations are distinguished by
//! `observed_at`), so appends never fail on it.
//!
//! A `Mutex<Connection>` keeps concurrent writers safe; appends need no
//! further coordination.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Mutex;

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};

use crate::crawler::parse::DetailAttrs;
use crate::models::{
    CalendarDay, CalendarObservation, DailyStat, DateClassification, DateStatus, Listing,
    ListingRecord, RoomType, SearchSnapshot, SweepLog, Target,
};

/// Row counts across the store, for the stats command
#[derive(Debug, Clone, Default)]
pub struct StoreCounts {
    pub targets: i64,
    pub listings: i64,
    pub search_snapshots: i64,
    pub calendar_observations: i64,
    pub classifications: i64,
    pub daily_stats: i64,
    pub sweep_logs: i64,
}

/// SQLite-backed snapshot store
pub struct SnapshotStore {
    conn: Mutex<Connection>,
}

fn fmt_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(s: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(s)
        .with_context(|| format!("bad timestamp in store: {s}"))?
        .with_timezone(&Utc))
}

fn parse_date(s: &str) -> Result<NaiveDate> {
    NaiveDate::parse_from_str(s, "%Y-%m-%d").with_context(|| format!("bad date in store: {s}"))
}

impl SnapshotStore {
    /// Open (or create) the store at `path`
    pub fn new(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path).context("Failed to open SQLite database")?;
        // WAL for better concurrency
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;

        let store = Self {
            conn: Mutex::new(conn),
        };
        store.create_schema()?;

        tracing::info!(path = %path.display(), "Snapshot store initialized");
        Ok(store)
    }

    /// In-memory store (tests)
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to create in-memory SQLite")?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.create_schema()?;
        Ok(store)
    }

    fn create_schema(&self) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS targets (
                id          INTEGER PRIMARY KEY,
                name        TEXT NOT NULL,
                line        TEXT NOT NULL,
                district    TEXT,
                latitude    REAL NOT NULL,
                longitude   REAL NOT NULL,
                priority    INTEGER NOT NULL DEFAULT 3,
                UNIQUE (name, line)
            );

            CREATE TABLE IF NOT EXISTS listings (
                id           INTEGER PRIMARY KEY AUTOINCREMENT,
                market_id    TEXT NOT NULL UNIQUE,
                name         TEXT NOT NULL DEFAULT '',
                room_type    TEXT,
                latitude     REAL,
                longitude    REAL,
                target_id    INTEGER NOT NULL REFERENCES targets(id),
                base_price   REAL,
                rating       REAL,
                review_count INTEGER,
                first_seen   TEXT NOT NULL,
                last_seen    TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS ix_listing_target ON listings(target_id);
            CREATE INDEX IF NOT EXISTS ix_listing_room_type ON listings(room_type);

            CREATE TABLE IF NOT EXISTS search_snapshots (
                id              INTEGER PRIMARY KEY AUTOINCREMENT,
                target_id       INTEGER NOT NULL REFERENCES targets(id),
                observed_at     TEXT NOT NULL,
                checkin         TEXT NOT NULL,
                checkout        TEXT NOT NULL,
                total_listings  INTEGER NOT NULL,
                avg_price       REAL NOT NULL,
                min_price       REAL NOT NULL,
                max_price       REAL NOT NULL,
                median_price    REAL NOT NULL,
                available_count INTEGER NOT NULL,
                payload_hash    TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS ix_snapshot_target_time
                ON search_snapshots(target_id, observed_at);

            CREATE TABLE IF NOT EXISTS calendar_observations (
                id          INTEGER PRIMARY KEY AUTOINCREMENT,
                listing_id  INTEGER NOT NULL REFERENCES listings(id),
                observed_at TEXT NOT NULL,
                date        TEXT NOT NULL,
                available   INTEGER NOT NULL,
                price       REAL,
                min_nights  INTEGER
            );
            CREATE INDEX IF NOT EXISTS ix_calendar_listing_date
                ON calendar_observations(listing_id, date);
            CREATE INDEX IF NOT EXISTS ix_calendar_observed
                ON calendar_observations(observed_at);

            CREATE TABLE IF NOT EXISTS date_classifications (
                listing_id  INTEGER NOT NULL,
                date        TEXT NOT NULL,
                status      TEXT NOT NULL,
                confidence  REAL NOT NULL,
                computed_at TEXT NOT NULL,
                PRIMARY KEY (listing_id, date)
            );

            CREATE TABLE IF NOT EXISTS daily_stats (
                target_id         INTEGER NOT NULL,
                date              TEXT NOT NULL,
                room_type         TEXT NOT NULL DEFAULT '',
                total_listings    INTEGER NOT NULL,
                booked_count      INTEGER NOT NULL,
                occupancy_rate    REAL NOT NULL,
                avg_daily_price   REAL NOT NULL,
                estimated_revenue REAL NOT NULL,
                PRIMARY KEY (target_id, date, room_type)
            );

            CREATE TABLE IF NOT EXISTS sweep_logs (
                id          INTEGER PRIMARY KEY AUTOINCREMENT,
                sweep_id    TEXT NOT NULL,
                kind        TEXT NOT NULL,
                started_at  TEXT NOT NULL,
                finished_at TEXT NOT NULL,
                status      TEXT NOT NULL,
                total_tasks INTEGER NOT NULL,
                completed   INTEGER NOT NULL,
                failed      INTEGER NOT NULL,
                blocked     INTEGER NOT NULL,
                error       TEXT
            );
            CREATE INDEX IF NOT EXISTS ix_sweep_kind_time ON sweep_logs(kind, started_at);
            "#,
        )?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Targets (reference data)
    // ------------------------------------------------------------------

    /// Insert a target if it is not already present
    pub fn insert_target(&self, target: &Target) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT OR IGNORE INTO targets (id, name, line, district, latitude, longitude, priority)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                target.id,
                target.name,
                target.line,
                target.district,
                target.latitude,
                target.longitude,
                target.priority,
            ],
        )?;
        Ok(())
    }

    /// Insert a target from reference data, letting SQLite assign the id;
    /// (name, line) duplicates are ignored. Returns true if a row was added.
    pub fn insert_target_record(
        &self,
        name: &str,
        line: &str,
        district: Option<&str>,
        latitude: f64,
        longitude: f64,
        priority: u8,
    ) -> Result<bool> {
        let conn = self.conn.lock().unwrap();
        let added = conn.execute(
            "INSERT OR IGNORE INTO targets (name, line, district, latitude, longitude, priority)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![name, line, district, latitude, longitude, priority],
        )?;
        Ok(added > 0)
    }

    /// Targets filtered by priority (empty slice = all), ordered by priority
    pub fn targets(&self, priorities: &[u8]) -> Result<Vec<Target>> {
        let conn = self.conn.lock().unwrap();
        let mut out = Vec::new();
        let mut stmt = conn.prepare(
            "SELECT id, name, line, district, latitude, longitude, priority
             FROM targets ORDER BY priority, id",
        )?;
        let rows = stmt.query_map([], row_to_target)?;
        for row in rows {
            let target = row?;
            if priorities.is_empty() || priorities.contains(&target.priority) {
                out.push(target);
            }
        }
        Ok(out)
    }

    pub fn target(&self, id: i64) -> Result<Option<Target>> {
        let conn = self.conn.lock().unwrap();
        let target = conn
            .query_row(
                "SELECT id, name, line, district, latitude, longitude, priority
                 FROM targets WHERE id = ?1",
                params![id],
                row_to_target,
            )
            .optional()?;
        Ok(target)
    }

    // ------------------------------------------------------------------
    // Listings
    // ------------------------------------------------------------------

    /// Create or refresh a listing from a search result; returns its id
    ///
    /// A known listing gets `last_seen` and any newly observed attributes
    /// updated; an unknown one is created with `first_seen = last_seen = now`.
    pub fn upsert_listing(
        &self,
        target_id: i64,
        record: &ListingRecord,
        now: DateTime<Utc>,
    ) -> Result<i64> {
        let conn = self.conn.lock().unwrap();
        let existing: Option<i64> = conn
            .query_row(
                "SELECT id FROM listings WHERE market_id = ?1",
                params![record.market_id],
                |row| row.get(0),
            )
            .optional()?;

        if let Some(id) = existing {
            conn.execute(
                "UPDATE listings SET
                    last_seen = ?2,
                    name = CASE WHEN ?3 != '' THEN ?3 ELSE name END,
                    room_type = COALESCE(?4, room_type),
                    latitude = COALESCE(?5, latitude),
                    longitude = COALESCE(?6, longitude),
                    base_price = COALESCE(?7, base_price),
                    rating = COALESCE(?8, rating),
                    review_count = COALESCE(?9, review_count)
                 WHERE id = ?1",
                params![
                    id,
                    fmt_ts(now),
                    record.name,
                    record.room_type.map(|rt| rt.as_str()),
                    record.latitude,
                    record.longitude,
                    record.price,
                    record.rating,
                    record.review_count,
                ],
            )?;
            return Ok(id);
        }

        conn.execute(
            "INSERT INTO listings
                (market_id, name, room_type, latitude, longitude, target_id,
                 base_price, rating, review_count, first_seen, last_seen)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?10)",
            params![
                record.market_id,
                record.name,
                record.room_type.map(|rt| rt.as_str()),
                record.latitude,
                record.longitude,
                target_id,
                record.price,
                record.rating,
                record.review_count,
                fmt_ts(now),
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Refresh attributes from a detail payload
    pub fn update_listing_detail(
        &self,
        listing_id: i64,
        attrs: &DetailAttrs,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE listings SET
                last_seen = ?2,
                name = COALESCE(?3, name),
                room_type = COALESCE(?4, room_type),
                rating = COALESCE(?5, rating),
                review_count = COALESCE(?6, review_count)
             WHERE id = ?1",
            params![
                listing_id,
                fmt_ts(now),
                attrs.name,
                attrs.room_type.map(|rt| rt.as_str()),
                attrs.rating,
                attrs.review_count,
            ],
        )?;
        Ok(())
    }

    pub fn listing(&self, id: i64) -> Result<Option<Listing>> {
        let conn = self.conn.lock().unwrap();
        let listing = conn
            .query_row(
                &format!("{LISTING_SELECT} WHERE id = ?1"),
                params![id],
                row_to_listing,
            )
            .optional()?;
        listing.transpose()
    }

    pub fn listing_by_market_id(&self, market_id: &str) -> Result<Option<Listing>> {
        let conn = self.conn.lock().unwrap();
        let listing = conn
            .query_row(
                &format!("{LISTING_SELECT} WHERE market_id = ?1"),
                params![market_id],
                row_to_listing,
            )
            .optional()?;
        listing.transpose()
    }

    /// Listings attached to a target, optionally filtered by room type
    pub fn listings_for_target(
        &self,
        target_id: i64,
        room_type: Option<RoomType>,
    ) -> Result<Vec<Listing>> {
        let conn = self.conn.lock().unwrap();
        let mut out = Vec::new();
        match room_type {
            Some(rt) => {
                let mut stmt = conn.prepare(&format!(
                    "{LISTING_SELECT} WHERE target_id = ?1 AND room_type = ?2 ORDER BY id"
                ))?;
                let rows = stmt.query_map(params![target_id, rt.as_str()], row_to_listing)?;
                for row in rows {
                    out.push(row??);
                }
            }
            None => {
                let mut stmt = conn.prepare(&format!(
                    "{LISTING_SELECT} WHERE target_id = ?1 ORDER BY id"
                ))?;
                let rows = stmt.query_map(params![target_id], row_to_listing)?;
                for row in rows {
                    out.push(row??);
                }
            }
        }
        Ok(out)
    }

    pub fn all_listings(&self) -> Result<Vec<Listing>> {
        let conn = self.conn.lock().unwrap();
        let mut out = Vec::new();
        let mut stmt = conn.prepare(&format!("{LISTING_SELECT} ORDER BY id"))?;
        let rows = stmt.query_map([], row_to_listing)?;
        for row in rows {
            out.push(row??);
        }
        Ok(out)
    }

    // ------------------------------------------------------------------
    // Append-only observations
    // ------------------------------------------------------------------

    /// Append one search snapshot
    pub fn append_search(&self, snapshot: &SearchSnapshot) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO search_snapshots
                (target_id, observed_at, checkin, checkout, total_listings,
                 avg_price, min_price, max_price, median_price, available_count, payload_hash)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                snapshot.target_id,
                fmt_ts(snapshot.observed_at),
                snapshot.checkin.to_string(),
                snapshot.checkout.to_string(),
                snapshot.total_listings,
                snapshot.avg_price,
                snapshot.min_price,
                snapshot.max_price,
                snapshot.median_price,
                snapshot.available_count,
                snapshot.payload_hash,
            ],
        )?;
        Ok(())
    }

    /// Append one batch of calendar-day observations for a listing
    pub fn append_calendar_days(
        &self,
        listing_id: i64,
        observed_at: DateTime<Utc>,
        days: &[CalendarDay],
    ) -> Result<()> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO calendar_observations
                    (listing_id, observed_at, date, available, price, min_nights)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            )?;
            for day in days {
                stmt.execute(params![
                    listing_id,
                    fmt_ts(observed_at),
                    day.date.to_string(),
                    day.available,
                    day.price,
                    day.min_nights,
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    /// Observation history of one (listing, date), oldest first
    ///
    /// This ordering is the reconciliation engine's input contract.
    pub fn history(&self, listing_id: i64, date: NaiveDate) -> Result<Vec<CalendarObservation>> {
        let conn = self.conn.lock().unwrap();
        let mut out = Vec::new();
        let mut stmt = conn.prepare(
            "SELECT listing_id, observed_at, date, available, price, min_nights
             FROM calendar_observations
             WHERE listing_id = ?1 AND date = ?2
             ORDER BY observed_at, id",
        )?;
        let rows = stmt.query_map(params![listing_id, date.to_string()], row_to_observation)?;
        for row in rows {
            out.push(row??);
        }
        Ok(out)
    }

    /// All observations of one listing, grouped per date in observation order
    pub fn listing_observations(
        &self,
        listing_id: i64,
    ) -> Result<BTreeMap<NaiveDate, Vec<CalendarObservation>>> {
        let conn = self.conn.lock().unwrap();
        let mut grouped: BTreeMap<NaiveDate, Vec<CalendarObservation>> = BTreeMap::new();
        let mut stmt = conn.prepare(
            "SELECT listing_id, observed_at, date, available, price, min_nights
             FROM calendar_observations
             WHERE listing_id = ?1
             ORDER BY date, observed_at, id",
        )?;
        let rows = stmt.query_map(params![listing_id], row_to_observation)?;
        for row in rows {
            let obs = row??;
            grouped.entry(obs.date).or_default().push(obs);
        }
        Ok(grouped)
    }

    /// Most recent observation of one (listing, date)
    pub fn latest_observation(
        &self,
        listing_id: i64,
        date: NaiveDate,
    ) -> Result<Option<CalendarObservation>> {
        let conn = self.conn.lock().unwrap();
        let obs = conn
            .query_row(
                "SELECT listing_id, observed_at, date, available, price, min_nights
                 FROM calendar_observations
                 WHERE listing_id = ?1 AND date = ?2
                 ORDER BY observed_at DESC, id DESC LIMIT 1",
                params![listing_id, date.to_string()],
                row_to_observation,
            )
            .optional()?;
        obs.transpose()
    }

    // ------------------------------------------------------------------
    // Derived tables (replaced on recompute)
    // ------------------------------------------------------------------

    /// Replace the classifications of one listing
    pub fn replace_classifications(
        &self,
        listing_id: i64,
        classifications: &BTreeMap<NaiveDate, DateClassification>,
    ) -> Result<()> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare(
                "INSERT OR REPLACE INTO date_classifications
                    (listing_id, date, status, confidence, computed_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
            )?;
            for (date, class) in classifications {
                stmt.execute(params![
                    listing_id,
                    date.to_string(),
                    class.status.as_str(),
                    class.confidence,
                    fmt_ts(class.computed_at),
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    pub fn classification(
        &self,
        listing_id: i64,
        date: NaiveDate,
    ) -> Result<Option<DateClassification>> {
        let conn = self.conn.lock().unwrap();
        let class = conn
            .query_row(
                "SELECT status, confidence, computed_at
                 FROM date_classifications
                 WHERE listing_id = ?1 AND date = ?2",
                params![listing_id, date.to_string()],
                row_to_classification,
            )
            .optional()?;
        class.transpose()
    }

    pub fn classifications_for_listing(
        &self,
        listing_id: i64,
    ) -> Result<BTreeMap<NaiveDate, DateClassification>> {
        let conn = self.conn.lock().unwrap();
        let mut out = BTreeMap::new();
        let mut stmt = conn.prepare(
            "SELECT date, status, confidence, computed_at
             FROM date_classifications WHERE listing_id = ?1",
        )?;
        let rows = stmt.query_map(params![listing_id], |row| {
            let date: String = row.get(0)?;
            let status: String = row.get(1)?;
            let confidence: f64 = row.get(2)?;
            let computed_at: String = row.get(3)?;
            Ok((date, status, confidence, computed_at))
        })?;
        for row in rows {
            let (date, status, confidence, computed_at) = row?;
            out.insert(
                parse_date(&date)?,
                DateClassification {
                    status: DateStatus::parse(&status).unwrap_or(DateStatus::Unknown),
                    confidence,
                    computed_at: parse_ts(&computed_at)?,
                },
            );
        }
        Ok(out)
    }

    /// Replace one daily stat row (idempotent recompute)
    pub fn replace_daily_stat(&self, stat: &DailyStat) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT OR REPLACE INTO daily_stats
                (target_id, date, room_type, total_listings, booked_count,
                 occupancy_rate, avg_daily_price, estimated_revenue)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                stat.target_id,
                stat.date.to_string(),
                stat.room_type.map(|rt| rt.as_str()).unwrap_or(""),
                stat.total_listings,
                stat.booked_count,
                stat.occupancy_rate,
                stat.avg_daily_price,
                stat.estimated_revenue,
            ],
        )?;
        Ok(())
    }

    pub fn daily_stat(
        &self,
        target_id: i64,
        date: NaiveDate,
        room_type: Option<RoomType>,
    ) -> Result<Option<DailyStat>> {
        let conn = self.conn.lock().unwrap();
        let stat = conn
            .query_row(
                "SELECT target_id, date, room_type, total_listings, booked_count,
                        occupancy_rate, avg_daily_price, estimated_revenue
                 FROM daily_stats
                 WHERE target_id = ?1 AND date = ?2 AND room_type = ?3",
                params![
                    target_id,
                    date.to_string(),
                    room_type.map(|rt| rt.as_str()).unwrap_or(""),
                ],
                row_to_daily_stat,
            )
            .optional()?;
        stat.transpose()
    }

    pub fn daily_stats_for_date(&self, date: NaiveDate) -> Result<Vec<DailyStat>> {
        let conn = self.conn.lock().unwrap();
        let mut out = Vec::new();
        let mut stmt = conn.prepare(
            "SELECT target_id, date, room_type, total_listings, booked_count,
                    occupancy_rate, avg_daily_price, estimated_revenue
             FROM daily_stats WHERE date = ?1 ORDER BY target_id, room_type",
        )?;
        let rows = stmt.query_map(params![date.to_string()], row_to_daily_stat)?;
        for row in rows {
            out.push(row??);
        }
        Ok(out)
    }

    // ------------------------------------------------------------------
    // Sweep audit log
    // ------------------------------------------------------------------

    pub fn append_sweep_log(&self, log: &SweepLog) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO sweep_logs
                (sweep_id, kind, started_at, finished_at, status,
                 total_tasks, completed, failed, blocked, error)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                log.sweep_id.to_string(),
                log.kind.as_str(),
                fmt_ts(log.started_at),
                fmt_ts(log.finished_at),
                log.status.as_str(),
                log.total_tasks,
                log.completed,
                log.failed,
                log.blocked,
                log.error,
            ],
        )?;
        Ok(())
    }

    /// Row counts across all tables
    pub fn counts(&self) -> Result<StoreCounts> {
        let conn = self.conn.lock().unwrap();
        let count = |table: &str| -> Result<i64> {
            Ok(conn.query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| {
                row.get(0)
            })?)
        };
        Ok(StoreCounts {
            targets: count("targets")?,
            listings: count("listings")?,
            search_snapshots: count("search_snapshots")?,
            calendar_observations: count("calendar_observations")?,
            classifications: count("date_classifications")?,
            daily_stats: count("daily_stats")?,
            sweep_logs: count("sweep_logs")?,
        })
    }
}

const LISTING_SELECT: &str = "SELECT id, market_id, name, room_type, latitude, longitude, \
     target_id, base_price, rating, review_count, first_seen, last_seen FROM listings";

fn row_to_target(row: &Row<'_>) -> rusqlite::Result<Target> {
    Ok(Target {
        id: row.get(0)?,
        name: row.get(1)?,
        line: row.get(2)?,
        district: row.get(3)?,
        latitude: row.get(4)?,
        longitude: row.get(5)?,
        priority: row.get(6)?,
    })
}

fn row_to_listing(row: &Row<'_>) -> rusqlite::Result<Result<Listing>> {
    let room_type: Option<String> = row.get(3)?;
    let first_seen: String = row.get(10)?;
    let last_seen: String = row.get(11)?;
    let listing = (|| {
        Ok(Listing {
            id: row.get(0)?,
            market_id: row.get(1)?,
            name: row.get(2)?,
            room_type: room_type.as_deref().and_then(RoomType::parse),
            latitude: row.get(4)?,
            longitude: row.get(5)?,
            target_id: row.get(6)?,
            base_price: row.get(7)?,
            rating: row.get(8)?,
            review_count: row.get(9)?,
            first_seen: parse_ts(&first_seen)?,
            last_seen: parse_ts(&last_seen)?,
        })
    })();
    Ok(listing)
}

fn row_to_observation(row: &Row<'_>) -> rusqlite::Result<Result<CalendarObservation>> {
    let observed_at: String = row.get(1)?;
    let date: String = row.get(2)?;
    let min_nights: Option<i64> = row.get(5)?;
    let obs = (|| {
        Ok(CalendarObservation {
            listing_id: row.get(0)?,
            observed_at: parse_ts(&observed_at)?,
            date: parse_date(&date)?,
            available: row.get(3)?,
            price: row.get(4)?,
            min_nights: min_nights.map(|n| n as u32),
        })
    })();
    Ok(obs)
}

fn row_to_classification(row: &Row<'_>) -> rusqlite::Result<Result<DateClassification>> {
    let status: String = row.get(0)?;
    let computed_at: String = row.get(2)?;
    let confidence: f64 = row.get(1)?;
    let class = (|| {
        Ok(DateClassification {
            status: DateStatus::parse(&status).unwrap_or(DateStatus::Unknown),
            confidence,
            computed_at: parse_ts(&computed_at)?,
        })
    })();
    Ok(class)
}

fn row_to_daily_stat(row: &Row<'_>) -> rusqlite::Result<Result<DailyStat>> {
    let date: String = row.get(1)?;
    let room_type: String = row.get(2)?;
    let stat = (|| {
        Ok(DailyStat {
            target_id: row.get(0)?,
            date: parse_date(&date)?,
            room_type: RoomType::parse(&room_type),
            total_listings: row.get(3)?,
            booked_count: row.get(4)?,
            occupancy_rate: row.get(5)?,
            avg_daily_price: row.get(6)?,
            estimated_revenue: row.get(7)?,
        })
    })();
    Ok(stat)
}
