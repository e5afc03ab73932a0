//! Sweep commands: target loading, search/calendar/detail sweeps, daemon
//!
//! A sweep = enqueue one task per target (or listing) into a fresh
//! scheduler, drain it under the configured concurrency cap, then write one
//! audit row summarizing the run. Tasks inherit their target's priority so
//! tier-1 neighborhoods are always crawled first.

use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context, Result};
use chrono::{Datelike, Timelike};
use serde::Deserialize;
use tracing::{info, warn};
use uuid::Uuid;

use super::Engine;
use crate::crawler::{SchedulerReport, TaskKind};
use crate::metrics;
use crate::models::{SweepKind, SweepLog, SweepStatus};

/// One entry of the target reference file
#[derive(Debug, Deserialize)]
struct TargetSeed {
    name: String,
    line: String,
    district: Option<String>,
    lat: f64,
    lng: f64,
    priority: u8,
}

#[derive(Debug, Deserialize)]
struct TargetFile {
    stations: Vec<TargetSeed>,
}

/// Load geographic targets from a JSON reference file, filtered to the
/// priorities the configured tier covers
pub fn load_targets(engine: &Engine, path: &Path) -> Result<usize> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read targets file: {}", path.display()))?;
    let file: TargetFile =
        serde_json::from_str(&content).context("Failed to parse targets file")?;

    let allowed = engine.config.crawl.tier.settings().target_priorities;
    let mut added = 0;
    for seed in &file.stations {
        if !allowed.contains(&seed.priority) {
            continue;
        }
        if engine.store.insert_target_record(
            &seed.name,
            &seed.line,
            seed.district.as_deref(),
            seed.lat,
            seed.lng,
            seed.priority,
        )? {
            added += 1;
        }
    }

    info!(added, allowed = ?allowed, "Targets loaded");
    Ok(added)
}

fn sweep_status(report: &SchedulerReport) -> SweepStatus {
    if report.failed == 0 {
        SweepStatus::Success
    } else if report.completed > 0 {
        SweepStatus::Partial
    } else {
        SweepStatus::Failed
    }
}

async fn run_sweep(engine: &Engine, kind: SweepKind, tasks: Vec<(TaskKind, u8)>) -> Result<SweepLog> {
    let started_at = engine.clock.now();
    let blocked_before = engine
        .governor
        .host_stats(engine.host())
        .map(|s| s.blocked)
        .unwrap_or(0);

    let scheduler = engine.scheduler();
    let total = tasks.len();
    for (task, tier) in tasks {
        scheduler.enqueue(task, tier, engine.host().to_string());
    }

    let report = scheduler
        .clone()
        .run(engine.config.scheduler.max_concurrency)
        .await;

    let blocked_after = engine
        .governor
        .host_stats(engine.host())
        .map(|s| s.blocked)
        .unwrap_or(0);

    let log = SweepLog {
        sweep_id: Uuid::new_v4(),
        kind,
        started_at,
        finished_at: engine.clock.now(),
        status: sweep_status(&report),
        total_tasks: total as i64,
        completed: report.completed as i64,
        failed: report.failed as i64,
        blocked: (blocked_after - blocked_before) as i64,
        error: None,
    };
    engine.store.append_sweep_log(&log)?;
    metrics::record_sweep(kind.as_str(), log.status.as_str());

    info!(
        kind = %kind,
        status = %log.status,
        completed = log.completed,
        failed = log.failed,
        blocked = log.blocked,
        retried = report.retried,
        "Sweep finished"
    );
    Ok(log)
}

/// Search sweep over every target the configured tier covers
pub async fn run_search_sweep(engine: &Engine) -> Result<SweepLog> {
    let priorities = engine.config.crawl.tier.settings().target_priorities;
    let targets = engine.store.targets(&priorities)?;
    if targets.is_empty() {
        warn!("No targets in store; run init-targets first");
    }

    let tasks = targets
        .iter()
        .map(|t| {
            (
                TaskKind::SearchSweep { target_id: t.id },
                t.priority.clamp(1, 3),
            )
        })
        .collect();
    run_sweep(engine, SweepKind::Search, tasks).await
}

/// Calendar sweep over every known listing, prioritized by its target
pub async fn run_calendar_sweep(engine: &Engine) -> Result<SweepLog> {
    let listings = engine.store.all_listings()?;
    if listings.is_empty() {
        warn!("No listings in store; run a search sweep first");
    }

    let priorities: HashMap<i64, u8> = engine
        .store
        .targets(&[])?
        .into_iter()
        .map(|t| (t.id, t.priority.clamp(1, 3)))
        .collect();

    let tasks = listings
        .iter()
        .map(|l| {
            (
                TaskKind::CalendarSweep { listing_id: l.id },
                priorities.get(&l.target_id).copied().unwrap_or(3),
            )
        })
        .collect();
    run_sweep(engine, SweepKind::Calendar, tasks).await
}

/// Detail refresh over every known listing (tier B/C only)
pub async fn run_detail_sweep(engine: &Engine) -> Result<Option<SweepLog>> {
    if !engine.config.crawl.tier.settings().detail_enabled {
        info!(
            tier = %engine.config.crawl.tier,
            "Detail refresh disabled for this tier"
        );
        return Ok(None);
    }

    let listings = engine.store.all_listings()?;
    let tasks = listings
        .iter()
        .map(|l| (TaskKind::DetailRefresh { listing_id: l.id }, 3))
        .collect();
    let log = run_sweep(engine, SweepKind::Detail, tasks).await?;
    Ok(Some(log))
}

/// Long-running cadence loop: search sweeps on the tier interval, the
/// nightly calendar sweep + reconcile + aggregate chain at the tier hour,
/// weekly detail refresh. Ctrl-C exits between cycles.
pub async fn run_daemon(engine: &Engine) -> Result<()> {
    let tier = engine.config.crawl.tier.settings();
    let search_interval = chrono::Duration::minutes(tier.search_interval_minutes as i64);

    let mut last_search: Option<chrono::DateTime<chrono::Utc>> = None;
    let mut calendar_done_for: Option<chrono::NaiveDate> = None;
    let mut detail_done_week: Option<u32> = None;

    info!(
        tier = %engine.config.crawl.tier,
        search_interval_minutes = tier.search_interval_minutes,
        calendar_hour = tier.calendar_hour,
        "Daemon started"
    );

    loop {
        let now = engine.clock.now();
        let today = now.date_naive();

        if last_search.map_or(true, |at| now - at >= search_interval) {
            last_search = Some(now);
            if let Err(e) = run_search_sweep(engine).await {
                warn!(error = %e, "Search sweep failed");
            }
        }

        if tier.calendar_enabled
            && now.hour() == tier.calendar_hour
            && calendar_done_for != Some(today)
        {
            calendar_done_for = Some(today);
            if let Err(e) = run_calendar_sweep(engine).await {
                warn!(error = %e, "Calendar sweep failed");
            }
            // Fresh observations: refresh the derived tables
            match engine.reconciler().reconcile_all() {
                Ok((listings, dates)) => info!(listings, dates, "Reconciled"),
                Err(e) => warn!(error = %e, "Reconciliation failed"),
            }
            if let Err(e) = engine.aggregator().aggregate_recent(1) {
                warn!(error = %e, "Aggregation failed");
            }
        }

        if tier.detail_enabled
            && now.weekday() == chrono::Weekday::Mon
            && detail_done_week != Some(today.iso_week().week())
        {
            detail_done_week = Some(today.iso_week().week());
            if let Err(e) = run_detail_sweep(engine).await {
                warn!(error = %e, "Detail sweep failed");
            }
        }

        tokio::select! {
            _ = tokio::time::sleep(std::time::Duration::from_secs(60)) => {}
            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown requested");
                break;
            }
        }
    }
    Ok(())
}
