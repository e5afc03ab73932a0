//! Derived-data commands: reconcile, aggregate, stats

use anyhow::Result;
use chrono::NaiveDate;
use tracing::info;

use super::Engine;
use crate::metrics;

/// Recompute classifications for every listing
pub fn run_reconcile(engine: &Engine) -> Result<()> {
    let (listings, dates) = engine.reconciler().reconcile_all()?;
    info!(listings, dates, "Reconciliation complete");
    println!("Reconciled {dates} dates across {listings} listings");
    Ok(())
}

/// Recompute daily statistics
///
/// With an explicit date, that single day; otherwise the `days_back` days
/// preceding today.
pub fn run_aggregate(engine: &Engine, date: Option<NaiveDate>, days_back: u32) -> Result<()> {
    let summary = match date {
        Some(date) => engine.aggregator().aggregate_all(date)?,
        None => engine.aggregator().aggregate_recent(days_back)?,
    };
    println!(
        "Aggregated {} rows across {} targets",
        summary.rows_written, summary.targets_processed
    );
    Ok(())
}

/// Print store counts, per-host governor state and the metrics dump
pub fn run_stats(engine: &Engine, show_metrics: bool) -> Result<()> {
    let counts = engine.store.counts()?;
    println!("Snapshot store");
    println!("==============");
    println!("targets:               {}", counts.targets);
    println!("listings:              {}", counts.listings);
    println!("search snapshots:      {}", counts.search_snapshots);
    println!("calendar observations: {}", counts.calendar_observations);
    println!("classifications:       {}", counts.classifications);
    println!("daily stats:           {}", counts.daily_stats);
    println!("sweep logs:            {}", counts.sweep_logs);

    if let Some(stats) = engine.governor.host_stats(engine.host()) {
        println!();
        println!("Governor ({})", engine.host());
        println!("========");
        println!("requests:  {} ({} ok / {} failed)", stats.total, stats.success, stats.failed);
        println!("blocked:   {}", stats.blocked);
        println!("delay multiplier: {:.1}x", stats.delay_multiplier);
        println!("suspended: {}", stats.suspended);
    }

    if show_metrics {
        println!();
        print!("{}", metrics::gather());
    }
    Ok(())
}
