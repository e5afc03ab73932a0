//! Priority fetch scheduling
//!
//! Tasks (search sweeps, calendar sweeps, detail refreshes) drain from a
//! three-tier priority queue: strict tier order, FIFO within a tier. A
//! global semaphore caps in-flight tasks system-wide; per-host pacing is the
//! governor's business and composes with the cap rather than replacing it.
//!
//! Retry state is explicit task state (attempt count, next-eligible
//! time), not control flow. A governor refusal requeues the task at its
//! original priority with no attempt charged; transient errors retry with
//! task-local exponential backoff up to a bound, then the task is
//! permanently failed and surfaced to metrics and the log, never dropped
//! silently. Parse errors fail immediately: a changed payload shape does
//! not heal on retry.
//!
//! Cancellation is cooperative: checked between dispatches, in-flight
//! fetches run to completion, partial persisted results stay valid.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering as AtomicOrdering};
use std::sync::{Arc, Mutex};
use tokio::sync::{Notify, Semaphore};
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::config::SchedulerConfig;
use crate::crawler::governor::RateGovernor;
use crate::error::OndolErrorTrait;
use crate::metrics;
use crate::models::SweepKind;
use crate::utils::Clock;

/// What one fetch task does
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskKind {
    SearchSweep { target_id: i64 },
    CalendarSweep { listing_id: i64 },
    DetailRefresh { listing_id: i64 },
}

impl TaskKind {
    pub fn sweep_kind(&self) -> SweepKind {
        match self {
            Self::SearchSweep { .. } => SweepKind::Search,
            Self::CalendarSweep { .. } => SweepKind::Calendar,
            Self::DetailRefresh { .. } => SweepKind::Detail,
        }
    }
}

/// One queued fetch task carrying its explicit retry state
#[derive(Debug, Clone)]
pub struct FetchTask {
    pub id: Uuid,
    pub kind: TaskKind,
    /// 1 = highest priority
    pub tier: u8,
    /// Governor key of the remote host this task will hit
    pub host: String,
    pub attempt: u32,
    seq: u64,
    not_before: DateTime<Utc>,
}

/// Executes one task (the sweeper in production, scripted in tests)
#[async_trait]
pub trait TaskRunner: Send + Sync {
    async fn run(&self, task: &FetchTask) -> crate::error::Result<()>;
}

struct ReadyEntry(FetchTask);

impl PartialEq for ReadyEntry {
    fn eq(&self, other: &Self) -> bool {
        self.0.tier == other.0.tier && self.0.seq == other.0.seq
    }
}
impl Eq for ReadyEntry {}
impl PartialOrd for ReadyEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for ReadyEntry {
    // BinaryHeap is a max-heap: reverse so the lowest tier, then the lowest
    // enqueue sequence, pops first
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .0
            .tier
            .cmp(&self.0.tier)
            .then_with(|| other.0.seq.cmp(&self.0.seq))
    }
}

struct DelayedEntry(FetchTask);

impl PartialEq for DelayedEntry {
    fn eq(&self, other: &Self) -> bool {
        self.0.not_before == other.0.not_before && self.0.seq == other.0.seq
    }
}
impl Eq for DelayedEntry {}
impl PartialOrd for DelayedEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for DelayedEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .0
            .not_before
            .cmp(&self.0.not_before)
            .then_with(|| other.0.seq.cmp(&self.0.seq))
    }
}

struct QueueState {
    ready: BinaryHeap<ReadyEntry>,
    delayed: BinaryHeap<DelayedEntry>,
    seq: u64,
}

#[derive(Default)]
struct Counters {
    dispatched: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    retried: AtomicU64,
    requeued: AtomicU64,
}

/// Outcome summary of one scheduler run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SchedulerReport {
    pub dispatched: u64,
    pub completed: u64,
    pub failed: u64,
    pub retried: u64,
    pub requeued: u64,
}

/// Drains a priority queue of fetch tasks under a global concurrency cap
pub struct FetchScheduler {
    governor: Arc<RateGovernor>,
    runner: Arc<dyn TaskRunner>,
    clock: Arc<dyn Clock>,
    cfg: SchedulerConfig,
    queue: Mutex<QueueState>,
    cancelled: AtomicBool,
    in_flight: AtomicUsize,
    notify: Notify,
    counters: Counters,
}

impl FetchScheduler {
    pub fn new(
        governor: Arc<RateGovernor>,
        runner: Arc<dyn TaskRunner>,
        clock: Arc<dyn Clock>,
        cfg: SchedulerConfig,
    ) -> Self {
        Self {
            governor,
            runner,
            clock,
            cfg,
            queue: Mutex::new(QueueState {
                ready: BinaryHeap::new(),
                delayed: BinaryHeap::new(),
                seq: 0,
            }),
            cancelled: AtomicBool::new(false),
            in_flight: AtomicUsize::new(0),
            notify: Notify::new(),
            counters: Counters::default(),
        }
    }

    /// Queue a task at the given tier
    pub fn enqueue(&self, kind: TaskKind, tier: u8, host: impl Into<String>) -> Uuid {
        let id = Uuid::new_v4();
        let mut queue = self.queue.lock().unwrap();
        queue.seq += 1;
        let task = FetchTask {
            id,
            kind,
            tier,
            host: host.into(),
            attempt: 0,
            seq: queue.seq,
            not_before: self.clock.now(),
        };
        queue.ready.push(ReadyEntry(task));
        drop(queue);
        self.notify.notify_waiters();
        id
    }

    /// Request cooperative cancellation: no new dispatches; in-flight
    /// fetches finish and their persisted results stay valid
    pub fn cancel(&self) {
        self.cancelled.store(true, AtomicOrdering::SeqCst);
        self.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(AtomicOrdering::SeqCst)
    }

    /// Tasks waiting in either queue (not counting in-flight)
    pub fn pending(&self) -> usize {
        let queue = self.queue.lock().unwrap();
        queue.ready.len() + queue.delayed.len()
    }

    fn requeue_at(&self, mut task: FetchTask, at: DateTime<Utc>) {
        task.not_before = at;
        self.counters.requeued.fetch_add(1, AtomicOrdering::Relaxed);
        metrics::record_task_requeued();
        let mut queue = self.queue.lock().unwrap();
        queue.delayed.push(DelayedEntry(task));
        drop(queue);
        self.notify.notify_waiters();
    }

    /// Promote matured delayed tasks, then pop the highest-priority ready one
    fn pop_ready(&self, now: DateTime<Utc>) -> Option<FetchTask> {
        let mut queue = self.queue.lock().unwrap();
        while queue
            .delayed
            .peek()
            .map_or(false, |entry| entry.0.not_before <= now)
        {
            if let Some(entry) = queue.delayed.pop() {
                queue.ready.push(ReadyEntry(entry.0));
            }
        }
        queue.ready.pop().map(|entry| entry.0)
    }

    /// How long until the earliest delayed task matures
    fn next_delay(&self, now: DateTime<Utc>) -> Option<std::time::Duration> {
        let queue = self.queue.lock().unwrap();
        queue
            .delayed
            .peek()
            .map(|entry| (entry.0.not_before - now).to_std().unwrap_or_default())
    }

    /// Drain the queue with at most `max_concurrency` tasks in flight
    pub async fn run(self: Arc<Self>, max_concurrency: usize) -> SchedulerReport {
        let semaphore = Arc::new(Semaphore::new(max_concurrency.max(1)));

        loop {
            if self.is_cancelled() {
                break;
            }

            let now = self.clock.now();
            match self.pop_ready(now) {
                Some(task) => {
                    let Ok(permit) = semaphore.clone().acquire_owned().await else {
                        break;
                    };
                    if self.is_cancelled() {
                        // Put the popped task back so it is not lost
                        self.queue.lock().unwrap().ready.push(ReadyEntry(task));
                        break;
                    }

                    let decision = self.governor.admit(&task.host);
                    if !decision.allowed {
                        debug!(
                            task_id = %task.id,
                            host = %task.host,
                            until = %decision.proceed_at,
                            "Governor refused admission, requeueing"
                        );
                        self.requeue_at(task, decision.proceed_at);
                        continue;
                    }

                    self.counters.dispatched.fetch_add(1, AtomicOrdering::Relaxed);
                    self.in_flight.fetch_add(1, AtomicOrdering::SeqCst);
                    let scheduler = Arc::clone(&self);
                    tokio::spawn(async move {
                        let _permit = permit;
                        // Honor the governor-assigned dispatch slot
                        let wait = decision.proceed_at - scheduler.clock.now();
                        if wait > Duration::zero() {
                            if let Ok(wait) = wait.to_std() {
                                tokio::time::sleep(wait).await;
                            }
                        }
                        let result = scheduler.runner.run(&task).await;
                        scheduler.settle(task, result);
                        scheduler.in_flight.fetch_sub(1, AtomicOrdering::SeqCst);
                        scheduler.notify.notify_waiters();
                    });
                }
                None => {
                    let idle = self.in_flight.load(AtomicOrdering::SeqCst) == 0;
                    let next_delay = self.next_delay(now);
                    if idle && next_delay.is_none() {
                        break; // queue drained
                    }
                    // Wait for a completion, a requeue, or the earliest
                    // delayed task to mature; bounded so clock skew cannot
                    // park the loop forever
                    let sleep_for = next_delay
                        .unwrap_or(std::time::Duration::from_millis(50))
                        .clamp(
                            std::time::Duration::from_millis(5),
                            std::time::Duration::from_secs(1),
                        );
                    tokio::select! {
                        _ = self.notify.notified() => {}
                        _ = tokio::time::sleep(sleep_for) => {}
                    }
                }
            }
        }

        // Let in-flight fetches complete or time out
        while self.in_flight.load(AtomicOrdering::SeqCst) > 0 {
            tokio::select! {
                _ = self.notify.notified() => {}
                _ = tokio::time::sleep(std::time::Duration::from_millis(20)) => {}
            }
        }

        self.report()
    }

    /// Route a finished task: done, requeue (blocked), retry, or fail
    fn settle(&self, mut task: FetchTask, result: crate::error::Result<()>) {
        match result {
            Ok(()) => {
                self.counters.completed.fetch_add(1, AtomicOrdering::Relaxed);
                debug!(task_id = %task.id, "Task completed");
            }
            Err(err) if err.is_blocked() => {
                // The governor already put the host on cooldown; requeue at
                // original priority for when the suspension lapses, with no
                // attempt charged; a block is not a task failure
                let resume = self.governor.suspension_until(&task.host).unwrap_or_else(|| {
                    self.clock.now() + Duration::milliseconds(self.cfg.backoff_base_ms as i64)
                });
                warn!(
                    task_id = %task.id,
                    host = %task.host,
                    resume = %resume,
                    "Task hit a block, requeued for after cooldown"
                );
                self.requeue_at(task, resume);
            }
            Err(err) if err.is_recoverable() => {
                task.attempt += 1;
                if task.attempt > self.cfg.max_retries {
                    self.fail(&task, &err);
                } else {
                    let backoff_ms = self
                        .cfg
                        .backoff_base_ms
                        .saturating_mul(1 << (task.attempt - 1).min(16))
                        .min(self.cfg.backoff_cap_ms);
                    warn!(
                        task_id = %task.id,
                        attempt = task.attempt,
                        max = self.cfg.max_retries,
                        backoff_ms,
                        error = %err,
                        "Task failed, retrying"
                    );
                    self.counters.retried.fetch_add(1, AtomicOrdering::Relaxed);
                    metrics::record_task_retried();
                    let at = self.clock.now() + Duration::milliseconds(backoff_ms as i64);
                    self.requeue_at(task, at);
                }
            }
            Err(err) => self.fail(&task, &err),
        }
    }

    /// Permanent failure: surfaced to metrics and the log, never dropped
    fn fail(&self, task: &FetchTask, err: &crate::error::Error) {
        self.counters.failed.fetch_add(1, AtomicOrdering::Relaxed);
        metrics::record_task_failed(task.kind.sweep_kind().as_str());
        error!(
            task_id = %task.id,
            kind = %task.kind.sweep_kind(),
            attempts = task.attempt + 1,
            error = %err,
            "Task permanently failed"
        );
    }

    pub fn report(&self) -> SchedulerReport {
        SchedulerReport {
            dispatched: self.counters.dispatched.load(AtomicOrdering::Relaxed),
            completed: self.counters.completed.load(AtomicOrdering::Relaxed),
            failed: self.counters.failed.load(AtomicOrdering::Relaxed),
            retried: self.counters.retried.load(AtomicOrdering::Relaxed),
            requeued: self.counters.requeued.load(AtomicOrdering::Relaxed),
        }
    }
}
