//! Per-host request governor: adaptive pacing + circuit breaker
//!
//! The remote site is the shared resource, so pacing state is keyed by host
//! rather than by search target. Every fetch attempt passes through one
//! governor instance: `admit` reserves the next dispatch slot (base delay +
//! uniform jitter, scaled by an adaptive multiplier) and `report` feeds the
//! outcome back to adjust it.
//!
//! - Success streaks decay the multiplier back toward 1.0.
//! - Soft blocks escalate it by kind (CAPTCHA worst), capped at a ceiling.
//! - A run of consecutive failures opens the circuit: the host is suspended
//!   for a cooldown that doubles on each successive trip, and must pass a
//!   small number of half-open trial requests before traffic resumes.
//! - Hourly and daily request budgets refuse admission once spent.

use chrono::{DateTime, Duration, Utc};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::{debug, error, info, warn};

use crate::config::GovernorConfig;
use crate::crawler::identity::{Identity, IdentityPool};
use crate::error::BlockKind;
use crate::metrics;
use crate::utils::Clock;

/// Outcome of one fetch attempt, as reported back to the governor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchOutcome {
    Success,
    /// CAPTCHA / interstitial / empty-shell response
    SoftBlock(BlockKind),
    /// Timeout or 5xx
    HardError,
    /// 4xx that is not a block shape
    Rejected,
}

impl FetchOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::SoftBlock(_) => "soft_block",
            Self::HardError => "hard_error",
            Self::Rejected => "rejected",
        }
    }
}

/// Admission decision for one request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Decision {
    pub allowed: bool,
    /// Earliest instant the request may be dispatched; when `allowed` is
    /// false, the instant the refusal lapses
    pub proceed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Circuit {
    Closed,
    Open { until: DateTime<Utc> },
    HalfOpen { successes: u32 },
}

#[derive(Debug)]
struct HostState {
    last_slot: Option<DateTime<Utc>>,
    multiplier: f64,
    consecutive_failures: u32,
    circuit: Circuit,
    trips: u32,
    hour_start: DateTime<Utc>,
    hourly_count: u32,
    day_start: DateTime<Utc>,
    daily_count: u32,
    total: u64,
    success: u64,
    failed: u64,
    blocked: u64,
}

impl HostState {
    fn new(now: DateTime<Utc>) -> Self {
        Self {
            last_slot: None,
            multiplier: 1.0,
            consecutive_failures: 0,
            circuit: Circuit::Closed,
            trips: 0,
            hour_start: now,
            hourly_count: 0,
            day_start: now,
            daily_count: 0,
            total: 0,
            success: 0,
            failed: 0,
            blocked: 0,
        }
    }
}

/// Snapshot of one host's governor state for logging
#[derive(Debug, Clone)]
pub struct GovernorStats {
    pub total: u64,
    pub success: u64,
    pub failed: u64,
    pub blocked: u64,
    pub consecutive_failures: u32,
    pub hourly_count: u32,
    pub daily_count: u32,
    pub delay_multiplier: f64,
    pub suspended: bool,
}

/// The single shared choke point for all outbound requests
pub struct RateGovernor {
    cfg: GovernorConfig,
    hosts: Mutex<HashMap<String, HostState>>,
    identities: IdentityPool,
    clock: Arc<dyn Clock>,
    rng: Mutex<ChaCha8Rng>,
}

impl RateGovernor {
    pub fn new(cfg: GovernorConfig, identities: IdentityPool, clock: Arc<dyn Clock>) -> Self {
        Self {
            cfg,
            hosts: Mutex::new(HashMap::new()),
            identities,
            clock,
            rng: Mutex::new(ChaCha8Rng::from_entropy()),
        }
    }

    /// Deterministic jitter for tests
    pub fn with_seed(
        cfg: GovernorConfig,
        identities: IdentityPool,
        clock: Arc<dyn Clock>,
        seed: u64,
    ) -> Self {
        Self {
            cfg,
            hosts: Mutex::new(HashMap::new()),
            identities,
            clock,
            rng: Mutex::new(ChaCha8Rng::seed_from_u64(seed)),
        }
    }

    /// Reserve the next dispatch slot for `host`
    ///
    /// An allowed decision advances the host's pacing state, so concurrent
    /// callers each receive strictly later slots. A refusal (suspension or
    /// spent budget) reserves nothing.
    pub fn admit(&self, host: &str) -> Decision {
        let now = self.clock.now();
        let mut hosts = self.hosts.lock().unwrap();
        let state = hosts
            .entry(host.to_string())
            .or_insert_with(|| HostState::new(now));

        // Roll the budget windows
        if now - state.hour_start >= Duration::hours(1) {
            state.hour_start = now;
            state.hourly_count = 0;
        }
        if now - state.day_start >= Duration::days(1) {
            state.day_start = now;
            state.daily_count = 0;
        }

        match state.circuit {
            Circuit::Open { until } if now < until => {
                return Decision {
                    allowed: false,
                    proceed_at: until,
                };
            }
            Circuit::Open { .. } => {
                info!(host, trials = self.cfg.half_open_trials, "Circuit half-open, probing");
                state.circuit = Circuit::HalfOpen { successes: 0 };
            }
            _ => {}
        }

        if state.hourly_count >= self.cfg.max_requests_per_hour {
            let resume = state.hour_start + Duration::hours(1);
            warn!(host, limit = self.cfg.max_requests_per_hour, "Hourly budget spent");
            return Decision {
                allowed: false,
                proceed_at: resume,
            };
        }
        if state.daily_count >= self.cfg.daily_limit {
            let resume = state.day_start + Duration::days(1);
            warn!(host, limit = self.cfg.daily_limit, "Daily budget spent");
            return Decision {
                allowed: false,
                proceed_at: resume,
            };
        }

        let (lo, hi) = self.cfg.delay_jitter_secs;
        let jitter = self.rng.lock().unwrap().gen_range(lo..=hi);
        let interval_secs = (self.cfg.delay_base_secs + jitter) * state.multiplier;
        let interval = Duration::milliseconds((interval_secs * 1000.0) as i64);

        let proceed_at = match state.last_slot {
            Some(slot) => (slot + interval).max(now),
            None => now,
        };
        state.last_slot = Some(proceed_at);
        state.hourly_count += 1;
        state.daily_count += 1;

        debug!(host, proceed_in_ms = (proceed_at - now).num_milliseconds(), "Admitted");
        Decision {
            allowed: true,
            proceed_at,
        }
    }

    /// Feed an attempt outcome back into the host's pacing state
    pub fn report(&self, host: &str, outcome: FetchOutcome) {
        let now = self.clock.now();
        let mut hosts = self.hosts.lock().unwrap();
        let state = hosts
            .entry(host.to_string())
            .or_insert_with(|| HostState::new(now));

        state.total += 1;
        metrics::record_request(host, outcome.as_str());

        match outcome {
            FetchOutcome::Success => {
                state.success += 1;
                state.consecutive_failures = 0;

                // Slowly normalize after an escalation
                if state.multiplier > 1.0 {
                    state.multiplier = (state.multiplier * 0.9).max(1.0);
                }

                if let Circuit::HalfOpen { successes } = state.circuit {
                    let successes = successes + 1;
                    if successes >= self.cfg.half_open_trials {
                        info!(host, "Circuit closed, recovery confirmed");
                        state.circuit = Circuit::Closed;
                        state.trips = 0;
                    } else {
                        state.circuit = Circuit::HalfOpen { successes };
                    }
                }
            }
            FetchOutcome::SoftBlock(kind) => {
                state.failed += 1;
                state.blocked += 1;
                state.consecutive_failures += 1;

                let factor = match kind {
                    BlockKind::RateLimit => 2.0,
                    BlockKind::Forbidden => 3.0,
                    BlockKind::Captcha => 4.0,
                    BlockKind::Skeleton | BlockKind::ServerError => 1.5,
                };
                state.multiplier = (state.multiplier * factor).min(self.cfg.multiplier_cap);
                warn!(
                    host,
                    kind = %kind,
                    multiplier = format!("{:.1}", state.multiplier),
                    "Block detected, delay escalated"
                );

                metrics::record_block(kind.as_str());
                self.identities.mark_blocked();
                self.check_trip(host, state, now, true);
            }
            FetchOutcome::HardError => {
                state.failed += 1;
                state.consecutive_failures += 1;
                state.multiplier = (state.multiplier * 1.5).min(self.cfg.multiplier_cap);
                self.check_trip(host, state, now, true);
            }
            FetchOutcome::Rejected => {
                state.failed += 1;
                state.consecutive_failures += 1;
                self.check_trip(host, state, now, false);
            }
        }

        metrics::set_delay_multiplier(host, state.multiplier);
    }

    /// Open the circuit when the failure threshold is reached, or
    /// immediately on a failed half-open trial
    fn check_trip(&self, host: &str, state: &mut HostState, now: DateTime<Utc>, failed_trial: bool) {
        let half_open = matches!(state.circuit, Circuit::HalfOpen { .. });
        let tripped = state.consecutive_failures >= self.cfg.failure_threshold
            || (half_open && failed_trial);
        if !tripped {
            return;
        }

        let cooldown_secs = (self.cfg.cooldown_secs.saturating_mul(1 << state.trips.min(16)))
            .min(self.cfg.cooldown_cap_secs);
        state.circuit = Circuit::Open {
            until: now + Duration::seconds(cooldown_secs as i64),
        };
        state.trips += 1;
        state.consecutive_failures = 0;
        error!(
            host,
            cooldown_secs,
            trip = state.trips,
            "Circuit opened, host suspended"
        );
    }

    /// The identity the next request should use
    pub fn identity(&self) -> Identity {
        self.identities.current()
    }

    /// If `host` is currently suspended, when the suspension lapses
    pub fn suspension_until(&self, host: &str) -> Option<DateTime<Utc>> {
        let now = self.clock.now();
        let hosts = self.hosts.lock().unwrap();
        match hosts.get(host).map(|s| s.circuit) {
            Some(Circuit::Open { until }) if until > now => Some(until),
            _ => None,
        }
    }

    /// Snapshot of one host's state
    pub fn host_stats(&self, host: &str) -> Option<GovernorStats> {
        let now = self.clock.now();
        let hosts = self.hosts.lock().unwrap();
        hosts.get(host).map(|s| GovernorStats {
            total: s.total,
            success: s.success,
            failed: s.failed,
            blocked: s.blocked,
            consecutive_failures: s.consecutive_failures,
            hourly_count: s.hourly_count,
            daily_count: s.daily_count,
            delay_multiplier: s.multiplier,
            suspended: matches!(s.circuit, Circuit::Open { until } if until > now),
        })
    }

    /// Classify a block response from status code and body
    ///
    /// 200 responses are inspected for CAPTCHA markers, interstitial pages
    /// and skeleton (client-side rendered shell) bodies.
    pub fn detect_block(status: u16, body: &str) -> Option<BlockKind> {
        match status {
            429 => return Some(BlockKind::RateLimit),
            403 => return Some(BlockKind::Forbidden),
            503 => return Some(BlockKind::ServerError),
            200 => {}
            _ => return None,
        }

        // char-wise to stay on UTF-8 boundaries
        let lower: String = body.chars().take(5000).collect::<String>().to_lowercase();
        if ["captcha", "recaptcha", "hcaptcha", "challenge-platform"]
            .iter()
            .any(|kw| lower.contains(kw))
        {
            return Some(BlockKind::Captcha);
        }
        if ["pardon our interruption", "access denied"]
            .iter()
            .any(|kw| lower.contains(kw))
        {
            return Some(BlockKind::Forbidden);
        }
        if body.len() < 100 && !lower.contains("error") {
            return Some(BlockKind::Skeleton);
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::IdentityConfig;
    use crate::utils::ManualClock;
    use chrono::TimeZone;

    const HOST: &str = "www.example.com";

    fn governor(cfg: GovernorConfig) -> (RateGovernor, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2026, 3, 1, 0, 0, 0).unwrap(),
        ));
        let identities = IdentityPool::new(
            vec!["ua-test".to_string()],
            &IdentityConfig::default(),
            clock.clone(),
        );
        let gov = RateGovernor::with_seed(cfg, identities, clock.clone(), 7);
        (gov, clock)
    }

    fn fast_cfg() -> GovernorConfig {
        GovernorConfig {
            delay_base_secs: 1.0,
            delay_jitter_secs: (0.0, 0.5),
            multiplier_cap: 10.0,
            failure_threshold: 5,
            cooldown_secs: 300,
            cooldown_cap_secs: 3600,
            half_open_trials: 2,
            max_requests_per_hour: 1000,
            daily_limit: 10_000,
        }
    }

    #[test]
    fn test_first_admission_is_immediate() {
        let (gov, clock) = governor(fast_cfg());
        let decision = gov.admit(HOST);
        assert!(decision.allowed);
        assert_eq!(decision.proceed_at, clock.now());
    }

    #[test]
    fn test_slots_are_paced_apart() {
        let (gov, _) = governor(fast_cfg());
        let first = gov.admit(HOST);
        let second = gov.admit(HOST);
        let gap = second.proceed_at - first.proceed_at;
        // base 1.0s + jitter in [0, 0.5]s
        assert!(gap >= Duration::seconds(1), "gap was {gap}");
        assert!(gap <= Duration::milliseconds(1500));
    }

    #[test]
    fn test_suspension_after_consecutive_soft_blocks() {
        let (gov, clock) = governor(fast_cfg());

        for _ in 0..5 {
            gov.report(HOST, FetchOutcome::SoftBlock(BlockKind::RateLimit));
        }

        let decision = gov.admit(HOST);
        assert!(!decision.allowed);
        assert_eq!(decision.proceed_at, clock.now() + Duration::seconds(300));
        assert!(gov.suspension_until(HOST).is_some());

        // Cooldown elapses: admitted again (half-open)
        clock.advance(Duration::seconds(301));
        let decision = gov.admit(HOST);
        assert!(decision.allowed);
        assert!(gov.suspension_until(HOST).is_none());
    }

    #[test]
    fn test_half_open_trial_failure_reopens_with_doubled_cooldown() {
        let (gov, clock) = governor(fast_cfg());

        for _ in 0..5 {
            gov.report(HOST, FetchOutcome::HardError);
        }
        clock.advance(Duration::seconds(301));
        assert!(gov.admit(HOST).allowed);

        // One failed trial reopens immediately, cooldown doubled
        gov.report(HOST, FetchOutcome::HardError);
        let decision = gov.admit(HOST);
        assert!(!decision.allowed);
        assert_eq!(decision.proceed_at, clock.now() + Duration::seconds(600));
    }

    #[test]
    fn test_half_open_trials_close_the_circuit() {
        let (gov, clock) = governor(fast_cfg());

        for _ in 0..5 {
            gov.report(HOST, FetchOutcome::SoftBlock(BlockKind::Forbidden));
        }
        clock.advance(Duration::seconds(301));
        assert!(gov.admit(HOST).allowed);

        gov.report(HOST, FetchOutcome::Success);
        gov.report(HOST, FetchOutcome::Success);

        let stats = gov.host_stats(HOST).unwrap();
        assert!(!stats.suspended);

        // A later single failure must not immediately reopen
        gov.report(HOST, FetchOutcome::HardError);
        assert!(gov.admit(HOST).allowed);
    }

    #[test]
    fn test_multiplier_escalation_and_decay() {
        let (gov, _) = governor(fast_cfg());

        gov.report(HOST, FetchOutcome::SoftBlock(BlockKind::Captcha));
        let m = gov.host_stats(HOST).unwrap().delay_multiplier;
        assert_eq!(m, 4.0);

        gov.report(HOST, FetchOutcome::SoftBlock(BlockKind::Captcha));
        gov.report(HOST, FetchOutcome::SoftBlock(BlockKind::Captcha));
        // Capped at the ceiling
        assert_eq!(gov.host_stats(HOST).unwrap().delay_multiplier, 10.0);

        // Successes decay toward 1.0, never below
        for _ in 0..200 {
            gov.report(HOST, FetchOutcome::Success);
        }
        assert_eq!(gov.host_stats(HOST).unwrap().delay_multiplier, 1.0);
    }

    #[test]
    fn test_hourly_budget_refusal_and_rollover() {
        let mut cfg = fast_cfg();
        cfg.max_requests_per_hour = 3;
        let (gov, clock) = governor(cfg);

        for _ in 0..3 {
            assert!(gov.admit(HOST).allowed);
        }
        let decision = gov.admit(HOST);
        assert!(!decision.allowed);

        clock.advance(Duration::hours(1));
        assert!(gov.admit(HOST).allowed);
    }

    #[test]
    fn test_daily_budget_refusal() {
        let mut cfg = fast_cfg();
        cfg.daily_limit = 2;
        let (gov, _) = governor(cfg);

        assert!(gov.admit(HOST).allowed);
        assert!(gov.admit(HOST).allowed);
        assert!(!gov.admit(HOST).allowed);
    }

    #[test]
    fn test_rejected_counts_toward_trip_without_escalation() {
        let (gov, _) = governor(fast_cfg());

        for _ in 0..4 {
            gov.report(HOST, FetchOutcome::Rejected);
        }
        let stats = gov.host_stats(HOST).unwrap();
        assert_eq!(stats.delay_multiplier, 1.0);
        assert!(!stats.suspended);

        gov.report(HOST, FetchOutcome::Rejected);
        assert!(gov.host_stats(HOST).unwrap().suspended);
    }

    #[test]
    fn test_detect_block_status_codes() {
        assert_eq!(RateGovernor::detect_block(429, ""), Some(BlockKind::RateLimit));
        assert_eq!(RateGovernor::detect_block(403, ""), Some(BlockKind::Forbidden));
        assert_eq!(RateGovernor::detect_block(503, ""), Some(BlockKind::ServerError));
        assert_eq!(RateGovernor::detect_block(500, ""), None);
        assert_eq!(RateGovernor::detect_block(404, ""), None);
    }

    #[test]
    fn test_detect_block_body_markers() {
        let long_pad = "x".repeat(200);
        assert_eq!(
            RateGovernor::detect_block(200, &format!("<html>reCAPTCHA challenge{long_pad}</html>")),
            Some(BlockKind::Captcha)
        );
        assert_eq!(
            RateGovernor::detect_block(200, &format!("Pardon Our Interruption{long_pad}")),
            Some(BlockKind::Forbidden)
        );
        // Implausibly short non-error body
        assert_eq!(
            RateGovernor::detect_block(200, "{}"),
            Some(BlockKind::Skeleton)
        );
        // Short but explicit error payloads are not skeletons
        assert_eq!(RateGovernor::detect_block(200, r#"{"error":"nope"}"#), None);
        // Normal body
        assert_eq!(
            RateGovernor::detect_block(200, &format!(r#"{{"data":{{"ok":true}},"pad":"{long_pad}"}}"#)),
            None
        );
    }

    #[test]
    fn test_deterministic_with_seed() {
        let (gov_a, _) = governor(fast_cfg());
        let (gov_b, _) = governor(fast_cfg());
        for _ in 0..10 {
            assert_eq!(gov_a.admit(HOST).proceed_at, gov_b.admit(HOST).proceed_at);
        }
    }
}
