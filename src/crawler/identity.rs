//! Identity rotation (user agents + proxies)
//!
//! Fingerprint correlation is reduced by rotating the user agent and proxy on
//! a request-count schedule that is independent of backoff state. Proxies
//! that trip block detection are put on cooldown and skipped; when every
//! proxy is cooling down the pool falls back to the last-known-good identity
//! rather than failing the request.

use chrono::{DateTime, Duration, Utc};
use std::sync::{Arc, Mutex};
use tracing::{info, warn};

use crate::config::IdentityConfig;
use crate::utils::Clock;

/// One request identity
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub user_agent: String,
    /// None = direct connection
    pub proxy: Option<String>,
}

/// State of one proxy in the pool
#[derive(Debug, Clone)]
struct ProxyState {
    url: String,
    request_count: u32,
    total_requests: u64,
    blocked_count: u32,
    cooldown_until: Option<DateTime<Utc>>,
}

impl ProxyState {
    fn new(url: String) -> Self {
        Self {
            url,
            request_count: 0,
            total_requests: 0,
            blocked_count: 0,
            cooldown_until: None,
        }
    }

    fn is_available(&self, now: DateTime<Utc>) -> bool {
        self.cooldown_until.map_or(true, |until| now >= until)
    }
}

#[derive(Debug)]
struct PoolState {
    proxies: Vec<ProxyState>,
    proxy_index: usize,
    ua_index: usize,
    since_rotation: u32,
    last_good: Option<Identity>,
}

/// Summary of the proxy pool for logging
#[derive(Debug, Clone)]
pub struct IdentityStats {
    pub proxies: usize,
    pub available: usize,
    pub blocked_total: u32,
}

/// Rotating pool of request identities
pub struct IdentityPool {
    user_agents: Vec<String>,
    rotate_after: u32,
    block_cooldown: Duration,
    state: Mutex<PoolState>,
    clock: Arc<dyn Clock>,
}

impl IdentityPool {
    pub fn new(user_agents: Vec<String>, cfg: &IdentityConfig, clock: Arc<dyn Clock>) -> Self {
        assert!(!user_agents.is_empty(), "user agent pool must not be empty");
        let proxies = cfg
            .proxies
            .iter()
            .map(|u| u.trim())
            .filter(|u| !u.is_empty() && !u.starts_with('#'))
            .map(|u| ProxyState::new(u.to_string()))
            .collect::<Vec<_>>();

        if !proxies.is_empty() {
            info!(count = proxies.len(), "Identity pool initialized with proxies");
        }

        Self {
            user_agents,
            rotate_after: cfg.rotate_after_requests.max(1),
            block_cooldown: Duration::seconds(cfg.block_cooldown_secs as i64),
            state: Mutex::new(PoolState {
                proxies,
                proxy_index: 0,
                ua_index: 0,
                since_rotation: 0,
                last_good: None,
            }),
            clock,
        }
    }

    /// Identity for the next request, applying scheduled rotation
    pub fn current(&self) -> Identity {
        let now = self.clock.now();
        let mut state = self.state.lock().unwrap();

        if state.since_rotation >= self.rotate_after {
            state.since_rotation = 0;
            state.ua_index = (state.ua_index + 1) % self.user_agents.len();
            if !state.proxies.is_empty() {
                state.proxy_index = (state.proxy_index + 1) % state.proxies.len();
            }
        }
        state.since_rotation += 1;

        let user_agent = self.user_agents[state.ua_index].clone();

        let proxy = if state.proxies.is_empty() {
            None
        } else {
            let len = state.proxies.len();
            let mut chosen = None;
            for step in 0..len {
                let idx = (state.proxy_index + step) % len;
                if state.proxies[idx].is_available(now) {
                    state.proxy_index = idx;
                    let p = &mut state.proxies[idx];
                    p.request_count += 1;
                    p.total_requests += 1;
                    chosen = Some(p.url.clone());
                    break;
                }
            }
            match chosen {
                Some(url) => Some(url),
                None => {
                    // Rotation failure is non-fatal: fall back to the last
                    // identity that worked instead of refusing the request
                    warn!(proxies = len, "All proxies cooling down, reusing last-known-good identity");
                    return state
                        .last_good
                        .clone()
                        .unwrap_or(Identity { user_agent, proxy: None });
                }
            }
        };

        let identity = Identity { user_agent, proxy };
        state.last_good = Some(identity.clone());
        identity
    }

    /// Mark the proxy of the current identity blocked and advance
    pub fn mark_blocked(&self) {
        let now = self.clock.now();
        let mut state = self.state.lock().unwrap();
        if state.proxies.is_empty() {
            return;
        }
        let idx = state.proxy_index;
        let cooldown = self.block_cooldown;
        {
            let p = &mut state.proxies[idx];
            p.blocked_count += 1;
            p.cooldown_until = Some(now + cooldown);
            warn!(
                proxy = %p.url,
                blocks = p.blocked_count,
                cooldown_secs = cooldown.num_seconds(),
                "Proxy blocked, rotating"
            );
        }
        state.proxy_index = (idx + 1) % state.proxies.len();
    }

    pub fn has_proxies(&self) -> bool {
        !self.state.lock().unwrap().proxies.is_empty()
    }

    pub fn stats(&self) -> IdentityStats {
        let now = self.clock.now();
        let state = self.state.lock().unwrap();
        IdentityStats {
            proxies: state.proxies.len(),
            available: state.proxies.iter().filter(|p| p.is_available(now)).count(),
            blocked_total: state.proxies.iter().map(|p| p.blocked_count).sum(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::ManualClock;
    use chrono::TimeZone;

    fn pool(proxies: Vec<&str>, rotate_after: u32) -> (IdentityPool, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2026, 3, 1, 0, 0, 0).unwrap(),
        ));
        let cfg = IdentityConfig {
            user_agents: Vec::new(),
            proxies: proxies.into_iter().map(String::from).collect(),
            rotate_after_requests: rotate_after,
            block_cooldown_secs: 300,
        };
        let agents = vec!["ua-0".to_string(), "ua-1".to_string()];
        let pool = IdentityPool::new(agents, &cfg, clock.clone());
        (pool, clock)
    }

    #[test]
    fn test_direct_connection_without_proxies() {
        let (pool, _) = pool(vec![], 10);
        let identity = pool.current();
        assert_eq!(identity.proxy, None);
        assert_eq!(identity.user_agent, "ua-0");
    }

    #[test]
    fn test_rotation_after_request_count() {
        let (pool, _) = pool(vec!["http://p1", "http://p2"], 3);

        // First three requests keep the first identity
        for _ in 0..3 {
            let id = pool.current();
            assert_eq!(id.user_agent, "ua-0");
            assert_eq!(id.proxy.as_deref(), Some("http://p1"));
        }

        // Fourth rotates both user agent and proxy
        let id = pool.current();
        assert_eq!(id.user_agent, "ua-1");
        assert_eq!(id.proxy.as_deref(), Some("http://p2"));
    }

    #[test]
    fn test_blocked_proxy_skipped_until_cooldown() {
        let (pool, clock) = pool(vec!["http://p1", "http://p2"], 1000);

        let id = pool.current();
        assert_eq!(id.proxy.as_deref(), Some("http://p1"));

        pool.mark_blocked();
        let id = pool.current();
        assert_eq!(id.proxy.as_deref(), Some("http://p2"));

        // Block the second too: fall back to last-known-good, never fail
        pool.mark_blocked();
        let id = pool.current();
        assert_eq!(id.proxy.as_deref(), Some("http://p2"));

        // After the cooldown both become available again
        clock.advance(Duration::seconds(301));
        let id = pool.current();
        assert!(id.proxy.is_some());
        assert_eq!(pool.stats().available, 2);
    }

    #[test]
    fn test_stats() {
        let (pool, _) = pool(vec!["http://p1"], 10);
        let _ = pool.current();
        pool.mark_blocked();
        let stats = pool.stats();
        assert_eq!(stats.proxies, 1);
        assert_eq!(stats.available, 0);
        assert_eq!(stats.blocked_total, 1);
    }
}
