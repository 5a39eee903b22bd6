use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;

use crate::error::ApiError;

/// Sliding-window limiter keyed by arbitrary strings. Process-local.
#[derive(Clone)]
pub struct InMemoryRateLimiter {
    hits: Arc<DashMap<String, VecDeque<Instant>>>,
    pub enabled: bool,
}

impl InMemoryRateLimiter {
    pub fn new(enabled: bool) -> Self {
        Self { hits: Arc::new(DashMap::new()), enabled }
    }

    /// Records a hit for `key`; false when the window is already full.
    pub fn check(&self, key: &str, limit: usize, window: Duration) -> bool {
        if !self.enabled {
            return true;
        }
        let now = Instant::now();
        let mut entry = self.hits.entry(key.to_string()).or_default();
        while let Some(front) = entry.front() {
            if now.duration_since(*front) >= window {
                entry.pop_front();
            } else {
                break;
            }
        }
        if entry.len() < limit {
            entry.push_back(now);
            true
        } else {
            false
        }
    }

    /// Drops keys whose windows have fully drained.
    pub fn sweep(&self, window: Duration) {
        let now = Instant::now();
        self.hits.retain(|_, q| q.back().map(|t| now.duration_since(*t) < window).unwrap_or(false));
    }
}

#[derive(Clone, Debug)]
pub struct RateLimitConfig {
    pub enabled: bool,
    pub login_limit: usize,
    pub login_window: Duration,
    pub signup_limit: usize,
    pub signup_window: Duration,
    pub comment_limit: usize,
    pub comment_window: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            login_limit: 10,
            login_window: Duration::from_secs(60),
            signup_limit: 5,
            signup_window: Duration::from_secs(3600),
            comment_limit: 10,
            comment_window: Duration::from_secs(60),
        }
    }
}

impl RateLimitConfig {
    pub fn from_env() -> Self {
        fn usize_env(name: &str, default: usize) -> usize {
            std::env::var(name).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
        }
        fn dur_env(name: &str, default: Duration) -> Duration {
            std::env::var(name).ok().and_then(|v| v.parse().ok()).map(Duration::from_secs).unwrap_or(default)
        }
        let d = Self::default();
        Self {
            enabled: matches!(std::env::var("RL_ENABLED").as_deref(), Ok("1") | Ok("true")),
            login_limit: usize_env("RL_LOGIN_LIMIT", d.login_limit),
            login_window: dur_env("RL_LOGIN_WINDOW", d.login_window),
            signup_limit: usize_env("RL_SIGNUP_LIMIT", d.signup_limit),
            signup_window: dur_env("RL_SIGNUP_WINDOW", d.signup_window),
            comment_limit: usize_env("RL_COMMENT_LIMIT", d.comment_limit),
            comment_window: dur_env("RL_COMMENT_WINDOW", d.comment_window),
        }
    }

    fn longest_window(&self) -> Duration {
        self.login_window.max(self.signup_window).max(self.comment_window)
    }
}

/// Per-action guard used by handlers.
#[derive(Clone)]
pub struct RateLimiterFacade {
    pub limiter: InMemoryRateLimiter,
    pub cfg: RateLimitConfig,
}

impl RateLimiterFacade {
    pub fn new(cfg: RateLimitConfig) -> Self {
        Self { limiter: InMemoryRateLimiter::new(cfg.enabled), cfg }
    }

    pub fn disabled() -> Self {
        Self::new(RateLimitConfig::default())
    }

    fn guard(&self, action: &str, ip: &str, limit: usize, window: Duration) -> Result<(), ApiError> {
        if self.limiter.check(&format!("{action}:{ip}"), limit, window) {
            Ok(())
        } else {
            tracing::warn!(action, ip, "rate limit exceeded");
            Err(ApiError::TooManyRequests)
        }
    }

    pub fn login(&self, ip: &str) -> Result<(), ApiError> {
        self.guard("login", ip, self.cfg.login_limit, self.cfg.login_window)
    }

    pub fn signup(&self, ip: &str) -> Result<(), ApiError> {
        self.guard("signup", ip, self.cfg.signup_limit, self.cfg.signup_window)
    }

    pub fn comment(&self, ip: &str) -> Result<(), ApiError> {
        self.guard("comment", ip, self.cfg.comment_limit, self.cfg.comment_window)
    }

    pub fn sweep(&self) {
        self.limiter.sweep(self.cfg.longest_window());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sliding_window_basic() {
        let rl = InMemoryRateLimiter::new(true);
        let window = Duration::from_millis(50);
        for _ in 0..3 {
            assert!(rl.check("k", 3, window));
        }
        assert!(!rl.check("k", 3, window));
        assert!(rl.check("other", 3, window));
    }

    #[test]
    fn window_drains() {
        let rl = InMemoryRateLimiter::new(true);
        let window = Duration::from_millis(20);
        assert!(rl.check("k", 1, window));
        assert!(!rl.check("k", 1, window));
        std::thread::sleep(Duration::from_millis(30));
        assert!(rl.check("k", 1, window));
        std::thread::sleep(Duration::from_millis(30));
        rl.sweep(window);
        assert!(rl.hits.is_empty());
    }

    #[test]
    fn disabled_facade_never_limits() {
        let f = RateLimiterFacade::disabled();
        for _ in 0..100 {
            assert!(f.login("1.2.3.4").is_ok());
        }
    }

    #[test]
    fn facade_keys_actions_separately() {
        let f = RateLimiterFacade::new(RateLimitConfig { enabled: true, login_limit: 1, ..Default::default() });
        assert!(f.login("ip").is_ok());
        assert_eq!(f.login("ip"), Err(ApiError::TooManyRequests));
        assert!(f.comment("ip").is_ok());
    }
}
