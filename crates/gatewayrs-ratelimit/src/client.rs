//! Client-side admission: a fixed-window-per-client RPM counter.

use std::collections::HashMap;

use time::{Duration, OffsetDateTime};
use tokio::sync::{Mutex, RwLock};

const WINDOW: Duration = Duration::seconds(60);
/// A window idle for twice its own length is safe to drop without risking
/// reviving a counter an in-flight request still expects to see.
const SWEEP_IDLE: Duration = Duration::seconds(120);

#[derive(Debug, Clone, Copy)]
pub struct Decision {
    pub allowed: bool,
    pub limit: u32,
    pub remaining: u32,
    pub reset_at: OffsetDateTime,
}

struct Window {
    count: u32,
    window_start: OffsetDateTime,
}

/// Keyed by `key:<api-key-name>` or `ip:<client-ip>` per spec §4.D.
pub struct ClientRateLimiter {
    entries: RwLock<HashMap<String, Mutex<Window>>>,
}

impl ClientRateLimiter {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Checks and (if allowed) consumes one slot for `key`. The effective
    /// limit is `max(per_key_rpm, global_rpm)` when `per_key_rpm > 0`,
    /// else just `global_rpm`.
    pub async fn check(&self, key: &str, per_key_rpm: u32, global_rpm: u32) -> Decision {
        let limit = if per_key_rpm > 0 {
            per_key_rpm.max(global_rpm)
        } else {
            global_rpm
        };
        let now = OffsetDateTime::now_utc();

        {
            let read = self.entries.read().await;
            if let Some(window) = read.get(key) {
                return Self::apply(&mut *window.lock().await, limit, now);
            }
        }
        let mut write = self.entries.write().await;
        let window = write
            .entry(key.to_string())
            .or_insert_with(|| Mutex::new(Window { count: 0, window_start: now }));
        Self::apply(&mut *window.lock().await, limit, now)
    }

    fn apply(window: &mut Window, limit: u32, now: OffsetDateTime) -> Decision {
        if now - window.window_start >= WINDOW {
            window.count = 0;
            window.window_start = now;
        }
        let reset_at = window.window_start + WINDOW;
        if limit == 0 {
            return Decision { allowed: true, limit, remaining: u32::MAX, reset_at };
        }
        if window.count < limit {
            window.count += 1;
            Decision {
                allowed: true,
                limit,
                remaining: limit - window.count,
                reset_at,
            }
        } else {
            Decision { allowed: false, limit, remaining: 0, reset_at }
        }
    }

    /// Drops windows that have been idle long enough that a fresh request
    /// would start a new window anyway. Intended to run once a minute.
    pub async fn sweep_expired(&self) {
        let now = OffsetDateTime::now_utc();
        let mut write = self.entries.write().await;
        let mut stale = Vec::new();
        for (key, window) in write.iter() {
            if now - window.lock().await.window_start >= SWEEP_IDLE {
                stale.push(key.clone());
            }
        }
        for key in stale {
            write.remove(&key);
        }
    }
}

impl Default for ClientRateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn allows_up_to_limit_then_denies() {
        let limiter = ClientRateLimiter::new();
        for _ in 0..5 {
            let decision = limiter.check("key:a", 5, 0).await;
            assert!(decision.allowed);
        }
        let decision = limiter.check("key:a", 5, 0).await;
        assert!(!decision.allowed);
    }

    #[tokio::test]
    async fn per_key_limit_overrides_lower_global() {
        let limiter = ClientRateLimiter::new();
        for _ in 0..8 {
            let decision = limiter.check("key:a", 8, 2).await;
            assert!(decision.allowed);
        }
    }

    #[tokio::test]
    async fn global_limit_applies_when_no_per_key_limit() {
        let limiter = ClientRateLimiter::new();
        for _ in 0..3 {
            let decision = limiter.check("ip:1.2.3.4", 0, 3).await;
            assert!(decision.allowed);
        }
        assert!(!limiter.check("ip:1.2.3.4", 0, 3).await.allowed);
    }

    #[tokio::test]
    async fn independent_keys_do_not_share_a_window() {
        let limiter = ClientRateLimiter::new();
        for _ in 0..2 {
            assert!(limiter.check("key:a", 2, 0).await.allowed);
        }
        assert!(limiter.check("key:b", 2, 0).await.allowed);
    }
}
