//! Authentication-failure brake: a per-IP failure ladder that blocks an
//! abusive source for an escalating duration.

use std::collections::HashMap;

use time::{Duration as TimeDuration, OffsetDateTime};
use tokio::sync::{Mutex, RwLock};

const FAILURE_RECORD_TTL: TimeDuration = TimeDuration::hours(1);

/// A threshold ladder entry: once an IP's failure count reaches `failures`,
/// it is blocked for `block_minutes`. Must be sorted ascending by
/// `failures`; the highest threshold met applies.
#[derive(Debug, Clone, Copy)]
pub struct LadderRung {
    pub failures: u32,
    pub block_minutes: i64,
}

pub const DEFAULT_LADDER: &[LadderRung] = &[
    LadderRung { failures: 5, block_minutes: 1 },
    LadderRung { failures: 10, block_minutes: 5 },
    LadderRung { failures: 20, block_minutes: 30 },
];

struct FailureEntry {
    count: u32,
    last_failure: OffsetDateTime,
    blocked_until: Option<OffsetDateTime>,
}

pub struct AuthFailureBrake {
    entries: RwLock<HashMap<String, Mutex<FailureEntry>>>,
    ladder: Vec<LadderRung>,
}

impl AuthFailureBrake {
    pub fn new(ladder: Vec<LadderRung>) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            ladder,
        }
    }

    pub fn with_default_ladder() -> Self {
        Self::new(DEFAULT_LADDER.to_vec())
    }

    pub async fn is_blocked(&self, ip: &str) -> bool {
        let read = self.entries.read().await;
        let Some(entry) = read.get(ip) else {
            return false;
        };
        match entry.lock().await.blocked_until {
            Some(until) => until > OffsetDateTime::now_utc(),
            None => false,
        }
    }

    pub async fn record_failure(&self, ip: &str) {
        let now = OffsetDateTime::now_utc();
        {
            let read = self.entries.read().await;
            if let Some(entry) = read.get(ip) {
                let mut state = entry.lock().await;
                state.count += 1;
                state.last_failure = now;
                state.blocked_until = self.blocked_until_for(state.count, now);
                return;
            }
        }
        let mut write = self.entries.write().await;
        let blocked_until = self.blocked_until_for(1, now);
        write.insert(
            ip.to_string(),
            Mutex::new(FailureEntry { count: 1, last_failure: now, blocked_until }),
        );
    }

    fn blocked_until_for(&self, count: u32, now: OffsetDateTime) -> Option<OffsetDateTime> {
        self.ladder
            .iter()
            .rev()
            .find(|rung| count >= rung.failures)
            .map(|rung| now + TimeDuration::minutes(rung.block_minutes))
    }

    /// A successful authentication clears the counter entirely.
    pub async fn record_success(&self, ip: &str) {
        self.entries.write().await.remove(ip);
    }

    /// Drops failure records whose last failure is older than one hour.
    pub async fn sweep(&self) {
        let now = OffsetDateTime::now_utc();
        let mut write = self.entries.write().await;
        let mut stale = Vec::new();
        for (ip, entry) in write.iter() {
            if now - entry.lock().await.last_failure >= FAILURE_RECORD_TTL {
                stale.push(ip.clone());
            }
        }
        for ip in stale {
            write.remove(&ip);
        }
    }
}

impl Default for AuthFailureBrake {
    fn default() -> Self {
        Self::with_default_ladder()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn blocks_after_threshold_and_clears_on_success() {
        let brake = AuthFailureBrake::with_default_ladder();
        for _ in 0..5 {
            brake.record_failure("1.2.3.4").await;
        }
        assert!(brake.is_blocked("1.2.3.4").await);
        brake.record_success("1.2.3.4").await;
        assert!(!brake.is_blocked("1.2.3.4").await);
    }

    #[tokio::test]
    async fn unknown_ip_is_not_blocked() {
        let brake = AuthFailureBrake::with_default_ladder();
        assert!(!brake.is_blocked("9.9.9.9").await);
    }

    #[tokio::test]
    async fn higher_rung_yields_longer_block() {
        let brake = AuthFailureBrake::with_default_ladder();
        for _ in 0..10 {
            brake.record_failure("5.5.5.5").await;
        }
        let read = brake.entries.read().await;
        let entry = read.get("5.5.5.5").unwrap().lock().await;
        let until = entry.blocked_until.unwrap();
        assert!(until - OffsetDateTime::now_utc() > TimeDuration::minutes(4));
    }
}
