//! Component E — short-TTL stickiness from a hashed client id to the last
//! channel it successfully used.

use std::collections::HashMap;

use time::{Duration, OffsetDateTime};
use tokio::sync::{Mutex, RwLock};

pub const DEFAULT_TTL_SECS: i64 = 30 * 60;

struct AffinityEntry {
    channel_id: String,
    last_use: OffsetDateTime,
}

pub struct TraceAffinityMap {
    entries: RwLock<HashMap<String, Mutex<AffinityEntry>>>,
    ttl: Duration,
}

impl TraceAffinityMap {
    pub fn new() -> Self {
        Self::with_ttl(Duration::seconds(DEFAULT_TTL_SECS))
    }

    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            ttl,
        }
    }

    /// Returns the preferred channel id if present and not idle-expired.
    pub async fn get_preferred(&self, client_id: &str) -> Option<String> {
        let read = self.entries.read().await;
        let entry = read.get(client_id)?;
        let state = entry.lock().await;
        if OffsetDateTime::now_utc() - state.last_use < self.ttl {
            Some(state.channel_id.clone())
        } else {
            None
        }
    }

    pub async fn set_preferred(&self, client_id: &str, channel_id: &str) {
        let now = OffsetDateTime::now_utc();
        {
            let read = self.entries.read().await;
            if let Some(entry) = read.get(client_id) {
                let mut state = entry.lock().await;
                state.channel_id = channel_id.to_string();
                state.last_use = now;
                return;
            }
        }
        let mut write = self.entries.write().await;
        write.insert(
            client_id.to_string(),
            Mutex::new(AffinityEntry { channel_id: channel_id.to_string(), last_use: now }),
        );
    }

    pub async fn update_last_used(&self, client_id: &str) {
        let read = self.entries.read().await;
        if let Some(entry) = read.get(client_id) {
            entry.lock().await.last_use = OffsetDateTime::now_utc();
        }
    }

    /// Housekeeping sweep dropping idle-expired entries; not required for
    /// correctness (reads already treat expired entries as absent) but
    /// keeps the map from growing unboundedly with one-shot clients.
    pub async fn sweep_expired(&self) {
        let now = OffsetDateTime::now_utc();
        let mut write = self.entries.write().await;
        let mut stale = Vec::new();
        for (client_id, entry) in write.iter() {
            if now - entry.lock().await.last_use >= self.ttl {
                stale.push(client_id.clone());
            }
        }
        for client_id in stale {
            write.remove(&client_id);
        }
    }
}

impl Default for TraceAffinityMap {
    fn default() -> Self {
        Self::new()
    }
}
