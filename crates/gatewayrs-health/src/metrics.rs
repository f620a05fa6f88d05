//! Component A — per-channel sliding-window health tracking (the circuit
//! breaker). Grounded on the map-of-independently-locked-state pattern in
//! `gproxy-provider-core::credential::pool::CredentialPool`.

use std::collections::{HashMap, VecDeque};

use tokio::sync::{Mutex, RwLock};

use gatewayrs_common::Family;

pub const DEFAULT_WINDOW_SIZE: usize = 20;
pub const DEFAULT_FAILURE_THRESHOLD: f64 = 0.5;

type WindowKey = (Family, String);

struct Window {
    outcomes: VecDeque<bool>,
    capacity: usize,
}

impl Window {
    fn new(capacity: usize) -> Self {
        Self {
            outcomes: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    fn push(&mut self, success: bool) {
        if self.outcomes.len() == self.capacity {
            self.outcomes.pop_front();
        }
        self.outcomes.push_back(success);
    }

    fn failure_rate(&self) -> f64 {
        if self.outcomes.is_empty() {
            return 0.0;
        }
        let failures = self.outcomes.iter().filter(|ok| !**ok).count();
        failures as f64 / self.outcomes.len() as f64
    }

    fn is_healthy(&self, threshold: f64) -> bool {
        self.outcomes.len() < self.capacity || self.failure_rate() < threshold
    }
}

/// Holds one independently-locked sliding window per `(family, channel_id)`.
/// Cross-channel operations are never atomic with each other; that's fine —
/// the circuit breaker only needs per-channel consistency.
pub struct MetricsWindows {
    windows: RwLock<HashMap<WindowKey, Mutex<Window>>>,
    capacity: usize,
    threshold: f64,
}

impl MetricsWindows {
    pub fn new() -> Self {
        Self::with_params(DEFAULT_WINDOW_SIZE, DEFAULT_FAILURE_THRESHOLD)
    }

    pub fn with_params(capacity: usize, threshold: f64) -> Self {
        Self {
            windows: RwLock::new(HashMap::new()),
            capacity,
            threshold,
        }
    }

    async fn with_window<R>(&self, family: Family, channel_id: &str, f: impl FnOnce(&mut Window) -> R) -> R {
        {
            let read = self.windows.read().await;
            if let Some(window) = read.get(&(family, channel_id.to_string())) {
                return f(&mut *window.lock().await);
            }
        }
        let mut write = self.windows.write().await;
        let entry = write
            .entry((family, channel_id.to_string()))
            .or_insert_with(|| Mutex::new(Window::new(self.capacity)));
        f(&mut *entry.lock().await)
    }

    pub async fn record_success(&self, family: Family, channel_id: &str) {
        self.with_window(family, channel_id, |w| w.push(true)).await;
    }

    pub async fn record_failure(&self, family: Family, channel_id: &str) {
        self.with_window(family, channel_id, |w| w.push(false)).await;
    }

    pub async fn failure_rate(&self, family: Family, channel_id: &str) -> f64 {
        self.with_window(family, channel_id, |w| w.failure_rate()).await
    }

    pub async fn is_healthy(&self, family: Family, channel_id: &str) -> bool {
        let threshold = self.threshold;
        self.with_window(family, channel_id, |w| w.is_healthy(threshold))
            .await
    }

    pub async fn reset(&self, family: Family, channel_id: &str) {
        self.with_window(family, channel_id, |w| w.outcomes.clear())
            .await;
    }
}

impl Default for MetricsWindows {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn healthy_when_not_enough_data() {
        let windows = MetricsWindows::new();
        for _ in 0..5 {
            windows.record_failure(Family::Messages, "a").await;
        }
        assert!(windows.is_healthy(Family::Messages, "a").await);
    }

    #[tokio::test]
    async fn unhealthy_past_threshold_once_full() {
        let windows = MetricsWindows::with_params(10, 0.5);
        for _ in 0..6 {
            windows.record_failure(Family::Messages, "a").await;
        }
        for _ in 0..4 {
            windows.record_success(Family::Messages, "a").await;
        }
        assert!((windows.failure_rate(Family::Messages, "a").await - 0.6).abs() < f64::EPSILON);
        assert!(!windows.is_healthy(Family::Messages, "a").await);
    }

    #[tokio::test]
    async fn reset_empties_window() {
        let windows = MetricsWindows::new();
        for _ in 0..20 {
            windows.record_failure(Family::Messages, "a").await;
        }
        assert!(!windows.is_healthy(Family::Messages, "a").await);
        windows.reset(Family::Messages, "a").await;
        assert!(windows.is_healthy(Family::Messages, "a").await);
        assert_eq!(windows.failure_rate(Family::Messages, "a").await, 0.0);
    }

    #[tokio::test]
    async fn windows_are_independent_per_channel() {
        let windows = MetricsWindows::new();
        for _ in 0..20 {
            windows.record_failure(Family::Messages, "a").await;
        }
        for _ in 0..20 {
            windows.record_success(Family::Messages, "b").await;
        }
        assert!(!windows.is_healthy(Family::Messages, "a").await);
        assert!(windows.is_healthy(Family::Messages, "b").await);
    }
}
