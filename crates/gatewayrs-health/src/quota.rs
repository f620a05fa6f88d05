//! Component B — quota bookkeeping (counters + scheduled resets) and the
//! suspension table. Grounded on the same map-of-locked-entries shape as
//! [`crate::metrics`], with a background sweep task modeled on
//! `gproxy-provider-core::credential::pool::UnavailableQueue`'s
//! spawn-a-recovery-task pattern.

use std::collections::HashMap;
use std::time::Duration as StdDuration;

use time::{Duration, OffsetDateTime};
use tokio::sync::{Mutex, RwLock};
use tokio::time::interval;

use gatewayrs_common::Family;

const SWEEP_INTERVAL: StdDuration = StdDuration::from_secs(60);

type Key = (Family, String);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuotaKind {
    None,
    Requests,
    Credit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetMode {
    Fixed,
    Rolling,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetUnit {
    Hours,
    Days,
    Weeks,
    Months,
}

#[derive(Debug, Clone, Copy)]
pub struct QuotaConfig {
    pub kind: QuotaKind,
    pub limit: i64,
    pub reset_mode: ResetMode,
    pub reset_interval: u32,
    pub reset_unit: ResetUnit,
    pub first_reset: OffsetDateTime,
}

impl QuotaConfig {
    /// The length of one reset interval. Rolling-mode "months" are
    /// approximated as 30 days per the spec's explicit intentional
    /// approximation; fixed-mode grid computation instead steps real
    /// calendar months (see [`fixed_grid_reset`]).
    fn interval_duration(&self) -> Duration {
        let n = self.reset_interval.max(1) as i64;
        match self.reset_unit {
            ResetUnit::Hours => Duration::hours(n),
            ResetUnit::Days => Duration::days(n),
            ResetUnit::Weeks => Duration::weeks(n),
            ResetUnit::Months => Duration::days(n * 30),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct ChannelUsage {
    used: i64,
    last_reset: OffsetDateTime,
    next_reset: OffsetDateTime,
}

#[derive(Debug, Clone)]
pub struct QuotaStatus {
    pub limit: i64,
    pub used: i64,
    pub remaining: i64,
    pub remaining_percent: f64,
    pub last_reset: OffsetDateTime,
    pub next_reset: OffsetDateTime,
}

#[derive(Debug, Clone)]
struct Suspension {
    until: OffsetDateTime,
    reason: String,
}

pub struct QuotaTracker {
    configs: RwLock<HashMap<Key, QuotaConfig>>,
    usage: RwLock<HashMap<Key, Mutex<ChannelUsage>>>,
    suspensions: RwLock<HashMap<Key, Mutex<Suspension>>>,
}

impl QuotaTracker {
    pub fn new() -> Self {
        Self {
            configs: RwLock::new(HashMap::new()),
            usage: RwLock::new(HashMap::new()),
            suspensions: RwLock::new(HashMap::new()),
        }
    }

    /// Registers (or replaces) the quota configuration for a channel.
    /// Existing usage counters are preserved; only a brand-new channel gets
    /// a fresh `ChannelUsage` seeded at `first_reset`.
    pub async fn configure(&self, family: Family, channel_id: &str, config: QuotaConfig) {
        let key = (family, channel_id.to_string());
        self.configs.write().await.insert(key.clone(), config);
        let mut usage = self.usage.write().await;
        usage.entry(key).or_insert_with(|| {
            Mutex::new(ChannelUsage {
                used: 0,
                last_reset: config.first_reset,
                next_reset: config.first_reset + config.interval_duration(),
            })
        });
    }

    async fn config_for(&self, family: Family, channel_id: &str) -> Option<QuotaConfig> {
        self.configs
            .read()
            .await
            .get(&(family, channel_id.to_string()))
            .copied()
    }

    pub async fn increment(&self, family: Family, channel_id: &str, amount: i64) {
        let Some(config) = self.config_for(family, channel_id).await else {
            return;
        };
        let key = (family, channel_id.to_string());
        let usage = self.usage.read().await;
        let Some(entry) = usage.get(&key) else {
            return;
        };
        let mut state = entry.lock().await;
        state.used += amount;
        if config.reset_mode == ResetMode::Rolling {
            let now = OffsetDateTime::now_utc();
            if state.next_reset < now {
                state.next_reset = now + config.interval_duration();
            }
        }
    }

    pub async fn reset(&self, family: Family, channel_id: &str) {
        let key = (family, channel_id.to_string());
        let usage = self.usage.read().await;
        if let Some(entry) = usage.get(&key) {
            let mut state = entry.lock().await;
            state.used = 0;
            state.last_reset = OffsetDateTime::now_utc();
        }
    }

    pub async fn status(&self, family: Family, channel_id: &str) -> Option<QuotaStatus> {
        let config = self.config_for(family, channel_id).await?;
        let key = (family, channel_id.to_string());
        let usage = self.usage.read().await;
        let entry = usage.get(&key)?;
        let state = entry.lock().await;
        let remaining = (config.limit - state.used).max(0);
        let remaining_percent = if config.limit > 0 {
            (remaining as f64 / config.limit as f64) * 100.0
        } else {
            100.0
        };
        Some(QuotaStatus {
            limit: config.limit,
            used: state.used,
            remaining,
            remaining_percent,
            last_reset: state.last_reset,
            next_reset: state.next_reset,
        })
    }

    pub async fn is_suspended(&self, family: Family, channel_id: &str) -> (bool, Option<OffsetDateTime>, Option<String>) {
        let key = (family, channel_id.to_string());
        let suspensions = self.suspensions.read().await;
        let Some(entry) = suspensions.get(&key) else {
            return (false, None, None);
        };
        let state = entry.lock().await;
        if state.until > OffsetDateTime::now_utc() {
            (true, Some(state.until), Some(state.reason.clone()))
        } else {
            (false, None, None)
        }
    }

    pub async fn set_suspended(&self, family: Family, channel_id: &str, reason: impl Into<String>, duration: StdDuration) {
        let key = (family, channel_id.to_string());
        let until = OffsetDateTime::now_utc()
            + Duration::try_from(duration).unwrap_or(Duration::ZERO);
        let mut suspensions = self.suspensions.write().await;
        match suspensions.get(&key) {
            Some(entry) => {
                let mut state = entry.lock().await;
                state.until = until;
                state.reason = reason.into();
            }
            None => {
                suspensions.insert(
                    key,
                    Mutex::new(Suspension {
                        until,
                        reason: reason.into(),
                    }),
                );
            }
        }
    }

    /// Clears suspensions whose `until` has already passed. Mirrors
    /// `Storage::clear_expired_suspensions` for the in-memory table kept here.
    pub async fn clear_expired_suspensions(&self) {
        let mut suspensions = self.suspensions.write().await;
        let now = OffsetDateTime::now_utc();
        let mut expired = Vec::new();
        for (key, entry) in suspensions.iter() {
            if entry.lock().await.until <= now {
                expired.push(key.clone());
            }
        }
        for key in expired {
            suspensions.remove(&key);
        }
    }

    /// Runs one sweep pass over every quota-configured channel, resetting
    /// counters whose grid/rolling deadline has passed. Exposed separately
    /// from [`Self::spawn_sweeper`] so tests can drive it deterministically.
    pub async fn sweep_once(&self) {
        let now = OffsetDateTime::now_utc();
        let configs = self.configs.read().await.clone();
        let usage = self.usage.read().await;
        for (key, config) in configs.iter() {
            let Some(entry) = usage.get(key) else {
                continue;
            };
            let mut state = entry.lock().await;
            let should_reset = match config.reset_mode {
                ResetMode::Rolling => state.next_reset < now && state.last_reset < state.next_reset,
                ResetMode::Fixed => {
                    let grid = fixed_grid_reset(config.first_reset, *config, now);
                    state.last_reset < grid
                }
            };
            if should_reset {
                state.used = 0;
                state.last_reset = now;
                if config.reset_mode == ResetMode::Rolling {
                    state.next_reset = now + config.interval_duration();
                }
            }
        }
        self.clear_expired_suspensions().await;
    }

    pub fn spawn_sweeper(self: std::sync::Arc<Self>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = interval(SWEEP_INTERVAL);
            loop {
                ticker.tick().await;
                self.sweep_once().await;
            }
        })
    }
}

impl Default for QuotaTracker {
    fn default() -> Self {
        Self::new()
    }
}

/// Computes the most recent on-grid fixed reset instant: the latest
/// `first_reset + k * interval` that is `<= now`, stepping real calendar
/// units for hours/days/weeks and calendar months (not the 30-day
/// approximation) for `Months`, per the fixed-grid/rolling-grid distinction
/// called out as intentional.
fn fixed_grid_reset(first_reset: OffsetDateTime, config: QuotaConfig, now: OffsetDateTime) -> OffsetDateTime {
    if first_reset > now {
        return first_reset;
    }
    if config.reset_unit == ResetUnit::Months {
        let mut candidate = first_reset;
        loop {
            let next = add_months(candidate, config.reset_interval.max(1) as i64);
            if next > now {
                return candidate;
            }
            candidate = next;
        }
    }
    let interval = config.interval_duration();
    if interval <= Duration::ZERO {
        return first_reset;
    }
    let elapsed = now - first_reset;
    let steps = (elapsed.whole_seconds() / interval.whole_seconds().max(1)).max(0);
    first_reset + interval * steps as i32
}

fn add_months(dt: OffsetDateTime, months: i64) -> OffsetDateTime {
    use time::Month;

    let total_months = (dt.month() as i64 - 1) + months;
    let year_offset = total_months.div_euclid(12);
    let month_index = total_months.rem_euclid(12);
    let year = dt.year() as i64 + year_offset;
    let month = Month::try_from((month_index + 1) as u8).unwrap_or(Month::January);
    let last_day = days_in_month(year as i32, month);
    let day = dt.day().min(last_day);
    let date = time::Date::from_calendar_date(year as i32, month, day).unwrap_or(dt.date());
    date.with_time(dt.time()).assume_utc()
}

fn days_in_month(year: i32, month: time::Month) -> u8 {
    use time::Month::*;
    match month {
        January | March | May | July | August | October | December => 31,
        April | June | September | November => 30,
        February => {
            if (year % 4 == 0 && year % 100 != 0) || year % 400 == 0 {
                29
            } else {
                28
            }
        }
    }
}
