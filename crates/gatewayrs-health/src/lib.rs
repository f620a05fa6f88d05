//! Health tracking: per-channel circuit breaker windows (component A) and
//! quota bookkeeping with auto-reset + suspensions (component B).

pub mod metrics;
pub mod quota;

pub use metrics::{MetricsWindows, DEFAULT_FAILURE_THRESHOLD, DEFAULT_WINDOW_SIZE};
pub use quota::{QuotaConfig, QuotaKind, QuotaStatus, QuotaTracker, ResetMode, ResetUnit};
