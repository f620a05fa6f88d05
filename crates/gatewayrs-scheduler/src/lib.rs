//! §3 data model plus components E (trace affinity) and F (the channel
//! scheduler) — selecting a channel per request from a health-aware pool.

pub mod composite;
pub mod model;
pub mod scheduler;
pub mod trace_affinity;

pub use composite::{resolve, resolve_next_failover, CompositeResolution, MAX_COMPOSITE_DEPTH};
pub use model::{
    matches_model_pattern, strip_thinking_suffix, ApiKeyPermissions, Channel, ChannelCredentials,
    ChannelStatus, CompositeMapping, SERVICE_TYPE_COMPOSITE,
};
pub use scheduler::{ChannelScheduler, Selection, SelectionReason, SchedulerError, Strategy};
pub use trace_affinity::{TraceAffinityMap, DEFAULT_TTL_SECS};
