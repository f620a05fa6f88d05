//! Ambient stack shared by every `gatewayrs-*` crate: process configuration,
//! the cross-component event bus, and common error glue.
//!
//! Mirrors `gproxy-common` in spirit: small, dependency-light, and free of
//! any IO so it can sit at the bottom of the dependency graph.

pub mod config;
pub mod events;

pub use config::{GatewayConfig, GatewayConfigError, GatewayConfigPatch};
pub use events::{Event, EventHub, EventSink};

use serde::{Deserialize, Serialize};

/// The three stable frontend protocol families. Channels never cross
/// families: a `Claude` channel can only ever serve a `Messages` request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Family {
    Messages,
    Responses,
    Gemini,
}

impl Family {
    pub fn as_str(self) -> &'static str {
        match self {
            Family::Messages => "messages",
            Family::Responses => "responses",
            Family::Gemini => "gemini",
        }
    }
}

impl std::fmt::Display for Family {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Initializes `tracing-subscriber` with env-filter, matching the app's
/// bootstrap step. Safe to call more than once; later calls are ignored.
pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init();
}
