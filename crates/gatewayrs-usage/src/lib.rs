//! Component H: usage extraction from upstream responses, streaming or not.

pub mod sse;
pub mod usage;

pub use sse::{SseEvent, SseParser};
pub use usage::{StreamUsage, UsageExtractor};
