//! Component D — the rate-limiting layer: per-client admission, per-channel
//! RPM with an optional FIFO queue, and the authentication-failure brake.

pub mod authbrake;
pub mod channel;
pub mod client;

pub use authbrake::{AuthFailureBrake, LadderRung, DEFAULT_LADDER};
pub use channel::{AcquireError, ChannelRateLimiter};
pub use client::{ClientRateLimiter, Decision};
