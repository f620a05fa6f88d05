//! Inbound HTTP surface (§6): the three frontend protocol families, each
//! routed independently, and the common rate-limit/SSE header handling
//! shared across them, plus a read-only admin status surface. Admin CRUD,
//! the embedded web UI, and protocol conversion itself are external
//! collaborators this crate does not own.

mod admin;
mod routes;

pub use admin::{admin_router, AdminState};
pub use routes::{gateway_router, AppState};
