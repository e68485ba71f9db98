//! HTTP adapter (v3).
//!
//! Thin translation layer: scoped auth, request-id canonicalization, RFC
//! 7807 problems, `Retry-After` on every 503. No business decisions live
//! here; readiness, retries, and profiles all belong to the engine.

pub mod auth;
pub mod models;
pub mod problem;
pub mod range;
pub mod request_id;
pub mod routes;
pub mod server;

pub use auth::AuthConfig;
pub use problem::Problem;
pub use request_id::RequestId;
pub use server::{ApiServer, ApiServerConfig, AppState};
