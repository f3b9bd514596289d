//! club_edge: edge proxy and authorization gate for the club website's data service.
//!
//! - `proxy`: stateless HTTP function that forwards enveloped requests with the
//!   server-held key and relays the upstream response.
//! - `gate`: per-session capability snapshot (admin, overseer, display name)
//!   resolved from role RPCs and the profile table.
//! - `data_service`: HTTP client for the hosted backend, direct or via the proxy.

pub mod error;
pub mod config;
pub mod logging;
pub mod models;
pub mod auth;
// Persisted session (Sled) read at startup as the "existing session"
pub mod storage;
pub mod data_service;
pub mod gate;
// Edge proxy HTTP surface (Axum)
pub mod proxy;
