//! # Pacer Gateway
//!
//! Axum server exposing the operator API (`/api/v1/{channel}/...`) and the
//! provider callback hooks (`/hooks/...`).

pub mod routes;
pub mod server;

pub use server::{AppState, build_router, build_router_from_arc, start};
