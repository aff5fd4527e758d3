//! Orchestration endpoint: one WebSocket per relay connection, keyed by the
//! `X-Session-Id` header, plus a liveness check.

pub mod connection;
pub mod hazard_bridge;
pub mod server;

pub use connection::ConnectionRegistry;
pub use hazard_bridge::HazardBridge;
pub use server::{build_router, start, AppState, ServerConfig, ServerHandle};
