//! Client-facing relay. Each client socket gets its own session identity
//! and its own connection to the orchestration endpoint.

pub mod bridge;
pub mod error;
pub mod frames;
pub mod queue;
pub mod server;

pub use bridge::BridgeConfig;
pub use error::RelayError;
pub use queue::PendingQueue;
pub use server::{build_router, start, RelayConfig, RelayHandle};
