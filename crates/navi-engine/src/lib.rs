pub mod agents;
pub mod bus;
pub mod context;
pub mod dispatcher;
pub mod error;
pub mod merge;
pub mod orchestrator;
pub mod persist;
pub mod session;
pub mod tools;

pub use bus::HazardBus;
pub use context::{ContextConfig, ContextStats, ContextStore};
pub use dispatcher::{AgentOutcome, Dispatched, Dispatcher, Plan};
pub use error::EngineError;
pub use orchestrator::{EngineConfig, NavigationOrchestrator, Orchestrator};
pub use persist::PersistWriter;
pub use session::{Admission, Session, SessionState};
