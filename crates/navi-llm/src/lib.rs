pub mod gemini;
pub mod mock;
pub mod reliable;

pub use gemini::{GeminiBackend, GeminiConfig};
pub use mock::{MockBackend, MockReply};
pub use reliable::{ReliableBackend, ReliableConfig};
