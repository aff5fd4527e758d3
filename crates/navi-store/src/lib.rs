pub mod database;
pub mod error;
pub mod hazards;
pub mod landmarks;
pub mod schema;
pub mod sessions;
pub mod snapshots;
pub mod store;

pub use database::Database;
pub use error::StoreError;
pub use store::{NavigationStore, SqliteStore};
