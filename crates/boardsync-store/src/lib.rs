pub mod database;
pub mod error;
pub mod presence;
pub mod schema;

pub use database::Database;
pub use error::StoreError;
pub use presence::{PresenceRepo, SqlitePresenceStore};
