pub mod database;
pub mod error;
pub mod events;
pub mod jobs;
pub mod schema;

pub use database::Database;
pub use error::StoreError;
pub use events::{EventLogRepo, NewEvent};
pub use jobs::JobRepo;
