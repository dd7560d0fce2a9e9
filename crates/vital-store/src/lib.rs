pub mod analysis;
pub mod checklist;
pub mod db;
pub mod error;
pub mod feedback;
pub mod frameworks;
pub mod goals;
pub mod logs;
pub mod meals;
pub mod messages;
pub mod notifications;
pub mod reset;
pub mod store;
pub mod summaries;
pub mod telemetry;
pub mod types;
pub mod users;
pub mod websearch;

pub use error::{Result, StoreError};
pub use store::Store;
