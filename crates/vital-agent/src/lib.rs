pub mod checkin;
pub mod checklist_sync;
pub mod context;
pub mod error;
pub mod feedback;
pub mod goal_sync;
pub mod menu;
pub mod parser;
pub mod profile_sync;
pub mod router;
pub mod scope;
pub mod signals;
pub mod specialists;
pub mod timegate;
pub mod tools;
pub mod turn;

pub use error::AgentError;
pub use turn::{Agent, TurnEvent};
