pub mod dispatch;
pub mod engine;
pub mod error;
pub mod metrics;
pub mod proposals;
pub mod similarity;
pub mod windows;

pub use dispatch::AnalysisDispatcher;
pub use error::{AnalysisError, Result};
pub use windows::{AnalysisWindow, RunType};
