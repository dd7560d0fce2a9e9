pub mod config;
pub mod error;
pub mod items;
pub mod jsonx;
pub mod secrets;
pub mod timeinfer;
pub mod types;
pub mod units;
