//! `herald-core`: configuration, shared errors and UTC/display-timezone
//! conversion used by every other herald crate.

pub mod config;
pub mod error;
pub mod time;

pub use config::HeraldConfig;
pub use error::{HeraldError, Result};
