//! `cadence-core`: configuration shared by the store and the operator CLI.

pub mod config;
pub mod error;

pub use config::{CadenceConfig, RecurrenceConfig};
pub use error::{CadenceError, Result};
