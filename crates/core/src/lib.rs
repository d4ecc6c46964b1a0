//! Claimsync Core - Shared data models, ids, configuration, and errors

pub mod config;
pub mod errors;
pub mod models;
pub mod types;

pub use config::*;
pub use errors::{Error, Result};
pub use models::*;
pub use types::*;
