//! SQLite snapshot of the claim cache

mod connection;
mod claims;

pub use claims::*;
pub use connection::ClaimStore;
