//! HTTP access to the hosted backend's REST interface

mod client;

pub use client::SupabaseClient;
