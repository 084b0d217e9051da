//! Core translation engine module

pub mod bucket_store;
pub mod client;
pub mod clock;
pub mod config;
pub mod context;
pub mod errors;
pub mod models;
pub mod orchestrator;
pub mod rate_limiter;
pub mod store;
pub mod worker;

#[cfg(test)]
pub mod testing;
