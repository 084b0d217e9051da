//! HTTP API for registering, starting and polling jobs

pub mod api;
