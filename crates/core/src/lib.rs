//! Core crate for the vidtag service: configuration, logging, the in-memory
//! process store, the placeholder tagging task and the HTTP API.

pub mod config;
pub mod logging;
pub mod process;
pub mod processing;
pub mod server;
