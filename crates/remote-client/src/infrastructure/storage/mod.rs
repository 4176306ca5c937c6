//! Storage infrastructure: configuration file loading.
//!
//! The `config` sub-module reads the client's TOML file and falls back to
//! defaults when it does not exist yet.

pub mod config;
