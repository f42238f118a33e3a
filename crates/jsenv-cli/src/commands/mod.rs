//! CLI command implementations

pub mod config;
pub mod handshake;
pub mod run;
