//! Core infrastructure.
//!
//! - `config` - Session configuration parsing and validation

pub mod config;

pub use config::*;
