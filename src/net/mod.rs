//! Networking layer.
//!
//! - `transport` - stream transports a session runs over

pub mod transport;

pub use transport::*;
