//! MQTT 3.1.1 wire protocol.
//!
//! - `protocol` - control packet codec
//! - `topics` - topic name/filter validation and matching

pub mod protocol;
pub mod topics;

pub use protocol::*;
