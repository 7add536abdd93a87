//! CLI command implementations.

mod pubsub;

pub use pubsub::{run_publish, run_subscribe};
