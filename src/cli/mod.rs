//! quantum-session CLI.
//!
//! - `quantum-session subscribe` - Stream MQTT messages to stdout (kcat -C style)
//! - `quantum-session publish` - Send MQTT messages (kcat -P style)

mod args;
pub mod commands;

pub use args::{BrokerArgs, Cli, Commands, OutputFormat, PublishArgs, QosLevel, SubscribeArgs};
