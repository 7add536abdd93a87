//! CLI argument definitions using clap.

use crate::mqtt::Qos;
use crate::ops::LogFormat;
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

/// Resilient MQTT 3.1.1 client session.
#[derive(Parser)]
#[command(name = "quantum-session")]
#[command(version)]
#[command(about = "MQTT client that survives broker restarts and network loss")]
pub struct Cli {
    /// Session config file (TOML or JSON); falls back to $QUANTUM_SESSION_CONFIG
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Log filter when RUST_LOG is not set
    #[arg(long, global = true, default_value = "info")]
    pub log_level: String,

    /// Log line encoding on stderr
    #[arg(long, global = true, value_enum, default_value = "text")]
    pub log_format: LogFormatArg,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Subscribe to MQTT topics and stream messages to stdout (kcat-style)
    Subscribe(SubscribeArgs),

    /// Publish MQTT messages from stdin or command line (kcat-style)
    Publish(PublishArgs),
}

#[derive(clap::ValueEnum, Clone, Copy, Default)]
pub enum LogFormatArg {
    Json,
    #[default]
    Text,
}

impl From<LogFormatArg> for LogFormat {
    fn from(value: LogFormatArg) -> Self {
        match value {
            LogFormatArg::Json => LogFormat::Json,
            LogFormatArg::Text => LogFormat::Text,
        }
    }
}

/// Broker connection arguments shared by subscribe/publish commands.
#[derive(Args, Clone)]
pub struct BrokerArgs {
    /// Broker hostname or IP
    #[arg(long, default_value = "127.0.0.1")]
    pub host: String,

    /// Broker TCP port
    #[arg(long, default_value_t = 1883)]
    pub port: u16,

    /// MQTT client identifier (overrides the config file)
    #[arg(long)]
    pub client_id: Option<String>,

    /// Keep-alive interval in seconds; 0 disables pings
    #[arg(long, default_value_t = 60)]
    pub keep_alive: u16,
}

impl BrokerArgs {
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Output format for message and acknowledgement lines.
#[derive(clap::ValueEnum, Clone, Copy, Default)]
pub enum OutputFormat {
    /// JSON objects, one per line
    #[default]
    Json,
    /// Raw payload only (no metadata)
    Raw,
}

/// QoS level for MQTT operations.
#[derive(clap::ValueEnum, Clone, Copy, Default)]
pub enum QosLevel {
    /// At most once (fire and forget)
    Qos0,
    /// At least once (acknowledged delivery)
    #[default]
    Qos1,
    /// Requested as exactly once; publishes are sent at QoS 1
    Qos2,
}

impl From<QosLevel> for Qos {
    fn from(level: QosLevel) -> Self {
        match level {
            QosLevel::Qos0 => Qos::AtMostOnce,
            QosLevel::Qos1 => Qos::AtLeastOnce,
            QosLevel::Qos2 => Qos::ExactlyOnce,
        }
    }
}

#[derive(Args)]
pub struct SubscribeArgs {
    #[command(flatten)]
    pub broker: BrokerArgs,

    /// Comma-separated list of topic filters to subscribe to
    #[arg(long, value_delimiter = ',', required = true)]
    pub topic: Vec<String>,

    /// QoS level for subscriptions
    #[arg(long, value_enum, default_value = "qos1")]
    pub qos: QosLevel,

    /// Output format
    #[arg(long, value_enum, default_value = "json")]
    pub format: OutputFormat,

    /// Exit after this many messages
    #[arg(long)]
    pub count: Option<usize>,
}

/// Parse delimiter string, supporting escape sequences like \t, \n, and hex (0x09).
fn parse_delimiter(s: &str) -> Result<String, String> {
    match s {
        "\\t" => Ok("\t".to_string()),
        "\\n" => Ok("\n".to_string()),
        s if s.starts_with("0x") || s.starts_with("0X") => {
            let byte = u8::from_str_radix(&s[2..], 16)
                .map_err(|_| format!("invalid hex delimiter: {s}"))?;
            String::from_utf8(vec![byte])
                .map_err(|_| format!("delimiter byte {s} is not valid UTF-8"))
        }
        "" => Err("delimiter must not be empty".to_string()),
        _ => Ok(s.to_string()),
    }
}

#[derive(Args)]
pub struct PublishArgs {
    #[command(flatten)]
    pub broker: BrokerArgs,

    /// Topic to publish to (required for single-message mode)
    #[arg(long)]
    pub topic: Option<String>,

    /// Message payload (if omitted, reads from stdin)
    #[arg(long, requires = "topic")]
    pub message: Option<String>,

    /// Delimiter for stdin multi-topic mode (topic<delim>payload)
    #[arg(long, default_value = ":", value_parser = parse_delimiter)]
    pub delimiter: String,

    /// QoS level for publishes
    #[arg(long, value_enum, default_value = "qos1")]
    pub qos: QosLevel,

    /// Set retain flag on published messages
    #[arg(long)]
    pub retain: bool,

    /// Decode payload as base64 (for binary data in stdin multi-topic mode)
    #[arg(long)]
    pub binary: bool,

    /// Output format for acknowledgements/errors
    #[arg(long, value_enum, default_value = "json")]
    pub format: OutputFormat,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn delimiter_escapes() {
        assert_eq!(parse_delimiter("\\t").unwrap(), "\t");
        assert_eq!(parse_delimiter("0x7c").unwrap(), "|");
        assert_eq!(parse_delimiter("::").unwrap(), "::");
        assert!(parse_delimiter("0xzz").is_err());
        assert!(parse_delimiter("").is_err());
    }

    #[test]
    fn subscribe_topics_split_on_commas() {
        let cli = Cli::parse_from([
            "quantum-session",
            "subscribe",
            "--topic",
            "a/+,b/#",
            "--qos",
            "qos0",
            "--port",
            "1884",
        ]);
        let Commands::Subscribe(args) = cli.command else {
            panic!("expected subscribe");
        };
        assert_eq!(args.topic, vec!["a/+", "b/#"]);
        assert_eq!(Qos::from(args.qos), Qos::AtMostOnce);
        assert_eq!(args.broker.address(), "127.0.0.1:1884");
        assert_eq!(args.broker.keep_alive, 60);
    }
}
