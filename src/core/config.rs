use crate::mqtt::Qos;
use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

const DEFAULT_CONFIG_PATH: &str = "config/session.toml";
const CONFIG_ENV: &str = "QUANTUM_SESSION_CONFIG";

/// Session settings. Every field has a default, so an empty file is valid.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub client_id: String,
    pub clean_session: bool,
    pub connect_timeout_ms: u64,
    pub subscribe_timeout_ms: u64,
    pub write_timeout_ms: u64,
    /// Grace period for a PINGRESP after a PINGREQ.
    pub ping_timeout_ms: u64,
    pub max_packet_size: usize,
    /// QoS>=1 publishes and subscribe requests awaiting acknowledgment.
    pub max_inflight: usize,
    pub command_queue: usize,
    pub retry: RetryConfig,
    pub reconnect: ReconnectConfig,
    pub will: Option<WillConfig>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            client_id: "quantum-session".to_string(),
            clean_session: true,
            connect_timeout_ms: 10_000,
            subscribe_timeout_ms: 10_000,
            write_timeout_ms: 10_000,
            ping_timeout_ms: 5_000,
            max_packet_size: 1024 * 1024,
            max_inflight: 1_024,
            command_queue: 64,
            retry: RetryConfig::default(),
            reconnect: ReconnectConfig::default(),
            will: None,
        }
    }
}

/// QoS>=1 publish retransmission.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Wait for the first PUBACK; doubles after every retry.
    pub ack_timeout_ms: u64,
    pub max_interval_ms: u64,
    pub max_retries: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            ack_timeout_ms: 5_000,
            max_interval_ms: 60_000,
            max_retries: 3,
        }
    }
}

/// Reconnection after an unexpected transport loss.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    pub enabled: bool,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub jitter: bool,
    /// `None` retries forever.
    pub max_attempts: Option<u32>,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            base_delay_ms: 100,
            max_delay_ms: 30_000,
            jitter: true,
            max_attempts: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct WillConfig {
    pub topic: String,
    #[serde(default)]
    pub payload: String,
    #[serde(default = "default_will_qos")]
    pub qos: Qos,
    #[serde(default)]
    pub retain: bool,
}

fn default_will_qos() -> Qos {
    Qos::AtMostOnce
}

impl SessionConfig {
    /// Load from the path in QUANTUM_SESSION_CONFIG, falling back to
    /// `config/session.toml`, or defaults when neither exists.
    pub fn load_from_env() -> Result<Self> {
        match std::env::var_os(CONFIG_ENV) {
            Some(path) => Self::load(PathBuf::from(path)),
            None => {
                let path = Path::new(DEFAULT_CONFIG_PATH);
                if path.exists() {
                    Self::load(path)
                } else {
                    Ok(Self::default())
                }
            }
        }
    }

    /// Load configuration from a specific file (TOML or JSON based on extension).
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path_ref = path.as_ref();
        let data = fs::read_to_string(path_ref)
            .with_context(|| format!("unable to read config {}", path_ref.display()))?;
        let cfg: Self = if is_json(path_ref) {
            serde_json::from_str(&data)
                .with_context(|| format!("invalid JSON config {}", path_ref.display()))?
        } else {
            toml::from_str(&data)
                .with_context(|| format!("invalid TOML config {}", path_ref.display()))?
        };
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        if self.client_id.is_empty() && !self.clean_session {
            bail!("an empty client_id requires clean_session = true");
        }
        if self.client_id.len() > 65_535 {
            bail!("client_id exceeds 65535 bytes");
        }
        for (name, value) in [
            ("connect_timeout_ms", self.connect_timeout_ms),
            ("subscribe_timeout_ms", self.subscribe_timeout_ms),
            ("write_timeout_ms", self.write_timeout_ms),
            ("ping_timeout_ms", self.ping_timeout_ms),
            ("retry.ack_timeout_ms", self.retry.ack_timeout_ms),
        ] {
            if value == 0 {
                bail!("{name} must be > 0");
            }
        }
        if self.retry.max_interval_ms < self.retry.ack_timeout_ms {
            bail!("retry.max_interval_ms must be >= retry.ack_timeout_ms");
        }
        if self.reconnect.max_delay_ms < self.reconnect.base_delay_ms {
            bail!("reconnect.max_delay_ms must be >= reconnect.base_delay_ms");
        }
        if self.reconnect.max_attempts == Some(0) {
            bail!("reconnect.max_attempts must be > 0 when set");
        }
        if self.max_inflight == 0 || self.max_inflight >= usize::from(u16::MAX) {
            bail!("max_inflight must be in 1..65535");
        }
        if self.command_queue == 0 {
            bail!("command_queue must be > 0");
        }
        if self.max_packet_size == 0 {
            bail!("max_packet_size must be > 0");
        }
        if let Some(will) = &self.will {
            crate::mqtt::topics::validate_topic_name(&will.topic)
                .context("will.topic is not a valid topic name")?;
        }
        Ok(())
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn subscribe_timeout(&self) -> Duration {
        Duration::from_millis(self.subscribe_timeout_ms)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }

    pub fn ping_timeout(&self) -> Duration {
        Duration::from_millis(self.ping_timeout_ms)
    }
}

impl RetryConfig {
    pub fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_ms)
    }

    pub fn max_interval(&self) -> Duration {
        Duration::from_millis(self.max_interval_ms)
    }
}

fn is_json(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("json"))
}
