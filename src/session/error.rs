use super::SessionState;
use crate::mqtt::ConnectReturnCode;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConnectError {
    #[error("network error: {0}")]
    Network(String),
    #[error("broker does not support MQTT 3.1.1")]
    ProtocolMismatch,
    #[error("connection rejected by broker: {0:?}")]
    Rejected(ConnectReturnCode),
    #[error("cannot connect while {0:?}")]
    InvalidState(SessionState),
    #[error("invalid session config: {0}")]
    InvalidConfig(String),
}

impl ConnectError {
    /// Broker rejections are never retried automatically.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ConnectError::ProtocolMismatch | ConnectError::Rejected(_)
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SubscribeError {
    #[error("no acknowledgment before timeout")]
    Timeout,
    #[error("broker rejected subscription to {0:?}")]
    Rejected(String),
    #[error("session is not connected")]
    NotConnected,
    #[error("invalid topic filter: {0}")]
    InvalidFilter(String),
    #[error("too many operations awaiting acknowledgment")]
    Backpressure,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PublishError {
    /// `attempts` counts transmissions that reached the transport.
    #[error("publish not acknowledged after {attempts} attempts")]
    Undelivered { attempts: u32 },
    #[error("publish cancelled by disconnect")]
    Cancelled,
    #[error("session is not connected")]
    NotConnected,
    #[error("invalid topic name: {0}")]
    InvalidTopic(String),
    #[error("too many publishes awaiting acknowledgment")]
    Backpressure,
}
