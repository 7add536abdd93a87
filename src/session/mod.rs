//! Client session: a single long-lived MQTT 3.1.1 connection that survives
//! network loss.
//!
//! A [`Session`] is a cheap cloneable handle. After the first successful
//! CONNACK a background task owns the connection; it answers keep-alive,
//! retransmits unacknowledged QoS 1 publishes, and reconnects with backoff,
//! replaying every active subscription once per reconnect.
//!
//! State machine:
//!
//! ```text
//! Disconnected -> Connecting -> Connected <-> Reconnecting
//!       ^              |             |              |
//!       +--------------+             +------+-------+
//!                                           v
//!                        (disconnect)    Closed
//! ```

mod backoff;
mod error;
mod event_loop;
mod link;
mod pending;
mod subscriptions;

pub use backoff::Backoff;
pub use error::{ConnectError, PublishError, SubscribeError};
pub use subscriptions::{Subscription, SubscriptionSet};

use crate::core::config::SessionConfig;
use crate::mqtt::{topics, Qos};
use crate::net::{TcpTransport, Transport, TransportError};
use bytes::Bytes;
use event_loop::EventLoop;
use link::Target;
use parking_lot::Mutex;
use pending::{PublishReply, SubscribeReply};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Closed,
}

/// Outcome of an accepted CONNACK.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Connected {
    /// Broker reported stored state for this client id.
    pub session_present: bool,
    /// False for the first connect, true for every automatic reconnect.
    pub reconnected: bool,
}

/// A PUBLISH delivered by the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Bytes,
    pub qos: Qos,
    pub retained: bool,
    pub duplicate: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectReason {
    /// No PINGRESP arrived within the ping timeout.
    KeepAliveTimeout,
    /// The broker closed the stream.
    TransportClosed,
    Transport(String),
    Protocol(String),
    /// `Session::disconnect` was called.
    Requested,
}

impl From<TransportError> for DisconnectReason {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::Closed => DisconnectReason::TransportClosed,
            TransportError::IoFailure(err) => DisconnectReason::Transport(err.to_string()),
            TransportError::Malformed(msg) => DisconnectReason::Protocol(msg),
        }
    }
}

type ConnectCallback = Box<dyn FnMut(&Connected) + Send>;
type MessageCallback = Box<dyn FnMut(InboundMessage) + Send>;
type DisconnectCallback = Box<dyn FnMut(&DisconnectReason) + Send>;

#[derive(Default)]
pub(crate) struct Callbacks {
    on_connect: Option<ConnectCallback>,
    on_message: Option<MessageCallback>,
    on_disconnect: Option<DisconnectCallback>,
}

pub(crate) enum Command {
    Subscribe {
        filter: String,
        qos: Qos,
        reply: SubscribeReply,
    },
    Unsubscribe {
        filter: String,
        reply: SubscribeReply,
    },
    Publish {
        topic: String,
        payload: Bytes,
        qos: Qos,
        retain: bool,
        reply: PublishReply,
    },
}

pub(crate) struct Inner {
    config: SessionConfig,
    transport: Arc<dyn Transport>,
    callbacks: Arc<Mutex<Callbacks>>,
    subscriptions: Arc<Mutex<SubscriptionSet>>,
    state_tx: Arc<watch::Sender<SessionState>>,
    state_rx: watch::Receiver<SessionState>,
    shutdown_tx: watch::Sender<bool>,
    commands: Mutex<Option<mpsc::Sender<Command>>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

#[derive(Clone)]
pub struct Session {
    inner: Arc<Inner>,
}

impl Session {
    pub fn new(config: SessionConfig, transport: impl Transport + 'static) -> Self {
        let (state_tx, state_rx) = watch::channel(SessionState::Disconnected);
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                config,
                transport: Arc::new(transport),
                callbacks: Arc::new(Mutex::new(Callbacks::default())),
                subscriptions: Arc::new(Mutex::new(SubscriptionSet::new())),
                state_tx: Arc::new(state_tx),
                state_rx,
                shutdown_tx,
                commands: Mutex::new(None),
                task: Mutex::new(None),
            }),
        }
    }

    /// Session over plain TCP.
    pub fn tcp(config: SessionConfig) -> Self {
        Self::new(config, TcpTransport::new())
    }

    pub fn config(&self) -> &SessionConfig {
        &self.inner.config
    }

    pub fn state(&self) -> SessionState {
        *self.inner.state_rx.borrow()
    }

    /// Receiver that observes every state transition.
    pub fn state_changes(&self) -> watch::Receiver<SessionState> {
        self.inner.state_tx.subscribe()
    }

    /// Active subscriptions in insertion order.
    pub fn subscriptions(&self) -> Vec<Subscription> {
        self.inner.subscriptions.lock().to_vec()
    }

    /// Called after every accepted CONNACK, including automatic reconnects.
    pub fn on_connect(&self, callback: impl FnMut(&Connected) + Send + 'static) {
        self.inner.callbacks.lock().on_connect = Some(Box::new(callback));
    }

    /// Called once per inbound PUBLISH, in the order the broker sent them.
    pub fn on_message(&self, callback: impl FnMut(InboundMessage) + Send + 'static) {
        self.inner.callbacks.lock().on_message = Some(Box::new(callback));
    }

    /// Called whenever an established connection goes away.
    pub fn on_disconnect(&self, callback: impl FnMut(&DisconnectReason) + Send + 'static) {
        self.inner.callbacks.lock().on_disconnect = Some(Box::new(callback));
    }

    /// Open the connection and complete the CONNECT/CONNACK handshake.
    ///
    /// Only valid from `Disconnected`. A keep-alive of zero disables pings.
    pub async fn connect(
        &self,
        address: &str,
        keep_alive_secs: u16,
    ) -> Result<Connected, ConnectError> {
        self.inner
            .config
            .validate()
            .map_err(|err| ConnectError::InvalidConfig(format!("{err:#}")))?;

        let mut current = SessionState::Disconnected;
        let claimed = self.inner.state_tx.send_if_modified(|state| {
            current = *state;
            if *state == SessionState::Disconnected {
                *state = SessionState::Connecting;
                true
            } else {
                false
            }
        });
        if !claimed {
            return Err(ConnectError::InvalidState(current));
        }

        let target = Target {
            address: address.to_string(),
            keep_alive_secs,
        };
        tracing::debug!(
            client_id = %self.inner.config.client_id,
            address,
            keep_alive_secs,
            "connecting"
        );
        let (link, connected) = match link::establish(
            self.inner.transport.as_ref(),
            &self.inner.config,
            &target,
            false,
        )
        .await
        {
            Ok(established) => established,
            Err(err) => {
                tracing::warn!(address, "connect failed: {err}");
                self.leave_connecting(SessionState::Disconnected);
                return Err(err);
            }
        };

        // disconnect() raises shutdown before taking the task slot, so holding
        // the slot here orders this handoff against it.
        let mut task = self.inner.task.lock();
        let claimed = !*self.inner.shutdown_tx.borrow()
            && self.inner.state_tx.send_if_modified(|state| {
                if *state == SessionState::Connecting {
                    *state = SessionState::Connected;
                    true
                } else {
                    false
                }
            });
        if !claimed {
            drop(task);
            drop(link);
            self.leave_connecting(SessionState::Closed);
            return Err(ConnectError::InvalidState(SessionState::Closed));
        }

        let (command_tx, command_rx) = mpsc::channel(self.inner.config.command_queue);
        *self.inner.commands.lock() = Some(command_tx);
        let event_loop = EventLoop::new(&self.inner, link, target, command_rx);
        *task = Some(tokio::spawn(event_loop.run(connected)));
        Ok(connected)
    }

    fn leave_connecting(&self, next: SessionState) {
        self.inner.state_tx.send_if_modified(|state| {
            if *state == SessionState::Connecting {
                *state = next;
                true
            } else {
                false
            }
        });
    }

    fn command_sender(&self) -> Option<mpsc::Sender<Command>> {
        self.inner.commands.lock().clone()
    }

    /// Subscribe and wait for the SUBACK.
    ///
    /// Subscribing again to a known filter updates its QoS in place.
    pub async fn subscribe(&self, filter: &str, qos: Qos) -> Result<(), SubscribeError> {
        topics::validate_filter(filter)
            .map_err(|err| SubscribeError::InvalidFilter(err.to_string()))?;
        if self.state() != SessionState::Connected {
            return Err(SubscribeError::NotConnected);
        }
        let sender = self.command_sender().ok_or(SubscribeError::NotConnected)?;
        let (reply, rx) = oneshot::channel();
        sender
            .send(Command::Subscribe {
                filter: filter.to_string(),
                qos,
                reply,
            })
            .await
            .map_err(|_| SubscribeError::NotConnected)?;
        rx.await.unwrap_or(Err(SubscribeError::NotConnected))
    }

    pub async fn unsubscribe(&self, filter: &str) -> Result<(), SubscribeError> {
        topics::validate_filter(filter)
            .map_err(|err| SubscribeError::InvalidFilter(err.to_string()))?;
        if self.state() != SessionState::Connected {
            return Err(SubscribeError::NotConnected);
        }
        let sender = self.command_sender().ok_or(SubscribeError::NotConnected)?;
        let (reply, rx) = oneshot::channel();
        sender
            .send(Command::Unsubscribe {
                filter: filter.to_string(),
                reply,
            })
            .await
            .map_err(|_| SubscribeError::NotConnected)?;
        rx.await.unwrap_or(Err(SubscribeError::NotConnected))
    }

    /// Publish a message.
    ///
    /// QoS 0 resolves once written. QoS 1 resolves on PUBACK, retransmitting
    /// with DUP set until `retry.max_retries` is exhausted. The retry clock
    /// stops while reconnecting, and the message goes out again after the
    /// next CONNACK. QoS 2 is sent as QoS 1.
    pub async fn publish(
        &self,
        topic: &str,
        payload: impl Into<Bytes>,
        qos: Qos,
        retain: bool,
    ) -> Result<(), PublishError> {
        topics::validate_topic_name(topic)
            .map_err(|err| PublishError::InvalidTopic(err.to_string()))?;
        match self.state() {
            SessionState::Connected => {}
            SessionState::Reconnecting if qos != Qos::AtMostOnce => {}
            SessionState::Closed => return Err(PublishError::Cancelled),
            _ => return Err(PublishError::NotConnected),
        }
        let sender = self.command_sender().ok_or(PublishError::NotConnected)?;
        let (reply, rx) = oneshot::channel();
        sender
            .send(Command::Publish {
                topic: topic.to_string(),
                payload: payload.into(),
                qos,
                retain,
                reply,
            })
            .await
            .map_err(|_| PublishError::NotConnected)?;
        rx.await.unwrap_or(Err(PublishError::Cancelled))
    }

    /// Send DISCONNECT if connected, fail everything in flight, and move to
    /// `Closed`. Safe to call more than once.
    pub async fn disconnect(&self) {
        self.inner.shutdown_tx.send_replace(true);
        let task = self.inner.task.lock().take();
        if let Some(task) = task {
            let abort = task.abort_handle();
            let grace = self.inner.config.write_timeout() * 2;
            if tokio::time::timeout(grace, task).await.is_err() {
                tracing::warn!("session task did not stop within {grace:?}, aborting");
                abort.abort();
            }
        }
        self.inner.commands.lock().take();
        if self.inner.state_tx.send_replace(SessionState::Closed) != SessionState::Closed {
            tracing::debug!(client_id = %self.inner.config.client_id, "session handle closed");
        }
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("client_id", &self.inner.config.client_id)
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    #[test]
    fn transport_errors_map_to_reasons() {
        assert_eq!(
            DisconnectReason::from(TransportError::Closed),
            DisconnectReason::TransportClosed
        );
        assert!(matches!(
            DisconnectReason::from(TransportError::IoFailure(io::Error::from(
                io::ErrorKind::ConnectionReset
            ))),
            DisconnectReason::Transport(_)
        ));
        assert_eq!(
            DisconnectReason::from(TransportError::malformed("bad header")),
            DisconnectReason::Protocol("bad header".into())
        );
    }

    #[tokio::test]
    async fn operations_before_connect_are_rejected() {
        let session = Session::tcp(SessionConfig::default());
        assert_eq!(session.state(), SessionState::Disconnected);
        assert_eq!(
            session.subscribe("a/b", Qos::AtMostOnce).await,
            Err(SubscribeError::NotConnected)
        );
        assert_eq!(
            session.publish("a/b", "x", Qos::AtLeastOnce, false).await,
            Err(PublishError::NotConnected)
        );
        assert!(matches!(
            session.subscribe("a/#/b", Qos::AtMostOnce).await,
            Err(SubscribeError::InvalidFilter(_))
        ));
        assert!(matches!(
            session.publish("a/+", "x", Qos::AtMostOnce, false).await,
            Err(PublishError::InvalidTopic(_))
        ));
    }

    #[tokio::test]
    async fn disconnect_before_connect_closes() {
        let session = Session::tcp(SessionConfig::default());
        session.disconnect().await;
        session.disconnect().await;
        assert_eq!(session.state(), SessionState::Closed);
        assert_eq!(
            session.connect("127.0.0.1:1", 5).await,
            Err(ConnectError::InvalidState(SessionState::Closed))
        );
        assert_eq!(
            session.publish("a", "x", Qos::AtLeastOnce, false).await,
            Err(PublishError::Cancelled)
        );
    }
}
