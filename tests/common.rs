//! Common test harness utilities for integration tests.
//!
//! This module provides helpers for:
//! - An in-memory transport backed by `tokio::io::duplex`
//! - A scripted broker that drives the other end of each stream
//! - Building test configurations
//!
//! Tests run with paused time, so every wait below is virtual.

// Not all test files use all helpers; silence dead_code warnings for unused exports.
#![allow(dead_code)]

use futures::future::BoxFuture;
use quantum_session::config::SessionConfig;
use quantum_session::mqtt::{
    read_packet, write_packet, ConnAckPacket, ConnectPacket, ConnectReturnCode, Packet,
    SubAckPacket, SubAckReturn, SubscribePacket,
};
use quantum_session::net::{BoxedStream, Transport, TransportError};
use quantum_session::{Session, SessionState};
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::DuplexStream;
use tokio::sync::mpsc;
use tokio::time::timeout;

pub const BROKER: &str = "broker.test:1883";
const LONG_WAIT: Duration = Duration::from_secs(600);

/// Client side of the in-memory network. Every `connect` opens a fresh duplex
/// pipe and hands the far end to the paired [`Broker`].
pub struct DuplexTransport {
    incoming: mpsc::UnboundedSender<DuplexStream>,
    refuse: Arc<AtomicUsize>,
    attempts: Arc<AtomicUsize>,
}

impl Transport for DuplexTransport {
    fn connect<'a>(&'a self, _address: &'a str) -> BoxFuture<'a, io::Result<BoxedStream>> {
        Box::pin(async move {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            let refused = self
                .refuse
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if refused {
                return Err(io::Error::new(io::ErrorKind::ConnectionRefused, "refused"));
            }
            let (client, server) = tokio::io::duplex(64 * 1024);
            self.incoming
                .send(server)
                .map_err(|_| io::Error::new(io::ErrorKind::ConnectionRefused, "broker gone"))?;
            Ok(Box::new(client) as BoxedStream)
        })
    }
}

pub struct Broker {
    incoming: mpsc::UnboundedReceiver<DuplexStream>,
    refuse: Arc<AtomicUsize>,
    attempts: Arc<AtomicUsize>,
}

pub fn pair() -> (DuplexTransport, Broker) {
    let (tx, rx) = mpsc::unbounded_channel();
    let refuse = Arc::new(AtomicUsize::new(0));
    let attempts = Arc::new(AtomicUsize::new(0));
    (
        DuplexTransport {
            incoming: tx,
            refuse: refuse.clone(),
            attempts: attempts.clone(),
        },
        Broker {
            incoming: rx,
            refuse,
            attempts,
        },
    )
}

impl Broker {
    /// Next raw connection, before any MQTT traffic.
    pub async fn accept(&mut self) -> BrokerConn {
        let stream = timeout(LONG_WAIT, self.incoming.recv())
            .await
            .expect("no connection attempt")
            .expect("transport dropped");
        BrokerConn { stream }
    }

    pub async fn try_accept_within(&mut self, wait: Duration) -> Option<BrokerConn> {
        match timeout(wait, self.incoming.recv()).await {
            Ok(Some(stream)) => Some(BrokerConn { stream }),
            _ => None,
        }
    }

    /// Accept, read CONNECT and answer with the given return code.
    pub async fn accept_with(&mut self, code: ConnectReturnCode) -> (BrokerConn, ConnectPacket) {
        let mut conn = self.accept().await;
        let connect = match conn.recv().await {
            Packet::Connect(connect) => connect,
            other => panic!("expected CONNECT, got {other:?}"),
        };
        conn.send(Packet::ConnAck(ConnAckPacket {
            session_present: false,
            code,
        }))
        .await;
        (conn, connect)
    }

    pub async fn accept_session(&mut self) -> BrokerConn {
        self.accept_with(ConnectReturnCode::Accepted).await.0
    }

    /// Fail the next `n` transport-level connection attempts.
    pub fn refuse_next(&self, n: usize) {
        self.refuse.store(n, Ordering::SeqCst);
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

pub struct BrokerConn {
    stream: DuplexStream,
}

impl BrokerConn {
    pub async fn recv(&mut self) -> Packet {
        timeout(LONG_WAIT, read_packet(&mut self.stream, 1 << 20))
            .await
            .expect("timed out waiting for a packet")
            .expect("read packet")
    }

    /// `None` if nothing arrives within `wait`.
    pub async fn recv_within(&mut self, wait: Duration) -> Option<Packet> {
        match timeout(wait, read_packet(&mut self.stream, 1 << 20)).await {
            Ok(Ok(packet)) => Some(packet),
            Ok(Err(err)) => panic!("connection failed while waiting: {err}"),
            Err(_) => None,
        }
    }

    pub async fn send(&mut self, packet: Packet) {
        write_packet(&mut self.stream, &packet)
            .await
            .expect("write packet");
    }

    /// The client closed its end without sending anything else.
    pub async fn expect_closed(&mut self) {
        match timeout(LONG_WAIT, read_packet(&mut self.stream, 1 << 20)).await {
            Ok(Err(TransportError::Closed)) => {}
            Ok(Ok(packet)) => panic!("expected close, got {packet:?}"),
            Ok(Err(err)) => panic!("expected clean close, got {err}"),
            Err(_) => panic!("connection was not closed"),
        }
    }

    /// Read a SUBSCRIBE and grant every filter at the requested QoS.
    pub async fn grant_subscribe(&mut self) -> SubscribePacket {
        let subscribe = match self.recv().await {
            Packet::Subscribe(subscribe) => subscribe,
            other => panic!("expected SUBSCRIBE, got {other:?}"),
        };
        self.send(Packet::SubAck(SubAckPacket {
            packet_id: subscribe.packet_id,
            returns: subscribe
                .filters
                .iter()
                .map(|(_, qos)| SubAckReturn::Granted(*qos))
                .collect(),
        }))
        .await;
        subscribe
    }
}

/// Defaults with deterministic backoff.
pub fn test_config() -> SessionConfig {
    let mut config = SessionConfig::default();
    config.client_id = "test-client".to_string();
    config.reconnect.jitter = false;
    config
}

/// Connected session plus the broker end of its first connection.
pub async fn connected(config: SessionConfig, keep_alive: u16) -> (Session, Broker, BrokerConn) {
    let (transport, mut broker) = pair();
    let session = Session::new(config, transport);
    let (result, conn) = tokio::join!(session.connect(BROKER, keep_alive), broker.accept_session());
    result.expect("connect");
    (session, broker, conn)
}

pub async fn wait_for_state(session: &Session, state: SessionState) {
    let mut changes = session.state_changes();
    timeout(LONG_WAIT, changes.wait_for(|current| *current == state))
        .await
        .unwrap_or_else(|_| panic!("session never reached {state:?}"))
        .expect("state channel closed");
}
