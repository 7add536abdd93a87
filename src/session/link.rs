//! One live broker connection: handshake, write half, and the reader task.

use super::{ConnectError, Connected};
use crate::core::config::SessionConfig;
use crate::mqtt::protocol::{self, ConnectPacket, ConnectReturnCode, Packet, PublishPacket, Will};
use crate::net::{BoxedStream, Transport, TransportError};
use bytes::Bytes;
use std::io;
use std::time::Duration;
use tokio::io::{ReadHalf, WriteHalf};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time;

const CONTROL_CHANNEL: usize = 64;
const DATA_CHANNEL: usize = 256;

/// Where and how to (re)connect.
#[derive(Debug, Clone)]
pub(crate) struct Target {
    pub address: String,
    pub keep_alive_secs: u16,
}

impl Target {
    pub fn keep_alive(&self) -> Option<Duration> {
        (self.keep_alive_secs > 0).then(|| Duration::from_secs(u64::from(self.keep_alive_secs)))
    }
}

/// Items on the data channel, in stream order.
#[derive(Debug)]
pub(crate) enum Inbound {
    Message(PublishPacket),
    Lost(TransportError),
}

pub(crate) struct Link {
    writer: WriteHalf<BoxedStream>,
    /// Acks and PINGRESP, polled ahead of `data`.
    pub control: mpsc::Receiver<Packet>,
    pub data: mpsc::Receiver<Inbound>,
    reader: JoinHandle<()>,
}

impl Link {
    pub async fn send(&mut self, packet: &Packet, timeout: Duration) -> Result<(), TransportError> {
        match time::timeout(timeout, protocol::write_packet(&mut self.writer, packet)).await {
            Ok(result) => result,
            Err(_) => Err(TransportError::IoFailure(io::Error::new(
                io::ErrorKind::TimedOut,
                format!("write of {} timed out", packet.name()),
            ))),
        }
    }
}

impl Drop for Link {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

/// Open a stream, run CONNECT/CONNACK, and start the reader task.
pub(crate) async fn establish(
    transport: &dyn Transport,
    config: &SessionConfig,
    target: &Target,
    reconnected: bool,
) -> Result<(Link, Connected), ConnectError> {
    let timeout = config.connect_timeout();
    let mut stream = time::timeout(timeout, transport.connect(&target.address))
        .await
        .map_err(|_| ConnectError::Network(format!("connect to {} timed out", target.address)))?
        .map_err(|err| ConnectError::Network(format!("connect to {}: {err}", target.address)))?;

    let connect = Packet::Connect(connect_packet(config, target));
    let reply = time::timeout(timeout, async {
        protocol::write_packet(&mut stream, &connect).await?;
        protocol::read_packet(&mut stream, config.max_packet_size).await
    })
    .await
    .map_err(|_| ConnectError::Network("handshake timed out".into()))?
    .map_err(|err| ConnectError::Network(format!("handshake: {err}")))?;

    let ack = match reply {
        Packet::ConnAck(ack) => ack,
        other => {
            return Err(ConnectError::Network(format!(
                "expected CONNACK, got {}",
                other.name()
            )))
        }
    };
    match ack.code {
        ConnectReturnCode::Accepted => {}
        ConnectReturnCode::UnacceptableProtocolVersion => {
            return Err(ConnectError::ProtocolMismatch)
        }
        code => return Err(ConnectError::Rejected(code)),
    }

    let (reader, writer) = tokio::io::split(stream);
    let (control_tx, control) = mpsc::channel(CONTROL_CHANNEL);
    let (data_tx, data) = mpsc::channel(DATA_CHANNEL);
    let reader = tokio::spawn(read_loop(reader, config.max_packet_size, control_tx, data_tx));
    tracing::debug!(
        address = %target.address,
        session_present = ack.session_present,
        "CONNACK accepted"
    );
    Ok((
        Link {
            writer,
            control,
            data,
            reader,
        },
        Connected {
            session_present: ack.session_present,
            reconnected,
        },
    ))
}

fn connect_packet(config: &SessionConfig, target: &Target) -> ConnectPacket {
    ConnectPacket {
        client_id: config.client_id.clone(),
        keep_alive: target.keep_alive_secs,
        clean_session: config.clean_session,
        will: config.will.as_ref().map(|will| Will {
            topic: will.topic.clone(),
            payload: Bytes::from(will.payload.clone()),
            qos: will.qos,
            retain: will.retain,
        }),
        username: None,
        password: None,
    }
}

async fn read_loop(
    mut reader: ReadHalf<BoxedStream>,
    max_packet_size: usize,
    control: mpsc::Sender<Packet>,
    data: mpsc::Sender<Inbound>,
) {
    loop {
        match protocol::read_packet(&mut reader, max_packet_size).await {
            Ok(Packet::Publish(publish)) => {
                if data.send(Inbound::Message(publish)).await.is_err() {
                    break;
                }
            }
            Ok(packet) => {
                tracing::trace!(packet = packet.name(), "received");
                if control.send(packet).await.is_err() {
                    break;
                }
            }
            Err(err) => {
                // behind every message already read, so nothing is dropped
                let _ = data.send(Inbound::Lost(err)).await;
                break;
            }
        }
    }
}
