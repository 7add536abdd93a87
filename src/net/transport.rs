//! Byte-stream transport used by a session.
//!
//! A session only needs an ordered, reliable, bidirectional stream. TCP is
//! provided; tests and TLS setups plug in their own [`Transport`].

use futures::future::BoxFuture;
use std::io;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;

/// Any stream a session can run MQTT over.
pub trait AsyncStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T> AsyncStream for T where T: AsyncRead + AsyncWrite + Unpin + Send {}

pub type BoxedStream = Box<dyn AsyncStream>;

/// Opens streams to a broker address. Called once per (re)connection attempt.
pub trait Transport: Send + Sync {
    fn connect<'a>(&'a self, address: &'a str) -> BoxFuture<'a, io::Result<BoxedStream>>;
}

/// Plain TCP transport.
#[derive(Debug, Clone)]
pub struct TcpTransport {
    nodelay: bool,
}

impl TcpTransport {
    pub fn new() -> Self {
        Self { nodelay: true }
    }

    pub fn with_nodelay(mut self, nodelay: bool) -> Self {
        self.nodelay = nodelay;
        self
    }
}

impl Default for TcpTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl Transport for TcpTransport {
    fn connect<'a>(&'a self, address: &'a str) -> BoxFuture<'a, io::Result<BoxedStream>> {
        Box::pin(async move {
            let stream = TcpStream::connect(address).await?;
            stream.set_nodelay(self.nodelay)?;
            tracing::debug!(address, "tcp transport connected");
            Ok(Box::new(stream) as BoxedStream)
        })
    }
}

/// Failures reading or writing MQTT frames on a stream.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("connection closed by peer")]
    Closed,
    #[error("transport i/o failure: {0}")]
    IoFailure(#[from] io::Error),
    #[error("malformed packet: {0}")]
    Malformed(String),
}

impl TransportError {
    pub fn malformed(err: impl std::fmt::Display) -> Self {
        TransportError::Malformed(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn tcp_transport_connects_to_listener() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 2];
            socket.read_exact(&mut buf).await.unwrap();
            buf
        });

        let transport = TcpTransport::new();
        let mut stream = transport.connect(&addr).await.unwrap();
        stream.write_all(&[0xC0, 0x00]).await.unwrap();
        assert_eq!(server.await.unwrap(), [0xC0, 0x00]);
    }

    #[tokio::test]
    async fn tcp_transport_reports_refused_connection() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);
        let err = TcpTransport::new().connect(&addr).await.err().unwrap();
        assert_eq!(err.kind(), io::ErrorKind::ConnectionRefused);
    }
}
