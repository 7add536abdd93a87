//! Subscribe and Publish command implementations (kcat-style MQTT client).

use crate::cli::args::{BrokerArgs, OutputFormat, PublishArgs, SubscribeArgs};
use crate::core::config::SessionConfig;
use crate::mqtt::Qos;
use crate::session::{DisconnectReason, InboundMessage, Session, SessionState};
use anyhow::{Context, Result};
use base64::Engine;
use chrono::Utc;
use serde::Serialize;
use std::io::Write;
use std::path::Path;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::signal::unix::{signal, Signal, SignalKind};
use tokio::sync::mpsc;

/// Run the subscribe command - connect to broker and stream messages to stdout.
pub async fn run_subscribe(config: Option<&Path>, args: SubscribeArgs) -> Result<()> {
    let session = build_session(config, &args.broker)?;
    let (tx, mut rx) = mpsc::unbounded_channel::<InboundMessage>();
    session.on_message(move |message| {
        let _ = tx.send(message);
    });
    report_connection_events(&session, &args.broker);

    let address = args.broker.address();
    session
        .connect(&address, args.broker.keep_alive)
        .await
        .with_context(|| format!("connect to {address}"))?;
    let qos = Qos::from(args.qos);
    for topic in &args.topic {
        session
            .subscribe(topic, qos)
            .await
            .with_context(|| format!("subscribe to topic '{topic}'"))?;
    }
    eprintln!(
        "subscribed to {} topic(s): {}",
        args.topic.len(),
        args.topic.join(", ")
    );

    let mut shutdown = ShutdownSignal::register()?;
    let mut state = session.state_changes();
    let mut received = 0usize;
    let outcome = loop {
        tokio::select! {
            biased;
            sig = shutdown.recv() => {
                eprintln!("received {sig}, shutting down...");
                break Ok(());
            }
            message = rx.recv() => {
                let Some(message) = message else { break Ok(()) };
                output_message(args.format, &message);
                received += 1;
                if args.count.is_some_and(|limit| received >= limit) {
                    break Ok(());
                }
            }
            changed = state.changed() => {
                if changed.is_err() || *state.borrow() == SessionState::Disconnected {
                    break Err(anyhow::anyhow!("session gave up reconnecting to {address}"));
                }
            }
        }
    };
    session.disconnect().await;
    outcome
}

fn build_session(config: Option<&Path>, broker: &BrokerArgs) -> Result<Session> {
    let mut config = match config {
        Some(path) => SessionConfig::load(path)?,
        None => SessionConfig::load_from_env()?,
    };
    if let Some(client_id) = &broker.client_id {
        config.client_id = client_id.clone();
    }
    Ok(Session::tcp(config))
}

fn report_connection_events(session: &Session, broker: &BrokerArgs) {
    let address = broker.address();
    session.on_connect(move |connected| {
        if connected.reconnected {
            eprintln!("reconnected to {address}");
        } else {
            eprintln!("connected to {address}");
        }
    });
    session.on_disconnect(|reason| {
        if *reason != DisconnectReason::Requested {
            eprintln!("connection lost ({reason:?}); reconnecting...");
        }
    });
}

/// SIGINT/SIGTERM listeners, registered once per command run.
struct ShutdownSignal {
    sigint: Signal,
    sigterm: Signal,
}

impl ShutdownSignal {
    fn register() -> Result<Self> {
        Ok(Self {
            sigint: signal(SignalKind::interrupt()).context("register SIGINT handler")?,
            sigterm: signal(SignalKind::terminate()).context("register SIGTERM handler")?,
        })
    }

    /// Name of the next signal received. Safe to drop and call again.
    async fn recv(&mut self) -> &'static str {
        tokio::select! {
            _ = self.sigint.recv() => "SIGINT",
            _ = self.sigterm.recv() => "SIGTERM",
        }
    }
}

#[derive(Serialize)]
struct MessageOutput<'a> {
    ts: String,
    topic: &'a str,
    qos: u8,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    retained: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    payload: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    payload_b64: Option<String>,
}

fn output_message(format: OutputFormat, message: &InboundMessage) {
    match format {
        OutputFormat::Json => {
            let (payload, payload_b64) = split_payload(&message.payload);
            let line = MessageOutput {
                ts: Utc::now().to_rfc3339(),
                topic: &message.topic,
                qos: message.qos.into(),
                retained: message.retained,
                payload,
                payload_b64,
            };
            if let Ok(json) = serde_json::to_string(&line) {
                println!("{json}");
            }
        }
        OutputFormat::Raw => {
            let mut stdout = std::io::stdout().lock();
            let _ = stdout.write_all(&message.payload);
            let _ = stdout.write_all(b"\n");
        }
    }
}

/// UTF-8 payloads are printed as text, anything else as base64.
fn split_payload(payload: &[u8]) -> (Option<&str>, Option<String>) {
    match std::str::from_utf8(payload) {
        Ok(text) => (Some(text), None),
        Err(_) => (
            None,
            Some(base64::engine::general_purpose::STANDARD.encode(payload)),
        ),
    }
}

// -----------------------------------------------------------------------------
// Publish implementation
// -----------------------------------------------------------------------------

/// Run the publish command - publish messages from stdin or command line.
pub async fn run_publish(config: Option<&Path>, args: PublishArgs) -> Result<()> {
    let session = build_session(config, &args.broker)?;
    report_connection_events(&session, &args.broker);
    let address = args.broker.address();
    session
        .connect(&address, args.broker.keep_alive)
        .await
        .with_context(|| format!("connect to {address}"))?;

    let result = if let Some(topic) = &args.topic {
        publish_single(&session, &args, topic).await
    } else {
        publish_multi_stdin(&session, &args).await
    };
    session.disconnect().await;
    result
}

async fn publish_single(session: &Session, args: &PublishArgs, topic: &str) -> Result<()> {
    let (payload, source) = if let Some(message) = &args.message {
        (message.as_bytes().to_vec(), "argument")
    } else {
        let mut buf = Vec::new();
        tokio::io::stdin()
            .read_to_end(&mut buf)
            .await
            .context("read stdin")?;
        (buf, "stdin")
    };
    eprintln!(
        "publishing {} bytes from {} to '{}' (qos={}, retain={})",
        payload.len(),
        source,
        topic,
        u8::from(Qos::from(args.qos)),
        args.retain
    );
    let result = session
        .publish(topic, payload, args.qos.into(), args.retain)
        .await;
    output_ack(args.format, topic, result.as_ref().err());
    result.with_context(|| format!("publish to '{topic}'"))
}

async fn publish_multi_stdin(session: &Session, args: &PublishArgs) -> Result<()> {
    let delimiter = args.delimiter.as_str();
    eprintln!(
        "reading stdin lines with delimiter '{}' (qos={}, retain={}, binary={})",
        if delimiter == "\t" { "\\t" } else { delimiter },
        u8::from(Qos::from(args.qos)),
        args.retain,
        args.binary
    );

    let mut shutdown = ShutdownSignal::register()?;
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut published = 0usize;
    let mut failed = 0usize;
    loop {
        let line = tokio::select! {
            biased;
            sig = shutdown.recv() => {
                eprintln!("received {sig}, stopping...");
                break;
            }
            line = lines.next_line() => line.context("read stdin")?,
        };
        let Some(line) = line else { break };
        let Some((topic, payload)) = parse_line(&line, delimiter, args.binary) else {
            continue;
        };
        let result = session
            .publish(topic, payload, args.qos.into(), args.retain)
            .await;
        output_ack(args.format, topic, result.as_ref().err());
        if result.is_ok() {
            published += 1;
        } else {
            failed += 1;
        }
    }

    eprintln!("published {published} message(s)");
    if failed > 0 {
        anyhow::bail!("{failed} message(s) were not delivered");
    }
    Ok(())
}

/// Split `topic<delim>payload`; bad lines are reported and skipped.
fn parse_line<'a>(line: &'a str, delimiter: &str, binary: bool) -> Option<(&'a str, Vec<u8>)> {
    let Some((topic, payload)) = line.split_once(delimiter) else {
        eprintln!(
            "skipping malformed line (no delimiter): {}",
            truncate_line(line, 60)
        );
        return None;
    };
    if topic.is_empty() {
        eprintln!("skipping line with empty topic");
        return None;
    }
    if !binary {
        return Some((topic, payload.as_bytes().to_vec()));
    }
    match base64::engine::general_purpose::STANDARD.decode(payload.trim()) {
        Ok(bytes) => Some((topic, bytes)),
        Err(e) => {
            eprintln!("skipping line with invalid base64: {e}");
            None
        }
    }
}

fn truncate_line(s: &str, max_len: usize) -> String {
    match s.char_indices().nth(max_len) {
        Some((idx, _)) => format!("{}...", &s[..idx]),
        None => s.to_string(),
    }
}

#[derive(Serialize)]
struct AckOutput<'a> {
    ts: String,
    topic: &'a str,
    status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

fn output_ack(format: OutputFormat, topic: &str, error: Option<&crate::session::PublishError>) {
    match format {
        OutputFormat::Json => {
            let line = AckOutput {
                ts: Utc::now().to_rfc3339(),
                topic,
                status: if error.is_none() { "ok" } else { "error" },
                error: error.map(ToString::to_string),
            };
            if let Ok(json) = serde_json::to_string(&line) {
                println!("{json}");
            }
        }
        OutputFormat::Raw => {
            if let Some(err) = error {
                eprintln!("{topic}: {err}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_line_splits_on_first_delimiter() {
        let (topic, payload) = parse_line("a/b:c:d", ":", false).unwrap();
        assert_eq!(topic, "a/b");
        assert_eq!(payload, b"c:d");
        assert!(parse_line("no-delimiter", ":", false).is_none());
        assert!(parse_line(":payload", ":", false).is_none());
    }

    #[test]
    fn parse_line_decodes_base64_payloads() {
        let (_, payload) = parse_line("t\tAAEC", "\t", true).unwrap();
        assert_eq!(payload, vec![0, 1, 2]);
        assert!(parse_line("t\t!!!", "\t", true).is_none());
    }

    #[test]
    fn binary_payloads_fall_back_to_base64() {
        assert_eq!(split_payload(b"hello"), (Some("hello"), None));
        assert_eq!(split_payload(&[0xff, 0x00]), (None, Some("/wA=".to_string())));
    }

    #[test]
    fn truncate_respects_char_boundaries() {
        assert_eq!(truncate_line("short", 60), "short");
        assert_eq!(truncate_line("ééééé", 2), "éé...");
    }

    #[tokio::test]
    async fn shutdown_signal_survives_repeated_waits() {
        let mut shutdown = ShutdownSignal::register().unwrap();
        for _ in 0..3 {
            let idle = tokio::time::timeout(std::time::Duration::from_millis(20), shutdown.recv());
            assert!(idle.await.is_err());
        }
        let status = std::process::Command::new("kill")
            .args(["-TERM", &std::process::id().to_string()])
            .status()
            .unwrap();
        assert!(status.success());
        let sig = tokio::time::timeout(std::time::Duration::from_secs(5), shutdown.recv())
            .await
            .unwrap();
        assert_eq!(sig, "SIGTERM");
    }
}
