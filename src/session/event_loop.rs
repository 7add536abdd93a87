//! The per-session task. It owns the link, the pending-ack table and every
//! timer, so all state transitions after the first CONNACK happen here.

use super::backoff::Backoff;
use super::link::{self, Inbound, Link, Target};
use super::pending::{PendingAck, PendingAcks, PublishReply, SubscribeReply, Waiter};
use super::subscriptions::SubscriptionSet;
use super::{
    Callbacks, Command, Connected, DisconnectReason, InboundMessage, Inner, PublishError,
    SessionState, SubscribeError,
};
use crate::core::config::SessionConfig;
use crate::mqtt::{
    Packet, PublishPacket, Qos, SubAckPacket, SubAckReturn, SubscribePacket, UnsubscribePacket,
};
use crate::net::Transport;
use bytes::Bytes;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::{self, Instant};

enum Event {
    Shutdown,
    Control(Packet),
    Command(Option<Command>),
    Tick,
    Message(PublishPacket),
    Lost(DisconnectReason),
}

pub(crate) struct EventLoop {
    config: SessionConfig,
    target: Target,
    transport: Arc<dyn Transport>,
    link: Option<Link>,
    commands: mpsc::Receiver<Command>,
    shutdown: watch::Receiver<bool>,
    state: Arc<watch::Sender<SessionState>>,
    subscriptions: Arc<Mutex<SubscriptionSet>>,
    callbacks: Arc<Mutex<Callbacks>>,
    pending: PendingAcks,
    keep_alive: Option<Duration>,
    last_sent: Instant,
    ping_deadline: Option<Instant>,
    backoff: Backoff,
    reconnect_at: Option<Instant>,
    reconnect_attempt: u32,
    exit: Option<SessionState>,
}

impl EventLoop {
    pub(crate) fn new(
        inner: &Inner,
        link: Link,
        target: Target,
        commands: mpsc::Receiver<Command>,
    ) -> Self {
        Self {
            config: inner.config.clone(),
            keep_alive: target.keep_alive(),
            target,
            transport: Arc::clone(&inner.transport),
            link: Some(link),
            commands,
            shutdown: inner.shutdown_tx.subscribe(),
            state: Arc::clone(&inner.state_tx),
            subscriptions: Arc::clone(&inner.subscriptions),
            callbacks: Arc::clone(&inner.callbacks),
            pending: PendingAcks::new(),
            last_sent: Instant::now(),
            ping_deadline: None,
            backoff: Backoff::from_config(&inner.config.reconnect),
            reconnect_at: None,
            reconnect_attempt: 0,
            exit: None,
        }
    }

    pub(crate) async fn run(mut self, connected: Connected) {
        tracing::info!(
            client_id = %self.config.client_id,
            address = %self.target.address,
            "session connected"
        );
        self.link_up(connected).await;

        loop {
            if self.exit.is_none() && *self.shutdown.borrow() {
                self.close().await;
                return;
            }
            if let Some(state) = self.exit.take() {
                self.finish(state);
                return;
            }
            match self.next_event().await {
                Event::Shutdown | Event::Command(None) => {
                    self.close().await;
                    return;
                }
                Event::Control(packet) => self.handle_control(packet).await,
                Event::Command(Some(command)) => self.handle_command(command).await,
                Event::Tick => self.on_tick().await,
                Event::Message(publish) => self.dispatch(publish).await,
                Event::Lost(reason) => self.connection_lost(reason),
            }
        }
    }

    async fn next_event(&mut self) -> Event {
        let wake = self.next_wakeup();
        let (control, data) = match self.link.as_mut() {
            Some(link) => (Some(&mut link.control), Some(&mut link.data)),
            None => (None, None),
        };
        tokio::select! {
            biased;
            changed = self.shutdown.changed() => match changed {
                Ok(()) if !*self.shutdown.borrow() => Event::Tick,
                _ => Event::Shutdown,
            },
            Some(packet) = recv_some(control) => Event::Control(packet),
            command = self.commands.recv() => Event::Command(command),
            _ = sleep_until(wake) => Event::Tick,
            inbound = recv_some(data) => match inbound {
                Some(Inbound::Message(publish)) => Event::Message(publish),
                Some(Inbound::Lost(err)) => Event::Lost(err.into()),
                None => Event::Lost(DisconnectReason::TransportClosed),
            },
        }
    }

    fn next_wakeup(&self) -> Option<Instant> {
        let ping_due = match (&self.link, self.ping_deadline, self.keep_alive) {
            (Some(_), None, Some(keep_alive)) => Some(self.last_sent + keep_alive),
            _ => None,
        };
        [
            self.pending.earliest_deadline(self.clock_running()),
            ping_due,
            self.ping_deadline,
            self.reconnect_at,
        ]
        .into_iter()
        .flatten()
        .min()
    }

    async fn on_tick(&mut self) {
        let now = Instant::now();
        if self.reconnect_at.is_some_and(|at| at <= now) {
            self.reconnect().await;
            return;
        }
        if self.link.is_some() {
            if self.ping_deadline.is_some_and(|deadline| deadline <= now) {
                tracing::warn!(
                    "no PINGRESP within {:?}, dropping connection",
                    self.config.ping_timeout()
                );
                self.connection_lost(DisconnectReason::KeepAliveTimeout);
                return;
            }
            let ping_due = self.ping_deadline.is_none()
                && self
                    .keep_alive
                    .is_some_and(|keep_alive| self.last_sent + keep_alive <= now);
            if ping_due && self.send(&Packet::PingReq).await {
                self.ping_deadline = Some(Instant::now() + self.config.ping_timeout());
            }
        }
        self.expire_pending(now).await;
    }

    /// Publish and subscribe acks can only arrive on a live link, so their
    /// clocks stop while reconnecting and `link_up` re-arms them.
    fn clock_running(&self) -> impl Fn(&Waiter) -> bool {
        let linked = self.link.is_some();
        move |waiter| {
            linked || matches!(waiter, Waiter::Unsubscribe { .. } | Waiter::Resubscribe { .. })
        }
    }

    async fn expire_pending(&mut self, now: Instant) {
        let max_sends = self.config.retry.max_retries + 1;
        let max_interval = self.config.retry.max_interval();
        for packet_id in self.pending.expired(now, self.clock_running()) {
            let linked = self.link.is_some();
            let resend = match self.pending.get_mut(packet_id) {
                Some(PendingAck {
                    waiter: Waiter::Publish { .. } | Waiter::Subscribe { .. },
                    ..
                }) if !linked => continue,
                Some(PendingAck {
                    waiter: Waiter::Publish { .. },
                    sends,
                    interval,
                    deadline,
                    ..
                }) if *sends < max_sends => {
                    *interval = interval.saturating_mul(2).min(max_interval);
                    *deadline = now + *interval;
                    Some(*sends)
                }
                Some(_) => None,
                None => continue,
            };
            if let Some(sent) = resend {
                tracing::debug!(packet_id, sent, "no PUBACK, retransmitting");
                self.transmit_publish(packet_id).await;
                continue;
            }

            let Some(ack) = self.pending.remove(packet_id) else {
                continue;
            };
            match ack.waiter {
                Waiter::Publish { packet, reply } => {
                    let attempts = ack.sends;
                    tracing::warn!(
                        packet_id,
                        topic = %packet.topic,
                        attempts,
                        "publish undelivered"
                    );
                    let _ = reply.send(Err(PublishError::Undelivered { attempts }));
                }
                Waiter::Subscribe { filter, reply } => {
                    tracing::warn!(packet_id, %filter, "SUBACK timed out");
                    let _ = reply.send(Err(SubscribeError::Timeout));
                }
                Waiter::Unsubscribe { reply } => {
                    tracing::warn!(packet_id, "UNSUBACK timed out");
                    let _ = reply.send(Err(SubscribeError::Timeout));
                }
                Waiter::Resubscribe { filter } => {
                    tracing::warn!(
                        packet_id,
                        %filter,
                        "SUBACK for replayed subscription timed out"
                    );
                }
            }
        }
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Subscribe { filter, qos, reply } => self.subscribe(filter, qos, reply).await,
            Command::Unsubscribe { filter, reply } => self.unsubscribe(filter, reply).await,
            Command::Publish {
                topic,
                payload,
                qos,
                retain,
                reply,
            } => self.publish(topic, payload, qos, retain, reply).await,
        }
    }

    fn reserve_id(&mut self) -> Option<u16> {
        if self.pending.len() >= self.config.max_inflight {
            return None;
        }
        self.pending.allocate_id()
    }

    async fn subscribe(&mut self, filter: String, qos: Qos, reply: SubscribeReply) {
        if self.link.is_none() {
            let _ = reply.send(Err(SubscribeError::NotConnected));
            return;
        }
        let Some(packet_id) = self.reserve_id() else {
            let _ = reply.send(Err(SubscribeError::Backpressure));
            return;
        };
        if let Some(previous) = self.subscriptions.lock().upsert(&filter, qos) {
            tracing::debug!(%filter, ?previous, ?qos, "updating subscription");
        }
        self.pending.insert(
            packet_id,
            Waiter::Subscribe {
                filter: filter.clone(),
                reply,
            },
            self.config.subscribe_timeout(),
            Instant::now(),
        );
        self.send(&Packet::Subscribe(SubscribePacket {
            packet_id,
            filters: vec![(filter, qos)],
        }))
        .await;
    }

    async fn unsubscribe(&mut self, filter: String, reply: SubscribeReply) {
        if self.link.is_none() {
            let _ = reply.send(Err(SubscribeError::NotConnected));
            return;
        }
        let Some(packet_id) = self.reserve_id() else {
            let _ = reply.send(Err(SubscribeError::Backpressure));
            return;
        };
        self.subscriptions.lock().remove(&filter);
        self.pending.insert(
            packet_id,
            Waiter::Unsubscribe { reply },
            self.config.subscribe_timeout(),
            Instant::now(),
        );
        self.send(&Packet::Unsubscribe(UnsubscribePacket {
            packet_id,
            filters: vec![filter],
        }))
        .await;
    }

    async fn publish(
        &mut self,
        topic: String,
        payload: Bytes,
        qos: Qos,
        retain: bool,
        reply: PublishReply,
    ) {
        let qos = match qos {
            Qos::ExactlyOnce => {
                tracing::debug!(%topic, "QoS 2 publish sent as QoS 1");
                Qos::AtLeastOnce
            }
            other => other,
        };

        if qos == Qos::AtMostOnce {
            let packet = Packet::Publish(PublishPacket {
                topic,
                packet_id: None,
                payload,
                qos,
                retain,
                dup: false,
            });
            let result = if self.link.is_none() {
                Err(PublishError::NotConnected)
            } else if self.send(&packet).await {
                Ok(())
            } else {
                Err(PublishError::Undelivered { attempts: 1 })
            };
            let _ = reply.send(result);
            return;
        }

        let Some(packet_id) = self.reserve_id() else {
            let _ = reply.send(Err(PublishError::Backpressure));
            return;
        };
        let packet = PublishPacket {
            topic,
            packet_id: Some(packet_id),
            payload,
            qos,
            retain,
            dup: false,
        };
        self.pending.insert(
            packet_id,
            Waiter::Publish { packet, reply },
            self.config.retry.ack_timeout(),
            Instant::now(),
        );
        if self.link.is_some() {
            self.transmit_publish(packet_id).await;
        } else {
            tracing::debug!(packet_id, "queued publish until reconnected");
        }
    }

    /// Send the stored publish; every copy after the first that went out
    /// carries DUP.
    async fn transmit_publish(&mut self, packet_id: u16) {
        let packet = match self.pending.get_mut(packet_id) {
            Some(PendingAck {
                waiter: Waiter::Publish { packet, .. },
                ..
            }) => packet.clone(),
            _ => return,
        };
        if !self.send(&Packet::Publish(packet)).await {
            return;
        }
        if let Some(PendingAck {
            waiter: Waiter::Publish { packet, .. },
            sends,
            ..
        }) = self.pending.get_mut(packet_id)
        {
            packet.dup = true;
            *sends += 1;
        }
    }

    async fn handle_control(&mut self, packet: Packet) {
        match packet {
            Packet::PubAck(packet_id) => {
                match self
                    .pending
                    .take_matching(packet_id, |w| matches!(w, Waiter::Publish { .. }))
                {
                    Some(PendingAck {
                        waiter: Waiter::Publish { reply, .. },
                        sends,
                        ..
                    }) => {
                        tracing::trace!(packet_id, sends, "PUBACK");
                        let _ = reply.send(Ok(()));
                    }
                    _ => tracing::debug!(packet_id, "PUBACK for unknown packet id"),
                }
            }
            Packet::SubAck(ack) => self.handle_suback(ack),
            Packet::UnsubAck(packet_id) => {
                match self
                    .pending
                    .take_matching(packet_id, |w| matches!(w, Waiter::Unsubscribe { .. }))
                {
                    Some(PendingAck {
                        waiter: Waiter::Unsubscribe { reply },
                        ..
                    }) => {
                        let _ = reply.send(Ok(()));
                    }
                    _ => tracing::debug!(packet_id, "UNSUBACK for unknown packet id"),
                }
            }
            Packet::PingResp => {
                tracing::trace!("PINGRESP");
                self.ping_deadline = None;
            }
            Packet::PubRel(packet_id) => {
                self.send(&Packet::PubComp(packet_id)).await;
            }
            Packet::PubRec(packet_id) | Packet::PubComp(packet_id) => {
                tracing::debug!(packet_id, "ignoring QoS 2 ack for a publish never sent at QoS 2");
            }
            other => {
                let reason = format!("unexpected {} from broker", other.name());
                tracing::warn!("{reason}");
                self.connection_lost(DisconnectReason::Protocol(reason));
            }
        }
    }

    fn handle_suback(&mut self, ack: SubAckPacket) {
        let packet_id = ack.packet_id;
        let Some(entry) = self.pending.take_matching(packet_id, |w| {
            matches!(w, Waiter::Subscribe { .. } | Waiter::Resubscribe { .. })
        }) else {
            tracing::debug!(packet_id, "SUBACK for unknown packet id");
            return;
        };
        let granted = match ack.returns.first() {
            Some(SubAckReturn::Granted(qos)) => Some(*qos),
            _ => None,
        };
        match (entry.waiter, granted) {
            (Waiter::Subscribe { filter, reply }, Some(qos)) => {
                tracing::debug!(%filter, ?qos, "subscription granted");
                let _ = reply.send(Ok(()));
            }
            (Waiter::Subscribe { filter, reply }, None) => {
                tracing::warn!(%filter, "subscription rejected");
                self.subscriptions.lock().remove(&filter);
                let _ = reply.send(Err(SubscribeError::Rejected(filter)));
            }
            (Waiter::Resubscribe { filter }, Some(_)) => {
                tracing::debug!(%filter, "subscription restored");
            }
            (Waiter::Resubscribe { filter }, None) => {
                tracing::warn!(%filter, "replayed subscription rejected, dropping it");
                self.subscriptions.lock().remove(&filter);
            }
            _ => {}
        }
    }

    async fn dispatch(&mut self, publish: PublishPacket) {
        if !self.subscriptions.lock().matches(&publish.topic) {
            tracing::debug!(topic = %publish.topic, "message matches no active subscription");
        }
        let ack = match (publish.qos, publish.packet_id) {
            (Qos::AtLeastOnce, Some(id)) => Some(Packet::PubAck(id)),
            (Qos::ExactlyOnce, Some(id)) => Some(Packet::PubRec(id)),
            _ => None,
        };
        self.notify_message(InboundMessage {
            topic: publish.topic,
            payload: publish.payload,
            qos: publish.qos,
            retained: publish.retain,
            duplicate: publish.dup,
        });
        if let Some(ack) = ack {
            self.send(&ack).await;
        }
    }

    /// Write one packet. A failed write drops the link; returns whether it went out.
    async fn send(&mut self, packet: &Packet) -> bool {
        let Some(link) = self.link.as_mut() else {
            return false;
        };
        match link.send(packet, self.config.write_timeout()).await {
            Ok(()) => {
                tracing::trace!(packet = packet.name(), "sent");
                self.last_sent = Instant::now();
                true
            }
            Err(err) => {
                tracing::warn!("failed to send {}: {err}", packet.name());
                self.connection_lost(err.into());
                false
            }
        }
    }

    fn connection_lost(&mut self, reason: DisconnectReason) {
        if self.link.take().is_none() {
            return;
        }
        self.ping_deadline = None;
        // replays are reissued by the next link_up
        self.pending.discard(|w| matches!(w, Waiter::Resubscribe { .. }));
        tracing::warn!(address = %self.target.address, ?reason, "connection lost");
        self.notify_disconnect(&reason);
        if !self.config.reconnect.enabled {
            self.exit = Some(SessionState::Disconnected);
            return;
        }
        self.state.send_replace(SessionState::Reconnecting);
        self.reconnect_attempt = 0;
        self.reconnect_at = Some(Instant::now() + self.backoff.delay(0));
    }

    async fn reconnect(&mut self) {
        self.reconnect_at = None;
        self.reconnect_attempt += 1;
        let attempt = self.reconnect_attempt;
        tracing::info!(attempt, address = %self.target.address, "reconnecting");

        let result = tokio::select! {
            biased;
            _ = self.shutdown.changed() => return,
            result = link::establish(
                self.transport.as_ref(),
                &self.config,
                &self.target,
                true,
            ) => result,
        };
        match result {
            Ok((link, connected)) => {
                self.link = Some(link);
                self.link_up(connected).await;
            }
            Err(err) if err.is_fatal() => {
                tracing::error!(attempt, "broker refused reconnect: {err}");
                self.exit = Some(SessionState::Disconnected);
            }
            Err(err) => {
                if self
                    .config
                    .reconnect
                    .max_attempts
                    .is_some_and(|max| attempt >= max)
                {
                    tracing::error!(attempt, "giving up on reconnect: {err}");
                    self.exit = Some(SessionState::Disconnected);
                    return;
                }
                let delay = self.backoff.delay(attempt);
                tracing::debug!(attempt, ?delay, "reconnect failed: {err}");
                self.reconnect_at = Some(Instant::now() + delay);
            }
        }
    }

    /// Runs after every accepted CONNACK.
    async fn link_up(&mut self, connected: Connected) {
        self.last_sent = Instant::now();
        self.ping_deadline = None;
        self.reconnect_attempt = 0;
        self.state.send_replace(SessionState::Connected);
        if connected.reconnected {
            tracing::info!(address = %self.target.address, "session reconnected");
        }

        let subscriptions = self.subscriptions.lock().to_vec();
        for subscription in subscriptions {
            if self.link.is_none() {
                return;
            }
            let Some(packet_id) = self.pending.allocate_id() else {
                tracing::warn!("no packet id free to replay {}", subscription.filter);
                break;
            };
            // A caller still waiting on the lost link's SUBACK waits on the replay.
            let waiter = self
                .pending
                .take_first(|w| {
                    matches!(w, Waiter::Subscribe { filter, .. } if *filter == subscription.filter)
                })
                .map(|ack| ack.waiter)
                .unwrap_or_else(|| Waiter::Resubscribe {
                    filter: subscription.filter.clone(),
                });
            self.pending.insert(
                packet_id,
                waiter,
                self.config.subscribe_timeout(),
                Instant::now(),
            );
            self.send(&Packet::Subscribe(SubscribePacket {
                packet_id,
                filters: vec![(subscription.filter, subscription.qos)],
            }))
            .await;
        }

        let max_sends = self.config.retry.max_retries + 1;
        for packet_id in self.pending.publish_ids() {
            if self.link.is_none() {
                return;
            }
            let now = Instant::now();
            let Some(entry) = self.pending.get_mut(packet_id) else {
                continue;
            };
            entry.deadline = now + entry.interval;
            // out of sends: the final window runs out and reports Undelivered
            if entry.sends < max_sends {
                self.transmit_publish(packet_id).await;
            }
        }

        if self.link.is_some() {
            self.notify_connect(&connected);
        }
    }

    /// Orderly shutdown requested through the handle.
    async fn close(&mut self) {
        self.reconnect_at = None;
        if let Some(mut link) = self.link.take() {
            if let Err(err) = link.send(&Packet::Disconnect, self.config.write_timeout()).await {
                tracing::debug!("DISCONNECT not delivered: {err}");
            }
            drop(link);
            self.notify_disconnect(&DisconnectReason::Requested);
        }
        self.fail_pending(true);
        self.reject_queued(true);
        self.state.send_replace(SessionState::Closed);
        tracing::info!(client_id = %self.config.client_id, "session closed");
    }

    /// The session gave up; the handle may connect again.
    fn finish(&mut self, state: SessionState) {
        self.link = None;
        self.reconnect_at = None;
        self.fail_pending(false);
        self.reject_queued(false);
        self.state.send_replace(state);
    }

    fn fail_pending(&mut self, cancelled: bool) {
        for ack in self.pending.drain() {
            match ack.waiter {
                Waiter::Publish { reply, .. } => {
                    let err = if cancelled {
                        PublishError::Cancelled
                    } else {
                        PublishError::Undelivered {
                            attempts: ack.sends,
                        }
                    };
                    let _ = reply.send(Err(err));
                }
                Waiter::Subscribe { reply, .. } | Waiter::Unsubscribe { reply } => {
                    let _ = reply.send(Err(SubscribeError::NotConnected));
                }
                Waiter::Resubscribe { .. } => {}
            }
        }
    }

    fn reject_queued(&mut self, cancelled: bool) {
        self.commands.close();
        while let Ok(command) = self.commands.try_recv() {
            match command {
                Command::Publish { reply, .. } => {
                    let err = if cancelled {
                        PublishError::Cancelled
                    } else {
                        PublishError::NotConnected
                    };
                    let _ = reply.send(Err(err));
                }
                Command::Subscribe { reply, .. } | Command::Unsubscribe { reply, .. } => {
                    let _ = reply.send(Err(SubscribeError::NotConnected));
                }
            }
        }
    }

    // Callbacks are taken out of their slot while they run so a callback may
    // call back into the session handle without deadlocking.

    fn notify_connect(&self, connected: &Connected) {
        let taken = self.callbacks.lock().on_connect.take();
        if let Some(mut callback) = taken {
            callback(connected);
            let mut slots = self.callbacks.lock();
            if slots.on_connect.is_none() {
                slots.on_connect = Some(callback);
            }
        }
    }

    fn notify_message(&self, message: InboundMessage) {
        let taken = self.callbacks.lock().on_message.take();
        if let Some(mut callback) = taken {
            callback(message);
            let mut slots = self.callbacks.lock();
            if slots.on_message.is_none() {
                slots.on_message = Some(callback);
            }
        }
    }

    fn notify_disconnect(&self, reason: &DisconnectReason) {
        let taken = self.callbacks.lock().on_disconnect.take();
        if let Some(mut callback) = taken {
            callback(reason);
            let mut slots = self.callbacks.lock();
            if slots.on_disconnect.is_none() {
                slots.on_disconnect = Some(callback);
            }
        }
    }
}

async fn recv_some<T>(rx: Option<&mut mpsc::Receiver<T>>) -> Option<T> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
