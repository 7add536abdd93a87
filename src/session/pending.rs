use super::error::{PublishError, SubscribeError};
use crate::mqtt::PublishPacket;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::Instant;

pub(crate) type PublishReply = oneshot::Sender<Result<(), PublishError>>;
pub(crate) type SubscribeReply = oneshot::Sender<Result<(), SubscribeError>>;

/// What an in-flight packet id is waiting for.
#[derive(Debug)]
pub(crate) enum Waiter {
    Publish {
        packet: PublishPacket,
        reply: PublishReply,
    },
    Subscribe {
        filter: String,
        reply: SubscribeReply,
    },
    Unsubscribe {
        reply: SubscribeReply,
    },
    /// Replayed after a reconnect; nobody awaits the SUBACK.
    Resubscribe {
        filter: String,
    },
}

#[derive(Debug)]
pub(crate) struct PendingAck {
    pub packet_id: u16,
    pub waiter: Waiter,
    /// Transmissions so far; only publishes are ever resent.
    pub sends: u32,
    pub interval: Duration,
    pub deadline: Instant,
    seq: u64,
}

/// In-flight operations keyed by packet id. Ids are unique while in flight.
#[derive(Debug)]
pub(crate) struct PendingAcks {
    entries: HashMap<u16, PendingAck>,
    next_id: u16,
    next_seq: u64,
}

impl PendingAcks {
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
            next_id: 1,
            next_seq: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Next free packet id in 1..=65535, wrapping and skipping ids in flight.
    pub fn allocate_id(&mut self) -> Option<u16> {
        if self.entries.len() >= usize::from(u16::MAX) {
            return None;
        }
        loop {
            let id = self.next_id;
            self.next_id = if id == u16::MAX { 1 } else { id + 1 };
            if !self.entries.contains_key(&id) {
                return Some(id);
            }
        }
    }

    pub fn insert(&mut self, packet_id: u16, waiter: Waiter, interval: Duration, now: Instant) {
        let seq = self.next_seq;
        self.next_seq += 1;
        let previous = self.entries.insert(
            packet_id,
            PendingAck {
                packet_id,
                waiter,
                sends: 0,
                interval,
                deadline: now + interval,
                seq,
            },
        );
        debug_assert!(previous.is_none(), "packet id {packet_id} reused while in flight");
    }

    pub fn remove(&mut self, packet_id: u16) -> Option<PendingAck> {
        self.entries.remove(&packet_id)
    }

    pub fn get_mut(&mut self, packet_id: u16) -> Option<&mut PendingAck> {
        self.entries.get_mut(&packet_id)
    }

    /// Remove the entry only if its waiter is of the expected kind, so a stray
    /// ack cannot complete an unrelated operation.
    pub fn take_matching(
        &mut self,
        packet_id: u16,
        expected: impl FnOnce(&Waiter) -> bool,
    ) -> Option<PendingAck> {
        if self.entries.get(&packet_id).is_some_and(|p| expected(&p.waiter)) {
            self.entries.remove(&packet_id)
        } else {
            None
        }
    }

    /// Oldest entry whose waiter satisfies `matches`, by issue order.
    pub fn take_first(&mut self, matches: impl Fn(&Waiter) -> bool) -> Option<PendingAck> {
        let packet_id = self
            .entries
            .values()
            .filter(|p| matches(&p.waiter))
            .min_by_key(|p| p.seq)?
            .packet_id;
        self.entries.remove(&packet_id)
    }

    pub fn discard(&mut self, matches: impl Fn(&Waiter) -> bool) {
        self.entries.retain(|_, p| !matches(&p.waiter));
    }

    /// Earliest deadline among the entries whose clock is running.
    pub fn earliest_deadline(&self, running: impl Fn(&Waiter) -> bool) -> Option<Instant> {
        self.entries
            .values()
            .filter(|p| running(&p.waiter))
            .map(|p| p.deadline)
            .min()
    }

    /// Ids whose deadline has passed, oldest deadline first.
    pub fn expired(&self, now: Instant, running: impl Fn(&Waiter) -> bool) -> Vec<u16> {
        let mut due: Vec<&PendingAck> = self
            .entries
            .values()
            .filter(|p| p.deadline <= now && running(&p.waiter))
            .collect();
        due.sort_by_key(|p| (p.deadline, p.seq));
        due.into_iter().map(|p| p.packet_id).collect()
    }

    /// Ids of unacknowledged publishes in the order they were first issued.
    pub fn publish_ids(&self) -> Vec<u16> {
        let mut publishes: Vec<&PendingAck> = self
            .entries
            .values()
            .filter(|p| matches!(p.waiter, Waiter::Publish { .. }))
            .collect();
        publishes.sort_by_key(|p| p.seq);
        publishes.into_iter().map(|p| p.packet_id).collect()
    }

    pub fn drain(&mut self) -> impl Iterator<Item = PendingAck> + '_ {
        self.entries.drain().map(|(_, ack)| ack)
    }
}
