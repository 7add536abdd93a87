use crate::mqtt::topics;
use crate::mqtt::Qos;
use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Subscription {
    pub filter: String,
    pub qos: Qos,
}

/// Active subscriptions in insertion order.
///
/// Re-subscribing to a filter replaces its QoS in place, so the order used to
/// replay subscriptions after a reconnect stays stable.
#[derive(Debug, Default, Clone)]
pub struct SubscriptionSet {
    entries: Vec<Subscription>,
}

impl SubscriptionSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or update a filter; returns the previous QoS if it was present.
    pub fn upsert(&mut self, filter: &str, qos: Qos) -> Option<Qos> {
        if let Some(existing) = self.entries.iter_mut().find(|s| s.filter == filter) {
            return Some(std::mem::replace(&mut existing.qos, qos));
        }
        self.entries.push(Subscription {
            filter: filter.to_string(),
            qos,
        });
        None
    }

    pub fn remove(&mut self, filter: &str) -> Option<Subscription> {
        let idx = self.entries.iter().position(|s| s.filter == filter)?;
        Some(self.entries.remove(idx))
    }

    pub fn get(&self, filter: &str) -> Option<&Subscription> {
        self.entries.iter().find(|s| s.filter == filter)
    }

    /// True if any active filter matches the topic.
    pub fn matches(&self, topic: &str) -> bool {
        self.entries
            .iter()
            .any(|s| topics::matches(&s.filter, topic))
    }

    pub fn iter(&self) -> impl Iterator<Item = &Subscription> {
        self.entries.iter()
    }

    pub fn to_vec(&self) -> Vec<Subscription> {
        self.entries.clone()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upsert_replaces_qos_without_duplicating() {
        let mut set = SubscriptionSet::new();
        assert_eq!(set.upsert("a/b", Qos::AtMostOnce), None);
        assert_eq!(set.upsert("a/b", Qos::AtLeastOnce), Some(Qos::AtMostOnce));
        assert_eq!(set.upsert("a/b", Qos::ExactlyOnce), Some(Qos::AtLeastOnce));
        assert_eq!(set.len(), 1);
        assert_eq!(set.get("a/b").unwrap().qos, Qos::ExactlyOnce);
    }

    #[test]
    fn upsert_keeps_original_position() {
        let mut set = SubscriptionSet::new();
        set.upsert("first", Qos::AtMostOnce);
        set.upsert("second", Qos::AtMostOnce);
        set.upsert("third", Qos::AtMostOnce);
        set.upsert("first", Qos::AtLeastOnce);
        let order: Vec<_> = set.iter().map(|s| s.filter.as_str()).collect();
        assert_eq!(order, ["first", "second", "third"]);
    }

    #[test]
    fn remove_and_match() {
        let mut set = SubscriptionSet::new();
        set.upsert("sensors/+/temp", Qos::AtMostOnce);
        set.upsert("$SYS/#", Qos::AtMostOnce);
        assert!(set.matches("sensors/7/temp"));
        assert!(set.matches("$SYS/broker/load"));
        assert!(!set.matches("sensors/7/humidity"));

        assert!(set.remove("sensors/+/temp").is_some());
        assert!(set.remove("sensors/+/temp").is_none());
        assert!(!set.matches("sensors/7/temp"));
        assert_eq!(set.len(), 1);
    }
}
