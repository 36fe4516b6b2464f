// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Held-mail outboxes.
//!
//! Each client has one FIFO of pending messages, created on first use and
//! removed on disconnect. Outboxes are bounded; on overflow the oldest
//! message is dropped.

use crate::message::Message;
use std::collections::{HashMap, VecDeque};
use tracing::warn;

/// Pending mail for one client.
#[derive(Debug, Default)]
pub struct HeldMail {
    queue: VecDeque<Message>,
    dropped: u64,
}

impl HeldMail {
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Messages discarded because the outbox was full.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    /// Append, dropping the oldest message if `capacity` is reached.
    /// Returns true if a message was dropped.
    fn push(&mut self, msg: Message, capacity: usize) -> bool {
        let mut overflowed = false;
        while self.queue.len() >= capacity.max(1) {
            self.queue.pop_front();
            self.dropped += 1;
            overflowed = true;
        }
        self.queue.push_back(msg);
        overflowed
    }

    fn drain(&mut self) -> Vec<Message> {
        self.queue.drain(..).collect()
    }
}

/// All outboxes, keyed by client name.
#[derive(Debug)]
pub struct Outboxes {
    boxes: HashMap<String, HeldMail>,
    capacity: usize,
}

impl Outboxes {
    /// Create with a per-client capacity.
    pub fn new(capacity: usize) -> Self {
        Self {
            boxes: HashMap::new(),
            capacity,
        }
    }

    /// Queue a message for `client`, creating its outbox if needed.
    pub fn push(&mut self, client: &str, msg: Message) {
        let capacity = self.capacity;
        let mail = self.boxes.entry(client.to_string()).or_default();
        if mail.push(msg, capacity) && mail.dropped() % 1000 == 1 {
            warn!(
                "Held mail for '{}' full ({} messages), dropped {} so far",
                client,
                capacity,
                mail.dropped()
            );
        }
    }

    /// Take every pending message for `client` in arrival order.
    pub fn take(&mut self, client: &str) -> Vec<Message> {
        self.boxes
            .get_mut(client)
            .map(HeldMail::drain)
            .unwrap_or_default()
    }

    /// Number of pending messages for `client`.
    pub fn pending(&self, client: &str) -> usize {
        self.boxes.get(client).map_or(0, HeldMail::len)
    }

    /// Whether `client` has any pending mail.
    pub fn has_mail(&self, client: &str) -> bool {
        self.pending(client) > 0
    }

    /// Whether an outbox exists for `client`.
    pub fn contains(&self, client: &str) -> bool {
        self.boxes.contains_key(client)
    }

    /// Ensure an outbox exists for `client`.
    pub fn open(&mut self, client: &str) {
        self.boxes.entry(client.to_string()).or_default();
    }

    /// Delete `client`'s outbox and its contents.
    pub fn remove(&mut self, client: &str) -> Option<HeldMail> {
        self.boxes.remove(client)
    }

    /// Discard every pending message, keeping the outboxes.
    pub fn clear_all(&mut self) {
        for mail in self.boxes.values_mut() {
            mail.queue.clear();
        }
    }

    /// Dropped-message count for `client`.
    pub fn dropped(&self, client: &str) -> u64 {
        self.boxes.get(client).map_or(0, HeldMail::dropped)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Notification;

    fn notify(key: &str, v: f64) -> Message {
        Message::Notify(Notification::new(key, v, 0.0))
    }

    #[test]
    fn test_fifo_order() {
        let mut boxes = Outboxes::new(16);
        boxes.push("A", notify("X", 1.0));
        boxes.push("A", notify("X", 2.0));
        boxes.push("A", notify("Y", 3.0));

        let mail = boxes.take("A");
        let values: Vec<f64> = mail
            .iter()
            .filter_map(|m| m.as_notification())
            .filter_map(|n| n.value.as_double())
            .collect();
        assert_eq!(values, vec![1.0, 2.0, 3.0]);
        assert!(boxes.take("A").is_empty());
        assert!(boxes.contains("A"));
    }

    #[test]
    fn test_drop_oldest() {
        let mut boxes = Outboxes::new(2);
        boxes.push("A", notify("X", 1.0));
        boxes.push("A", notify("X", 2.0));
        boxes.push("A", notify("X", 3.0));
        assert_eq!(boxes.pending("A"), 2);
        assert_eq!(boxes.dropped("A"), 1);

        let first = boxes.take("A").remove(0);
        assert_eq!(first.as_notification().and_then(|n| n.value.as_double()), Some(2.0));
    }

    #[test]
    fn test_remove_and_clear() {
        let mut boxes = Outboxes::new(16);
        boxes.push("A", notify("X", 1.0));
        boxes.push("B", notify("X", 1.0));

        boxes.clear_all();
        assert!(!boxes.has_mail("A"));
        assert!(boxes.contains("B"));

        assert!(boxes.remove("A").is_some());
        assert!(!boxes.contains("A"));
        assert!(boxes.take("A").is_empty());
    }
}
