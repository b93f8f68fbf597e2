//! Queues for guaranteed messaging.
//!
//! A queue spools persistent messages until a bound consumer (a *flow*)
//! acknowledges them. Exclusive queues have a single active flow; every other
//! flow waits passively and takes over, in bind order, when the active one
//! goes away. Non-exclusive queues hand messages out round-robin.
//!
//! Delivered but unacknowledged messages are kept in flight. Losing the flow
//! or missing the acknowledgment timeout puts them back at the head of the
//! spool, flagged as redelivered.

use std::collections::{HashMap, VecDeque};
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::broker::message::Message;
use crate::broker::selector::Selector;
use crate::broker::topic::TopicSubscription;
use crate::utils::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccessType {
    Exclusive,
    NonExclusive,
}

/// How a receiver refers to a queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueSpec {
    pub name: String,
    pub durable: bool,
    pub access: AccessType,
}

impl QueueSpec {
    pub fn durable_exclusive(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            durable: true,
            access: AccessType::Exclusive,
        }
    }

    pub fn durable_non_exclusive(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            durable: true,
            access: AccessType::NonExclusive,
        }
    }

    /// A temporary queue that lives as long as the session that created it.
    /// Without a name, a unique one is generated.
    pub fn non_durable_exclusive(name: Option<&str>) -> Self {
        let name = match name {
            Some(name) => name.to_string(),
            None => format!("#anon/{}", uuid::Uuid::new_v4()),
        };
        Self {
            name,
            durable: false,
            access: AccessType::Exclusive,
        }
    }

    pub fn is_exclusive(&self) -> bool {
        self.access == AccessType::Exclusive
    }
}

/// A bound consumer, identified by its session and the flow id that session chose.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FlowKey {
    pub session: String,
    pub flow: u64,
}

impl FlowKey {
    pub fn new(session: impl Into<String>, flow: u64) -> Self {
        Self {
            session: session.into(),
            flow,
        }
    }
}

impl fmt::Display for FlowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/flow-{}", self.session, self.flow)
    }
}

#[derive(Debug)]
pub struct Consumer {
    pub key: FlowKey,
    pub selector: Option<Selector>,
    pub window: usize,
    pub paused: bool,
    unacked: usize,
}

impl Consumer {
    pub fn new(key: FlowKey, selector: Option<Selector>, window: usize) -> Self {
        Self {
            key,
            selector,
            window: window.max(1),
            paused: false,
            unacked: 0,
        }
    }

    fn has_capacity(&self) -> bool {
        !self.paused && self.unacked < self.window
    }

    fn accepts(&self, message: &Message) -> bool {
        self.selector
            .as_ref()
            .is_none_or(|s| s.matches(&message.properties))
    }
}

#[derive(Debug)]
struct Spooled {
    message: Message,
    deliveries: u32,
}

#[derive(Debug)]
struct InFlight {
    message: Message,
    flow: FlowKey,
    sent_at: i64,
    deliveries: u32,
}

/// One message handed to one flow.
#[derive(Debug, Clone, PartialEq)]
pub struct Dispatch {
    pub flow: FlowKey,
    pub delivery: u64,
    pub message: Message,
}

#[derive(Debug)]
pub struct MessageQueue {
    pub spec: QueueSpec,
    /// Session that created a non-durable queue.
    pub owner: Option<String>,
    subscriptions: Vec<TopicSubscription>,
    spool: VecDeque<Spooled>,
    in_flight: HashMap<u64, InFlight>,
    consumers: Vec<Consumer>,
    cursor: usize,
    next_delivery: u64,
    max_messages: usize,
}

impl MessageQueue {
    pub fn new(spec: QueueSpec, owner: Option<String>, max_messages: usize) -> Self {
        Self {
            spec,
            owner,
            subscriptions: Vec::new(),
            spool: VecDeque::new(),
            in_flight: HashMap::new(),
            consumers: Vec::new(),
            cursor: 0,
            next_delivery: 1,
            max_messages,
        }
    }

    pub fn name(&self) -> &str {
        &self.spec.name
    }

    /// Returns `false` when the expression was already present.
    pub fn add_subscription(&mut self, subscription: TopicSubscription) -> bool {
        if self
            .subscriptions
            .iter()
            .any(|s| s.expression() == subscription.expression())
        {
            return false;
        }
        self.subscriptions.push(subscription);
        true
    }

    pub fn remove_subscription(&mut self, expression: &str) -> bool {
        let before = self.subscriptions.len();
        self.subscriptions.retain(|s| s.expression() != expression);
        before != self.subscriptions.len()
    }

    pub fn subscriptions(&self) -> impl Iterator<Item = &str> {
        self.subscriptions.iter().map(|s| s.expression())
    }

    pub fn matches_topic(&self, topic: &str) -> bool {
        self.subscriptions.iter().any(|s| s.matches(topic))
    }

    /// Messages spooled or in flight.
    pub fn depth(&self) -> usize {
        self.spool.len() + self.in_flight.len()
    }

    pub fn in_flight_count(&self) -> usize {
        self.in_flight.len()
    }

    pub fn has_room(&self) -> bool {
        self.depth() < self.max_messages
    }

    pub fn enqueue(&mut self, message: Message) -> Result<()> {
        if !self.has_room() {
            return Err(Error::QueueFull(self.spec.name.clone()));
        }
        self.spool.push_back(Spooled {
            message,
            deliveries: 0,
        });
        Ok(())
    }

    /// Adds a consumer and reports whether it is active.
    ///
    /// Binding an already bound flow replaces its settings but keeps its in-flight messages.
    pub fn add_consumer(&mut self, consumer: Consumer) -> bool {
        let key = consumer.key.clone();
        if let Some(existing) = self.consumers.iter_mut().find(|c| c.key == key) {
            existing.selector = consumer.selector;
            existing.window = consumer.window;
        } else {
            self.consumers.push(consumer);
        }
        self.is_active(&key)
    }

    pub fn is_active(&self, key: &FlowKey) -> bool {
        if self.spec.is_exclusive() {
            self.consumers.first().is_some_and(|c| &c.key == key)
        } else {
            self.consumers.iter().any(|c| &c.key == key)
        }
    }

    /// The single active flow of an exclusive queue.
    pub fn active_flow(&self) -> Option<&FlowKey> {
        if self.spec.is_exclusive() {
            self.consumers.first().map(|c| &c.key)
        } else {
            None
        }
    }

    pub fn consumer_count(&self) -> usize {
        self.consumers.len()
    }

    pub fn flows_of(&self, session: &str) -> Vec<FlowKey> {
        self.consumers
            .iter()
            .filter(|c| c.key.session == session)
            .map(|c| c.key.clone())
            .collect()
    }

    /// Removes a consumer and puts its unacknowledged messages back.
    ///
    /// Returns the flow that became active on an exclusive queue, if any.
    pub fn remove_consumer(&mut self, key: &FlowKey) -> Option<FlowKey> {
        let was_active = self.active_flow() == Some(key);
        let before = self.consumers.len();
        self.consumers.retain(|c| &c.key != key);
        if before == self.consumers.len() {
            return None;
        }

        let mut orphaned: Vec<u64> = self
            .in_flight
            .iter()
            .filter(|(_, f)| &f.flow == key)
            .map(|(id, _)| *id)
            .collect();
        // oldest delivery ends up at the head
        orphaned.sort_unstable_by(|a, b| b.cmp(a));
        for delivery in orphaned {
            if let Some(entry) = self.in_flight.remove(&delivery) {
                self.requeue(entry);
            }
        }

        if was_active {
            self.active_flow().cloned()
        } else {
            None
        }
    }

    pub fn set_paused(&mut self, key: &FlowKey, paused: bool) -> bool {
        match self.consumers.iter_mut().find(|c| &c.key == key) {
            Some(consumer) => {
                consumer.paused = paused;
                true
            }
            None => false,
        }
    }

    /// Settles a delivery. A second ack for the same delivery returns `None`.
    pub fn ack(&mut self, key: &FlowKey, delivery: u64) -> Option<Message> {
        if self.in_flight.get(&delivery).is_none_or(|f| &f.flow != key) {
            return None;
        }
        let entry = self.in_flight.remove(&delivery)?;
        if let Some(consumer) = self.consumers.iter_mut().find(|c| &c.key == key) {
            consumer.unacked = consumer.unacked.saturating_sub(1);
        }
        Some(entry.message)
    }

    /// Drops spooled messages whose expiration has passed.
    pub fn purge_expired(&mut self, now_ms: i64) -> Vec<Message> {
        let mut expired = Vec::new();
        self.spool.retain(|s| {
            if s.message.is_expired(now_ms) {
                expired.push(s.message.clone());
                false
            } else {
                true
            }
        });
        expired
    }

    /// Hands spooled messages to flows with free window space.
    ///
    /// A message no consumer selects stays spooled; later messages may pass it.
    pub fn dispatch(&mut self, now_ms: i64) -> Vec<Dispatch> {
        let mut out = Vec::new();
        let mut index = 0;

        while index < self.spool.len() {
            if !self.consumers.iter().any(Consumer::has_capacity) {
                break;
            }
            let picked = pick_consumer(
                &self.consumers,
                &mut self.cursor,
                self.spec.is_exclusive(),
                &self.spool[index].message,
            );
            let Some(slot) = picked else {
                index += 1;
                continue;
            };
            let Some(spooled) = self.spool.remove(index) else {
                break;
            };

            let delivery = self.next_delivery;
            self.next_delivery += 1;
            let consumer = &mut self.consumers[slot];
            consumer.unacked += 1;
            let flow = consumer.key.clone();

            self.in_flight.insert(
                delivery,
                InFlight {
                    message: spooled.message.clone(),
                    flow: flow.clone(),
                    sent_at: now_ms,
                    deliveries: spooled.deliveries + 1,
                },
            );
            out.push(Dispatch {
                flow,
                delivery,
                message: spooled.message,
            });
        }

        out
    }

    /// Puts back deliveries not acknowledged within `timeout_ms`.
    ///
    /// Messages already delivered `max_redeliveries + 1` times are dropped and returned.
    pub fn redeliver_expired(
        &mut self,
        now_ms: i64,
        timeout_ms: i64,
        max_redeliveries: u32,
    ) -> (usize, Vec<Message>) {
        let mut timed_out: Vec<u64> = self
            .in_flight
            .iter()
            .filter(|(_, f)| now_ms - f.sent_at >= timeout_ms)
            .map(|(id, _)| *id)
            .collect();
        timed_out.sort_unstable_by(|a, b| b.cmp(a));

        let mut requeued = 0;
        let mut dropped = Vec::new();
        for delivery in timed_out {
            let Some(entry) = self.in_flight.remove(&delivery) else {
                continue;
            };
            if let Some(consumer) = self.consumers.iter_mut().find(|c| c.key == entry.flow) {
                consumer.unacked = consumer.unacked.saturating_sub(1);
            }
            if entry.deliveries > max_redeliveries {
                dropped.push(entry.message);
            } else {
                self.requeue(entry);
                requeued += 1;
            }
        }
        (requeued, dropped)
    }

    fn requeue(&mut self, entry: InFlight) {
        let mut message = entry.message;
        message.redelivered = true;
        self.spool.push_front(Spooled {
            message,
            deliveries: entry.deliveries,
        });
    }

    /// Queue contents in delivery order, without consuming them.
    pub fn browse(&self, selector: Option<&Selector>) -> Vec<Message> {
        let mut in_flight: Vec<(&u64, &InFlight)> = self.in_flight.iter().collect();
        in_flight.sort_unstable_by_key(|(id, _)| **id);

        in_flight
            .into_iter()
            .map(|(_, f)| &f.message)
            .chain(self.spool.iter().map(|s| &s.message))
            .filter(|m| selector.is_none_or(|s| s.matches(&m.properties)))
            .cloned()
            .collect()
    }

    /// Deletes a message wherever it is. In-flight copies are settled.
    pub fn remove_message(&mut self, message_id: &str) -> Option<Message> {
        if let Some(pos) = self
            .spool
            .iter()
            .position(|s| s.message.message_id == message_id)
        {
            return self.spool.remove(pos).map(|s| s.message);
        }

        let delivery = self
            .in_flight
            .iter()
            .find(|(_, f)| f.message.message_id == message_id)
            .map(|(id, _)| *id)?;
        let entry = self.in_flight.remove(&delivery)?;
        if let Some(consumer) = self.consumers.iter_mut().find(|c| c.key == entry.flow) {
            consumer.unacked = consumer.unacked.saturating_sub(1);
        }
        Some(entry.message)
    }
}

fn pick_consumer(
    consumers: &[Consumer],
    cursor: &mut usize,
    exclusive: bool,
    message: &Message,
) -> Option<usize> {
    if exclusive {
        let active = consumers.first()?;
        return (active.has_capacity() && active.accepts(message)).then_some(0);
    }

    let count = consumers.len();
    for offset in 0..count {
        let slot = (*cursor + offset) % count;
        let consumer = &consumers[slot];
        if consumer.has_capacity() && consumer.accepts(message) {
            *cursor = slot + 1;
            return Some(slot);
        }
    }
    None
}
