//! Message definitions shared by the broker and the client SDK.
//!
//! `Message` is the wire/internal representation of one published message.
//! It is treated as immutable once published; delivery metadata
//! (`redelivered`, `discard_indication`) is set on the copy handed to a
//! receiver, never on the original.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Where a message is sent.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "name", rename_all = "snake_case")]
pub enum Destination {
    Topic(String),
    Queue(String),
}

impl Destination {
    pub fn name(&self) -> &str {
        match self {
            Destination::Topic(name) | Destination::Queue(name) => name,
        }
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Destination::Topic(name) => write!(f, "topic:{name}"),
            Destination::Queue(name) => write!(f, "queue:{name}"),
        }
    }
}

/// `Direct` is best-effort; `Persistent` is spooled and acknowledged.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryMode {
    #[default]
    Direct,
    Persistent,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Opaque unique id, assigned by the publishing client.
    pub message_id: String,
    pub destination: Destination,
    pub payload: Vec<u8>,
    #[serde(default)]
    pub delivery_mode: DeliveryMode,
    #[serde(default)]
    pub properties: BTreeMap<String, String>,
    #[serde(default)]
    pub correlation_id: Option<String>,
    #[serde(default)]
    pub reply_to: Option<String>,
    #[serde(default)]
    pub priority: Option<u8>,
    /// Absolute expiry, milliseconds since the UNIX epoch.
    #[serde(default)]
    pub expiration: Option<i64>,
    /// Sender timestamp, milliseconds since the UNIX epoch.
    pub timestamp: i64,
    #[serde(default)]
    pub redelivered: bool,
    /// Set on the first message delivered after one or more were dropped.
    #[serde(default)]
    pub discard_indication: bool,
}

impl Message {
    pub fn new(destination: Destination, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            message_id: uuid::Uuid::new_v4().to_string(),
            destination,
            payload: payload.into(),
            delivery_mode: DeliveryMode::Direct,
            properties: BTreeMap::new(),
            correlation_id: None,
            reply_to: None,
            priority: None,
            expiration: None,
            timestamp: chrono::Utc::now().timestamp_millis(),
            redelivered: false,
            discard_indication: false,
        }
    }

    pub fn is_expired(&self, now_ms: i64) -> bool {
        self.expiration.is_some_and(|exp| exp <= now_ms)
    }

    /// Topic name when the destination is a topic.
    pub fn topic(&self) -> Option<&str> {
        match &self.destination {
            Destination::Topic(name) => Some(name),
            Destination::Queue(_) => None,
        }
    }

    pub fn payload_as_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.payload).ok()
    }
}
