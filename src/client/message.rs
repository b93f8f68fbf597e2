//! Application-facing message types.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use chrono::Utc;
use opentelemetry::Context;
use tracing_opentelemetry::OpenTelemetrySpanExt;

use crate::broker::message::{DeliveryMode, Destination, Message};
use crate::broker::topic::validate_topic;
use crate::client::trace_context;
use crate::utils::Result;

/// Property carrying the partition key of a message.
pub const PARTITION_KEY_PROPERTY: &str = "JMSXGroupID";
pub const HTTP_CONTENT_TYPE_PROPERTY: &str = "http_content_type";
pub const HTTP_CONTENT_ENCODING_PROPERTY: &str = "http_content_encoding";

/// A topic to publish to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Topic(String);

impl Topic {
    pub fn of(name: impl Into<String>) -> Self {
        Topic(name.into())
    }

    pub fn name(&self) -> &str {
        &self.0
    }

    /// Rejects names the broker would refuse.
    pub fn validate(&self) -> Result<()> {
        validate_topic(&self.0)
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<Topic> for Destination {
    fn from(topic: Topic) -> Self {
        Destination::Topic(topic.0)
    }
}

impl From<&Topic> for Destination {
    fn from(topic: &Topic) -> Self {
        Destination::Topic(topic.0.clone())
    }
}

/// A message ready to publish; turned into a [`Message`] at send time.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct OutboundMessage {
    payload: Vec<u8>,
    properties: BTreeMap<String, String>,
    correlation_id: Option<String>,
    priority: Option<u8>,
    time_to_live: Option<Duration>,
}

impl OutboundMessage {
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn properties(&self) -> &BTreeMap<String, String> {
        &self.properties
    }

    pub fn correlation_id(&self) -> Option<&str> {
        self.correlation_id.as_deref()
    }

    pub(crate) fn set_correlation_id(&mut self, id: impl Into<String>) {
        self.correlation_id = Some(id.into());
    }

    /// Stamps id, timestamp and expiration.
    ///
    /// Unless the application attached a trace context of its own, the
    /// context of a `relaymq.publish` span is propagated with the message.
    pub(crate) fn into_message(self, destination: Destination, mode: DeliveryMode) -> Message {
        let mut message = Message::new(destination, self.payload);
        message.delivery_mode = mode;
        message.properties = self.properties;
        message.correlation_id = self.correlation_id;
        message.priority = self.priority;
        message.expiration = self.time_to_live.map(|ttl| {
            let ttl_ms = i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX);
            message.timestamp.saturating_add(ttl_ms)
        });

        let span = tracing::info_span!(
            "relaymq.publish",
            destination = %message.destination.name(),
            message_id = %message.message_id,
        );
        if !trace_context::carries_trace(&message.properties) {
            trace_context::inject(&span.context(), &mut message.properties);
        }
        message
    }
}

#[derive(Debug, Clone, Default)]
pub struct OutboundMessageBuilder {
    properties: BTreeMap<String, String>,
    correlation_id: Option<String>,
    priority: Option<u8>,
    time_to_live: Option<Duration>,
}

impl OutboundMessageBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    /// Messages older than `ttl` are discarded by the broker.
    pub fn with_time_to_live(mut self, ttl: Duration) -> Self {
        self.time_to_live = Some(ttl);
        self
    }

    pub fn with_correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }

    pub fn with_partition_key(self, key: impl Into<String>) -> Self {
        self.with_property(PARTITION_KEY_PROPERTY, key)
    }

    pub fn with_http_content_header(
        self,
        content_type: impl Into<String>,
        content_encoding: impl Into<String>,
    ) -> Self {
        self.with_property(HTTP_CONTENT_TYPE_PROPERTY, content_type)
            .with_property(HTTP_CONTENT_ENCODING_PROPERTY, content_encoding)
    }

    /// Propagates `cx` (span and baggage) with the message.
    pub fn with_trace_context(mut self, cx: &Context) -> Self {
        trace_context::inject(cx, &mut self.properties);
        self
    }

    /// Propagates the context of the current `tracing` span.
    pub fn with_current_trace_context(self) -> Self {
        let cx = tracing::Span::current().context();
        self.with_trace_context(&cx)
    }

    /// Wraps `payload` with the properties set so far.
    /// The builder can be reused for further messages.
    pub fn build(&self, payload: impl Into<Vec<u8>>) -> OutboundMessage {
        OutboundMessage {
            payload: payload.into(),
            properties: self.properties.clone(),
            correlation_id: self.correlation_id.clone(),
            priority: self.priority,
            time_to_live: self.time_to_live,
        }
    }
}

/// Identifies one persistent delivery for acknowledgment.
///
/// Delivery ids are only unique within one connection: a rebound queue may
/// hand out the same ids again, so the tag also carries the connection
/// generation the message arrived on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeliveryTag {
    pub flow: u64,
    pub delivery: u64,
    pub generation: u64,
}

/// A received message.
#[derive(Debug, Clone, PartialEq)]
pub struct InboundMessage {
    message: Message,
    tag: Option<DeliveryTag>,
}

impl InboundMessage {
    pub(crate) fn direct(message: Message) -> Self {
        Self { message, tag: None }
    }

    pub(crate) fn guaranteed(message: Message, tag: DeliveryTag) -> Self {
        Self {
            message,
            tag: Some(tag),
        }
    }

    pub(crate) fn mark_discard(&mut self) {
        self.message.discard_indication = true;
    }

    pub fn delivery_tag(&self) -> Option<DeliveryTag> {
        self.tag
    }

    pub fn message_id(&self) -> &str {
        &self.message.message_id
    }

    pub fn destination(&self) -> &Destination {
        &self.message.destination
    }

    pub fn destination_name(&self) -> &str {
        self.message.destination.name()
    }

    pub fn payload_as_bytes(&self) -> &[u8] {
        &self.message.payload
    }

    pub fn payload_as_string(&self) -> Option<String> {
        self.message.payload_as_str().map(str::to_string)
    }

    pub fn properties(&self) -> &BTreeMap<String, String> {
        &self.message.properties
    }

    pub fn property(&self, key: &str) -> Option<&str> {
        self.message.properties.get(key).map(String::as_str)
    }

    pub fn correlation_id(&self) -> Option<&str> {
        self.message.correlation_id.as_deref()
    }

    pub fn reply_to(&self) -> Option<&str> {
        self.message.reply_to.as_deref()
    }

    pub fn priority(&self) -> Option<u8> {
        self.message.priority
    }

    pub fn expiration(&self) -> Option<i64> {
        self.message.expiration
    }

    pub fn sender_timestamp(&self) -> i64 {
        self.message.timestamp
    }

    pub fn delivery_mode(&self) -> DeliveryMode {
        self.message.delivery_mode
    }

    pub fn is_redelivered(&self) -> bool {
        self.message.redelivered
    }

    /// Whether messages were lost before this one.
    pub fn discard_indication(&self) -> bool {
        self.message.discard_indication
    }

    pub fn partition_key(&self) -> Option<&str> {
        self.property(PARTITION_KEY_PROPERTY)
    }

    pub fn http_content_type(&self) -> Option<&str> {
        self.property(HTTP_CONTENT_TYPE_PROPERTY)
    }

    pub fn http_content_encoding(&self) -> Option<&str> {
        self.property(HTTP_CONTENT_ENCODING_PROPERTY)
    }

    pub fn is_expired(&self) -> bool {
        self.message.is_expired(Utc::now().timestamp_millis())
    }

    /// The trace context the publisher propagated, if any.
    pub fn trace_context(&self) -> Context {
        trace_context::extract(&self.message.properties)
    }

    pub fn into_message(self) -> Message {
        self.message
    }
}
