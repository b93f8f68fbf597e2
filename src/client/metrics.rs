//! Per-service counters.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Metric {
    DirectMessagesSent,
    DirectMessagesReceived,
    PersistentMessagesSent,
    PersistentMessagesReceived,
    PublishReceiptsOk,
    PublishReceiptsFailed,
    PublisherOverflows,
    ReceivedMessagesDropped,
    MessagesAcknowledged,
    ConnectionAttempts,
    ReconnectionAttempts,
    Reconnections,
    RequestsSent,
    RepliesReceived,
    RequestTimeouts,
}

const METRIC_COUNT: usize = 15;

impl Metric {
    pub const ALL: [Metric; METRIC_COUNT] = [
        Metric::DirectMessagesSent,
        Metric::DirectMessagesReceived,
        Metric::PersistentMessagesSent,
        Metric::PersistentMessagesReceived,
        Metric::PublishReceiptsOk,
        Metric::PublishReceiptsFailed,
        Metric::PublisherOverflows,
        Metric::ReceivedMessagesDropped,
        Metric::MessagesAcknowledged,
        Metric::ConnectionAttempts,
        Metric::ReconnectionAttempts,
        Metric::Reconnections,
        Metric::RequestsSent,
        Metric::RepliesReceived,
        Metric::RequestTimeouts,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Metric::DirectMessagesSent => "direct_messages_sent",
            Metric::DirectMessagesReceived => "direct_messages_received",
            Metric::PersistentMessagesSent => "persistent_messages_sent",
            Metric::PersistentMessagesReceived => "persistent_messages_received",
            Metric::PublishReceiptsOk => "publish_receipts_ok",
            Metric::PublishReceiptsFailed => "publish_receipts_failed",
            Metric::PublisherOverflows => "publisher_overflows",
            Metric::ReceivedMessagesDropped => "received_messages_dropped",
            Metric::MessagesAcknowledged => "messages_acknowledged",
            Metric::ConnectionAttempts => "connection_attempts",
            Metric::ReconnectionAttempts => "reconnection_attempts",
            Metric::Reconnections => "reconnections",
            Metric::RequestsSent => "requests_sent",
            Metric::RepliesReceived => "replies_received",
            Metric::RequestTimeouts => "request_timeouts",
        }
    }
}

#[derive(Debug)]
pub struct ApiMetrics {
    counters: [AtomicU64; METRIC_COUNT],
}

impl Default for ApiMetrics {
    fn default() -> Self {
        Self {
            counters: std::array::from_fn(|_| AtomicU64::new(0)),
        }
    }
}

impl ApiMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_value(&self, metric: Metric) -> u64 {
        self.counters[metric as usize].load(Ordering::Relaxed)
    }

    pub fn increment(&self, metric: Metric) {
        self.add(metric, 1);
    }

    pub fn add(&self, metric: Metric, n: u64) {
        self.counters[metric as usize].fetch_add(n, Ordering::Relaxed);
    }

    pub fn reset(&self) {
        for counter in &self.counters {
            counter.store(0, Ordering::Relaxed);
        }
    }
}

impl fmt::Display for ApiMetrics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for metric in Metric::ALL {
            writeln!(f, "{}: {}", metric.name(), self.get_value(metric))?;
        }
        Ok(())
    }
}
