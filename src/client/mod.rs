//! The client SDK.
//!
//! A [`MessagingService`] owns the session with a broker. Publishers,
//! receivers, queue browsers and request/reply endpoints are built from it
//! and share its connection, reconnection handling and correlation tables.

pub mod browser;
pub mod buffer;
pub mod correlation;
pub mod lifecycle;
pub mod message;
pub mod metrics;
pub mod publisher;
pub mod receiver;
pub mod request_reply;
pub mod retry;
pub mod service;
pub mod trace_context;

pub use browser::{MessageQueueBrowser, MessageQueueBrowserBuilder};
pub use buffer::{BackPressure, ReceiverBufferStrategy};
pub use correlation::CorrelationTable;
pub use lifecycle::Lifecycle;
pub use message::{DeliveryTag, InboundMessage, OutboundMessage, OutboundMessageBuilder, Topic};
pub use metrics::{ApiMetrics, Metric};
pub use publisher::{
    DirectMessagePublisher, DirectMessagePublisherBuilder, FailedPublish,
    PersistentMessagePublisher, PersistentMessagePublisherBuilder, PublishReceipt,
};
pub use receiver::{
    ActivationState, DirectMessageReceiver, DirectMessageReceiverBuilder,
    MissingResourcesCreationStrategy, PersistentMessageReceiver, PersistentMessageReceiverBuilder,
};
pub use request_reply::{
    FailedReply, Replier, RequestReplyMessagePublisher, RequestReplyMessagePublisherBuilder,
    RequestReplyMessageReceiver, RequestReplyMessageReceiverBuilder,
};
pub use retry::RetryStrategy;
pub use service::{ApiInfo, MessagingService, MessagingServiceBuilder, ServiceEvent, ServiceState};
pub use trace_context::install_propagator;

#[cfg(test)]
mod tests;
