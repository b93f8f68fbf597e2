//! Request/reply over direct messaging.
//!
//! Requests carry the service's reply inbox as `reply_to` and a correlation
//! id. Repliers publish to that inbox with the same correlation id, and the
//! session routes the reply to the waiting request through the service's
//! reply correlation table.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::{debug, warn};

use crate::broker::message::{DeliveryMode, Destination, Message};
use crate::broker::topic::TopicSubscription;
use crate::client::buffer::BackPressure;
use crate::client::lifecycle::Lifecycle;
use crate::client::message::{InboundMessage, OutboundMessage, Topic};
use crate::client::metrics::Metric;
use crate::client::publisher::{DirectMessagePublisher, DirectMessagePublisherBuilder};
use crate::client::receiver::{DirectMessageReceiver, DirectMessageReceiverBuilder};
use crate::client::service::ServiceInner;
use crate::utils::{Error, Result, locked};

/// Configures a [`RequestReplyMessagePublisher`].
///
/// The reply timeout starts out as `receiver.reply_timeout_ms` from the
/// service configuration.
pub struct RequestReplyMessagePublisherBuilder {
    inner: Arc<ServiceInner>,
    reply_timeout: Duration,
}

impl RequestReplyMessagePublisherBuilder {
    pub(crate) fn new(inner: Arc<ServiceInner>) -> Self {
        let reply_timeout = Duration::from_millis(inner.config.receiver.reply_timeout_ms);
        Self {
            inner,
            reply_timeout,
        }
    }

    /// Timeout used by [`RequestReplyMessagePublisher::request`].
    pub fn with_reply_timeout(mut self, timeout: Duration) -> Self {
        self.reply_timeout = timeout;
        self
    }

    /// Creates the publisher; requests can be sent once it is started.
    pub fn build(self) -> RequestReplyMessagePublisher {
        let strategy = BackPressure::from_settings(&self.inner.config.publisher);
        let publisher = DirectMessagePublisherBuilder::new(Arc::clone(&self.inner), strategy).build();
        RequestReplyMessagePublisher {
            inner: self.inner,
            publisher,
            reply_timeout: self.reply_timeout,
        }
    }
}

/// Sends requests and matches each one with at most one reply.
pub struct RequestReplyMessagePublisher {
    inner: Arc<ServiceInner>,
    publisher: DirectMessagePublisher,
    reply_timeout: Duration,
}

impl RequestReplyMessagePublisher {
    /// Subscribes the service's reply inbox, then starts publishing.
    pub async fn start(&self) -> Result<()> {
        self.inner.ensure_usable()?;
        self.inner.ensure_reply_inbox().await?;
        self.publisher.start()
    }

    pub fn lifecycle(&self) -> Lifecycle {
        self.publisher.lifecycle()
    }

    fn prepare(&self, mut message: OutboundMessage, topic: &Topic) -> (String, Message) {
        let correlation_id = match message.correlation_id() {
            Some(id) => id.to_string(),
            None => {
                let id = uuid::Uuid::new_v4().to_string();
                message.set_correlation_id(id.clone());
                id
            }
        };
        let mut request = message.into_message(topic.into(), DeliveryMode::Direct);
        request.reply_to = Some(self.inner.reply_inbox().to_string());
        (correlation_id, request)
    }

    /// Sends a request; `handler` gets the reply or the timeout, never both.
    pub async fn publish<C, F>(
        &self,
        message: OutboundMessage,
        topic: &Topic,
        timeout: Duration,
        context: C,
        handler: F,
    ) -> Result<()>
    where
        C: Send + 'static,
        F: FnOnce(Result<InboundMessage>, C) + Send + 'static,
    {
        let (correlation_id, request) = self.prepare(message, topic);
        let rx = self.inner.replies.register(correlation_id.clone());
        if let Err(e) = self.publisher.send_message(request).await {
            self.inner.replies.cancel(&correlation_id);
            return Err(e);
        }
        self.inner.metrics.increment(Metric::RequestsSent);

        let inner = Arc::clone(&self.inner);
        self.inner
            .replies
            .on_complete(correlation_id, rx, Some(timeout), move |outcome| {
                if matches!(outcome, Err(Error::Timeout(_))) {
                    inner.metrics.increment(Metric::RequestTimeouts);
                }
                handler(outcome, context);
            });
        Ok(())
    }

    /// Sends a request and waits up to `timeout` for its reply.
    pub async fn publish_await_response(
        &self,
        message: OutboundMessage,
        topic: &Topic,
        timeout: Duration,
    ) -> Result<InboundMessage> {
        let (correlation_id, request) = self.prepare(message, topic);
        let rx = self.inner.replies.register(correlation_id.clone());
        if let Err(e) = self.publisher.send_message(request).await {
            self.inner.replies.cancel(&correlation_id);
            return Err(e);
        }
        self.inner.metrics.increment(Metric::RequestsSent);

        let outcome = self
            .inner
            .replies
            .wait(correlation_id, rx, Some(timeout))
            .await;
        if matches!(outcome, Err(Error::Timeout(_))) {
            self.inner.metrics.increment(Metric::RequestTimeouts);
        }
        outcome
    }

    /// Sends a request and waits for its reply up to the configured reply timeout.
    pub async fn request(&self, message: OutboundMessage, topic: &Topic) -> Result<InboundMessage> {
        self.publish_await_response(message, topic, self.reply_timeout)
            .await
    }

    /// Timeout applied by [`request`](Self::request).
    pub fn reply_timeout(&self) -> Duration {
        self.reply_timeout
    }

    /// Stops sending. Requests already sent still get their reply or timeout.
    pub async fn terminate(&self, grace: Duration) {
        self.publisher.terminate(grace).await;
    }
}

/// A reply that could not be sent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailedReply {
    pub correlation_id: Option<String>,
    pub error: String,
}

type ReplyFailureListener = Arc<dyn Fn(FailedReply) + Send + Sync>;

/// Answers one request.
#[derive(Clone)]
pub struct Replier {
    publisher: Arc<DirectMessagePublisher>,
    reply_to: Option<String>,
    correlation_id: Option<String>,
    failure_listener: Arc<Mutex<Option<ReplyFailureListener>>>,
}

impl Replier {
    /// Correlation id of the request being answered.
    pub fn correlation_id(&self) -> Option<&str> {
        self.correlation_id.as_deref()
    }

    /// Publishes `response` to the request's reply-to topic.
    ///
    /// Fails with `Error::IllegalState` when the request had no reply-to; the
    /// reply failure listener hears about it as well.
    pub fn reply(&self, response: OutboundMessage) -> Result<()> {
        let outcome = match &self.reply_to {
            Some(reply_to) => {
                let mut message = response
                    .into_message(Destination::Topic(reply_to.clone()), DeliveryMode::Direct);
                if self.correlation_id.is_some() {
                    message.correlation_id = self.correlation_id.clone();
                }
                self.publisher.try_send_message(message)
            }
            None => Err(Error::IllegalState(
                "request has no reply-to destination".to_string(),
            )),
        };

        if let Err(e) = &outcome {
            let failed = FailedReply {
                correlation_id: self.correlation_id.clone(),
                error: e.to_string(),
            };
            let listener = locked(&self.failure_listener).clone();
            match listener {
                Some(listener) => listener(failed),
                None => warn!(correlation_id = ?failed.correlation_id, error = %failed.error, "reply failed"),
            }
        }
        outcome
    }
}

/// Configures a [`RequestReplyMessageReceiver`].
pub struct RequestReplyMessageReceiverBuilder {
    inner: Arc<ServiceInner>,
    share: Option<String>,
}

impl RequestReplyMessageReceiverBuilder {
    pub(crate) fn new(inner: Arc<ServiceInner>) -> Self {
        Self { inner, share: None }
    }

    /// Repliers sharing a name take turns answering requests.
    pub fn with_share_name(mut self, name: impl Into<String>) -> Self {
        self.share = Some(name.into());
        self
    }

    /// Creates a receiver for requests published to `subscription`.
    pub fn build(self, subscription: TopicSubscription) -> RequestReplyMessageReceiver {
        let mut receiver =
            DirectMessageReceiverBuilder::new(Arc::clone(&self.inner)).with_subscriptions([subscription]);
        if let Some(share) = self.share {
            receiver = receiver.with_share_name(share);
        }
        let publisher =
            DirectMessagePublisherBuilder::new(self.inner, BackPressure::Elastic).build();

        RequestReplyMessageReceiver {
            receiver: receiver.build(),
            publisher: Arc::new(publisher),
            failure_listener: Arc::new(Mutex::new(None)),
        }
    }
}

/// Receives requests and hands out a [`Replier`] for each.
pub struct RequestReplyMessageReceiver {
    receiver: DirectMessageReceiver,
    publisher: Arc<DirectMessagePublisher>,
    failure_listener: Arc<Mutex<Option<ReplyFailureListener>>>,
}

impl RequestReplyMessageReceiver {
    /// Subscribes to the request topic.
    pub async fn start(&self) -> Result<()> {
        self.receiver.start().await?;
        self.publisher.start()
    }

    pub fn lifecycle(&self) -> Lifecycle {
        self.receiver.lifecycle()
    }

    /// Called when a reply cannot be published.
    pub fn set_reply_failure_listener<F>(&self, listener: F)
    where
        F: Fn(FailedReply) + Send + Sync + 'static,
    {
        *locked(&self.failure_listener) = Some(Arc::new(listener));
    }

    fn replier_for(&self, request: &InboundMessage) -> Replier {
        replier(&self.publisher, &self.failure_listener, request)
    }

    /// Waits for the next request and a handle to answer it.
    pub async fn receive_message(&self) -> Result<(InboundMessage, Replier)> {
        let request = self.receiver.receive_message().await?;
        let replier = self.replier_for(&request);
        Ok((request, replier))
    }

    /// Like `receive_message`, but gives `Ok(None)` once `timeout` passes.
    pub async fn receive_message_timeout(
        &self,
        timeout: Duration,
    ) -> Result<Option<(InboundMessage, Replier)>> {
        let request = self.receiver.receive_message_timeout(timeout).await?;
        Ok(request.map(|request| {
            let replier = self.replier_for(&request);
            (request, replier)
        }))
    }

    /// Calls `handler` with every request and its [`Replier`].
    pub fn receive_async<F>(&self, mut handler: F) -> Result<()>
    where
        F: FnMut(InboundMessage, Replier) + Send + 'static,
    {
        let publisher = Arc::clone(&self.publisher);
        let failure_listener = Arc::clone(&self.failure_listener);
        self.receiver.receive_async(move |request| {
            let replier = replier(&publisher, &failure_listener, &request);
            handler(request, replier);
        })
    }

    /// Unsubscribes and stops the publisher used for replies.
    pub async fn terminate(&self, grace: Duration) {
        self.receiver.terminate(grace).await;
        self.publisher.terminate(grace).await;
        debug!("request/reply receiver terminated");
    }
}

fn replier(
    publisher: &Arc<DirectMessagePublisher>,
    failure_listener: &Arc<Mutex<Option<ReplyFailureListener>>>,
    request: &InboundMessage,
) -> Replier {
    Replier {
        publisher: Arc::clone(publisher),
        reply_to: request.reply_to().map(str::to_string),
        correlation_id: request.correlation_id().map(str::to_string),
        failure_listener: Arc::clone(failure_listener),
    }
}
