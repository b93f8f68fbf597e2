//! Direct and persistent receivers.
//!
//! Both flavours buffer what the session routes to them in an
//! `InboundBuffer` and hand it to the application either through blocking
//! pulls or through a callback task.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, info_span, trace, warn};
use tracing_opentelemetry::OpenTelemetrySpanExt;

use crate::broker::queue::QueueSpec;
use crate::broker::selector::Selector;
use crate::broker::topic::TopicSubscription;
use crate::client::buffer::{InboundBuffer, Popped, ReceiverBufferStrategy};
use crate::client::lifecycle::{Lifecycle, LifecycleCell};
use crate::client::message::InboundMessage;
use crate::client::metrics::Metric;
use crate::client::service::{BindSpec, FlowRoute, ServiceInner, ServiceState, Unsettled};
use crate::transport::message::ClientFrame;
use crate::utils::{Error, Result, locked};

/// Buffer, lifecycle and callback task shared by every receiver flavour.
pub(crate) struct ReceiverCore {
    inner: Arc<ServiceInner>,
    lifecycle: LifecycleCell,
    buffer: Arc<InboundBuffer<InboundMessage>>,
    stop: watch::Sender<bool>,
    callback: Mutex<Option<JoinHandle<()>>>,
}

impl ReceiverCore {
    pub fn new(
        inner: Arc<ServiceInner>,
        strategy: ReceiverBufferStrategy,
        what: &'static str,
    ) -> Self {
        let (stop, _) = watch::channel(false);
        Self {
            inner,
            lifecycle: LifecycleCell::new(what),
            buffer: Arc::new(InboundBuffer::new(strategy)),
            stop,
            callback: Mutex::new(None),
        }
    }

    pub fn inner(&self) -> &Arc<ServiceInner> {
        &self.inner
    }

    pub fn buffer(&self) -> &Arc<InboundBuffer<InboundMessage>> {
        &self.buffer
    }

    pub fn lifecycle(&self) -> Lifecycle {
        self.lifecycle.get()
    }

    pub fn begin_start(&self) -> Result<()> {
        self.lifecycle.start()?;
        if let Err(e) = self.inner.ensure_usable() {
            self.lifecycle.reset();
            return Err(e);
        }
        Ok(())
    }

    pub fn abort_start(&self) {
        self.lifecycle.reset();
    }

    pub fn ensure_started(&self) -> Result<()> {
        self.lifecycle.ensure_started()
    }

    fn closed_error(&self) -> Error {
        if self.inner.state() == ServiceState::Disconnected {
            Error::Interrupted("service disconnected".to_string())
        } else {
            Error::IllegalState("receiver terminated".to_string())
        }
    }

    fn unpack((mut message, discarded): (InboundMessage, bool)) -> InboundMessage {
        if discarded {
            message.mark_discard();
        }
        message
    }

    pub async fn receive(&self) -> Result<InboundMessage> {
        self.ensure_started()?;
        match self.buffer.pop().await {
            Some(next) => Ok(Self::unpack(next)),
            None => Err(self.closed_error()),
        }
    }

    /// `Ok(None)` when nothing arrived within `timeout`.
    pub async fn receive_timeout(&self, timeout: Duration) -> Result<Option<InboundMessage>> {
        self.ensure_started()?;
        match self.buffer.pop_timeout(timeout).await {
            Popped::Item(message, discarded) => Ok(Some(Self::unpack((message, discarded)))),
            Popped::TimedOut => Ok(None),
            Popped::Closed => Err(self.closed_error()),
        }
    }

    /// The next buffered message, without waiting.
    pub fn try_receive(&self) -> Result<Option<InboundMessage>> {
        self.ensure_started()?;
        if let Some(next) = self.buffer.try_pop() {
            return Ok(Some(Self::unpack(next)));
        }
        if self.buffer.is_closed() {
            return Err(self.closed_error());
        }
        Ok(None)
    }

    /// Runs `handler` for every message on a dedicated task.
    pub fn spawn_callback<F>(&self, mut handler: F) -> Result<()>
    where
        F: FnMut(InboundMessage) + Send + 'static,
    {
        self.ensure_started()?;
        let mut slot = locked(&self.callback);
        if slot.is_some() {
            return Err(Error::IllegalState(
                "receiver already has a message handler".to_string(),
            ));
        }

        let buffer = Arc::clone(&self.buffer);
        let mut stop = self.stop.subscribe();
        *slot = Some(tokio::spawn(async move {
            loop {
                tokio::select! {
                    next = buffer.pop() => match next {
                        Some(next) => {
                            let message = Self::unpack(next);
                            let span = info_span!(
                                "relaymq.receive",
                                destination = %message.destination_name(),
                                message_id = %message.message_id(),
                            );
                            span.set_parent(message.trace_context());
                            span.in_scope(|| handler(message));
                        }
                        None => break,
                    },
                    _ = stop.changed() => break,
                }
            }
        }));
        Ok(())
    }

    /// Stops delivery. A callback task may keep draining the buffer for up to `grace`.
    pub async fn shutdown(&self, grace: Duration) -> bool {
        if !self.lifecycle.terminate() {
            return false;
        }
        self.buffer.close();

        let callback = locked(&self.callback).take();
        match callback {
            Some(mut task) => {
                if tokio::time::timeout(grace, &mut task).await.is_err() {
                    let left = self.buffer.len();
                    warn!(left, "receiver terminated before its buffer drained");
                    self.stop.send_replace(true);
                    let _ = task.await;
                }
            }
            None => {
                self.buffer.clear();
            }
        }
        true
    }
}

/// Configures a [`DirectMessageReceiver`].
pub struct DirectMessageReceiverBuilder {
    inner: Arc<ServiceInner>,
    subscriptions: Vec<TopicSubscription>,
    share: Option<String>,
    strategy: ReceiverBufferStrategy,
}

impl DirectMessageReceiverBuilder {
    pub(crate) fn new(inner: Arc<ServiceInner>) -> Self {
        let strategy = ReceiverBufferStrategy::from_capacity(inner.config.receiver.buffer_capacity);
        Self {
            inner,
            subscriptions: Vec::new(),
            share: None,
            strategy,
        }
    }

    /// Subscriptions added when the receiver starts.
    pub fn with_subscriptions(
        mut self,
        subscriptions: impl IntoIterator<Item = TopicSubscription>,
    ) -> Self {
        self.subscriptions.extend(subscriptions);
        self
    }

    /// Receivers using the same share name split the matching messages between them.
    pub fn with_share_name(mut self, name: impl Into<String>) -> Self {
        self.share = Some(name.into());
        self
    }

    /// Buffers received messages without limit.
    pub fn on_back_pressure_elastic(mut self) -> Self {
        self.strategy = ReceiverBufferStrategy::Elastic;
        self
    }

    /// Keeps the newest `capacity` messages. The message after a drop
    /// carries the discard indication.
    pub fn on_back_pressure_drop_oldest(mut self, capacity: usize) -> Self {
        self.strategy = ReceiverBufferStrategy::DropOldest { capacity };
        self
    }

    /// Refuses new messages while `capacity` are buffered. The next message
    /// accepted carries the discard indication.
    pub fn on_back_pressure_drop_latest(mut self, capacity: usize) -> Self {
        self.strategy = ReceiverBufferStrategy::DropLatest { capacity };
        self
    }

    /// Creates the receiver. Nothing is subscribed until `start`.
    pub fn build(self) -> DirectMessageReceiver {
        let id = self.inner.next_id();
        DirectMessageReceiver {
            id,
            core: ReceiverCore::new(self.inner, self.strategy, "direct receiver"),
            subscriptions: Mutex::new(self.subscriptions),
            share: self.share,
        }
    }
}

/// Receives messages published to topics matching its subscriptions.
pub struct DirectMessageReceiver {
    id: u64,
    core: ReceiverCore,
    subscriptions: Mutex<Vec<TopicSubscription>>,
    share: Option<String>,
}

impl DirectMessageReceiver {
    /// Adds every subscription on the broker.
    /// If one is refused the ones already added are removed again.
    pub async fn start(&self) -> Result<()> {
        self.core.begin_start()?;
        let inner = self.core.inner();
        inner.register_direct_route(self.id, Arc::clone(self.core.buffer()));

        let subscriptions = locked(&self.subscriptions).clone();
        for (done, subscription) in subscriptions.iter().enumerate() {
            if let Err(e) = inner
                .subscribe(self.id, subscription, self.share.clone())
                .await
            {
                for earlier in &subscriptions[..done] {
                    let _ = inner
                        .unsubscribe(self.id, earlier.expression(), self.share.clone())
                        .await;
                }
                inner.remove_direct_route(self.id);
                self.core.abort_start();
                return Err(e);
            }
        }
        debug!(receiver = self.id, subscriptions = subscriptions.len(), "direct receiver started");
        Ok(())
    }

    pub fn lifecycle(&self) -> Lifecycle {
        self.core.lifecycle()
    }

    /// Subscriptions currently held, in the order they were added.
    pub fn subscriptions(&self) -> Vec<TopicSubscription> {
        locked(&self.subscriptions).clone()
    }

    /// Subscribes a started receiver to one more topic filter.
    pub async fn add_subscription(&self, subscription: TopicSubscription) -> Result<()> {
        self.core.ensure_started()?;
        self.core
            .inner()
            .subscribe(self.id, &subscription, self.share.clone())
            .await?;
        let mut subscriptions = locked(&self.subscriptions);
        if !subscriptions.contains(&subscription) {
            subscriptions.push(subscription);
        }
        Ok(())
    }

    /// Removes a topic filter. Messages already buffered are still delivered.
    pub async fn remove_subscription(&self, subscription: &TopicSubscription) -> Result<()> {
        self.core.ensure_started()?;
        self.core
            .inner()
            .unsubscribe(self.id, subscription.expression(), self.share.clone())
            .await?;
        locked(&self.subscriptions).retain(|s| s != subscription);
        Ok(())
    }

    /// Waits for the next message.
    /// Fails with `Error::Interrupted` once the service is lost.
    pub async fn receive_message(&self) -> Result<InboundMessage> {
        self.core.receive().await
    }

    /// Like `receive_message`, but gives `Ok(None)` once `timeout` passes.
    pub async fn receive_message_timeout(
        &self,
        timeout: Duration,
    ) -> Result<Option<InboundMessage>> {
        self.core.receive_timeout(timeout).await
    }

    /// The next buffered message, without waiting.
    pub fn try_receive(&self) -> Result<Option<InboundMessage>> {
        self.core.try_receive()
    }

    /// Delivers every message to `handler` on a dedicated task, inside a
    /// `relaymq.receive` span joined to the publisher's trace.
    pub fn receive_async<F>(&self, handler: F) -> Result<()>
    where
        F: FnMut(InboundMessage) + Send + 'static,
    {
        self.core.spawn_callback(handler)
    }

    /// Stops delivery and removes every subscription.
    /// Messages buffered when `grace` runs out are dropped.
    pub async fn terminate(&self, grace: Duration) {
        let inner = Arc::clone(self.core.inner());
        if !self.core.shutdown(grace).await {
            return;
        }
        if inner.ensure_usable().is_ok() {
            for subscription in self.subscriptions() {
                if let Err(e) = inner
                    .unsubscribe(self.id, subscription.expression(), self.share.clone())
                    .await
                {
                    debug!(error = %e, "unsubscribe on terminate failed");
                }
            }
        }
        inner.remove_direct_route(self.id);
        info!(receiver = self.id, "direct receiver terminated");
    }
}

/// Whether binding to a queue that does not exist creates it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MissingResourcesCreationStrategy {
    #[default]
    DoNotCreate,
    CreateOnStart,
}

/// Whether this receiver is the one an exclusive queue is dispatching to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActivationState {
    Active,
    Passive,
}

type ActivationListener = Arc<dyn Fn(ActivationState) + Send + Sync>;

/// Configures a [`PersistentMessageReceiver`].
pub struct PersistentMessageReceiverBuilder {
    inner: Arc<ServiceInner>,
    subscriptions: Vec<TopicSubscription>,
    selector: Option<String>,
    auto_ack: bool,
    missing: MissingResourcesCreationStrategy,
    window: usize,
    activation: Option<ActivationListener>,
}

impl PersistentMessageReceiverBuilder {
    pub(crate) fn new(inner: Arc<ServiceInner>) -> Self {
        let window = inner.config.receiver.window_size.max(1);
        Self {
            inner,
            subscriptions: Vec::new(),
            selector: None,
            auto_ack: false,
            missing: MissingResourcesCreationStrategy::default(),
            window,
            activation: None,
        }
    }

    /// Topic subscriptions added to the queue when the receiver starts.
    pub fn with_subscriptions(
        mut self,
        subscriptions: impl IntoIterator<Item = TopicSubscription>,
    ) -> Self {
        self.subscriptions.extend(subscriptions);
        self
    }

    /// Only messages whose properties match `expression` are dispatched.
    /// The expression is checked by `build`.
    pub fn with_message_selector(mut self, expression: impl Into<String>) -> Self {
        self.selector = Some(expression.into());
        self
    }

    /// Acknowledges each message after the callback returns, or as it is
    /// handed out by a pull.
    pub fn with_message_auto_acknowledgement(mut self) -> Self {
        self.auto_ack = true;
        self
    }

    /// Whether `start` creates the queue when the broker does not have it.
    pub fn with_missing_resources_creation_strategy(
        mut self,
        strategy: MissingResourcesCreationStrategy,
    ) -> Self {
        self.missing = strategy;
        self
    }

    /// Unacknowledged messages the broker may have outstanding to this receiver.
    pub fn with_window_size(mut self, window: usize) -> Self {
        self.window = window.max(1);
        self
    }

    /// Reports whether this receiver is the active consumer of an exclusive
    /// queue. Called on bind and again when it takes over from another consumer.
    pub fn with_activation_passivation_support<F>(mut self, listener: F) -> Self
    where
        F: Fn(ActivationState) + Send + Sync + 'static,
    {
        self.activation = Some(Arc::new(listener));
        self
    }

    /// Fails with `Error::InvalidSelector` for a malformed selector.
    pub fn build(self, queue: QueueSpec) -> Result<PersistentMessageReceiver> {
        if let Some(expression) = &self.selector {
            Selector::parse(expression)?;
        }
        let flow = self.inner.next_id();
        let bind = BindSpec {
            queue,
            subscriptions: self
                .subscriptions
                .iter()
                .map(|s| s.expression().to_string())
                .collect(),
            selector: self.selector,
            window: self.window,
            create_if_missing: self.missing == MissingResourcesCreationStrategy::CreateOnStart,
            paused: false,
        };
        let acker = Arc::new(Acker {
            inner: Arc::clone(&self.inner),
            flow,
            unsettled: Arc::new(Mutex::new(Unsettled::default())),
        });

        Ok(PersistentMessageReceiver {
            flow,
            core: ReceiverCore::new(self.inner, ReceiverBufferStrategy::Elastic, "persistent receiver"),
            bind,
            auto_ack: self.auto_ack,
            activation: self.activation,
            acker,
        })
    }
}

struct Acker {
    inner: Arc<ServiceInner>,
    flow: u64,
    unsettled: Arc<Mutex<Unsettled>>,
}

impl Acker {
    fn ack(&self, message: &InboundMessage) -> Result<()> {
        let tag = message.delivery_tag().ok_or_else(|| {
            Error::IllegalState("message was not received from a queue".to_string())
        })?;
        if tag.flow != self.flow {
            return Err(Error::IllegalState(
                "message was received by another receiver".to_string(),
            ));
        }
        if !locked(&self.unsettled).settle(&tag) {
            trace!(flow = tag.flow, delivery = tag.delivery, "delivery already settled");
            return Ok(());
        }
        if let Err(e) = self.inner.send(ClientFrame::Ack {
            flow: tag.flow,
            delivery: tag.delivery,
        }) {
            locked(&self.unsettled).restore(&tag);
            return Err(e);
        }
        self.inner.metrics.increment(Metric::MessagesAcknowledged);
        Ok(())
    }
}

/// Consumes guaranteed messages from one queue.
pub struct PersistentMessageReceiver {
    flow: u64,
    core: ReceiverCore,
    bind: BindSpec,
    auto_ack: bool,
    activation: Option<ActivationListener>,
    acker: Arc<Acker>,
}

impl PersistentMessageReceiver {
    /// Binds to the queue, creating it first when the strategy allows.
    pub async fn start(&self) -> Result<()> {
        self.core.begin_start()?;
        let inner = self.core.inner();
        let activation = self.activation.clone().map(|listener| {
            Arc::new(move |active: bool| {
                listener(if active {
                    ActivationState::Active
                } else {
                    ActivationState::Passive
                })
            }) as Arc<dyn Fn(bool) + Send + Sync>
        });
        inner.register_flow_route(
            self.flow,
            FlowRoute {
                buffer: Arc::clone(self.core.buffer()),
                unsettled: Arc::clone(&self.acker.unsettled),
                activation,
            },
        );

        if let Err(e) = inner.bind(self.flow, self.bind.clone()).await {
            inner.remove_flow_route(self.flow);
            self.core.abort_start();
            return Err(e);
        }
        debug!(flow = self.flow, queue = %self.bind.queue.name, "persistent receiver started");
        Ok(())
    }

    pub fn lifecycle(&self) -> Lifecycle {
        self.core.lifecycle()
    }

    /// The bound queue. Anonymous queues carry their generated name.
    pub fn queue(&self) -> &QueueSpec {
        &self.bind.queue
    }

    /// Settles a message with the broker.
    ///
    /// Acknowledging twice is a no-op. So is acknowledging a message that
    /// arrived before a reconnect: the broker redelivers it on the new
    /// connection, and that copy is the one to acknowledge.
    pub fn ack(&self, message: &InboundMessage) -> Result<()> {
        self.core.ensure_started()?;
        self.acker.ack(message)
    }

    fn auto_ack(&self, message: &InboundMessage) {
        if self.auto_ack {
            if let Err(e) = self.acker.ack(message) {
                warn!(error = %e, "auto acknowledgement failed");
            }
        }
    }

    /// Waits for the next message.
    /// Fails with `Error::Interrupted` once the service is lost.
    pub async fn receive_message(&self) -> Result<InboundMessage> {
        let message = self.core.receive().await?;
        self.auto_ack(&message);
        Ok(message)
    }

    /// Like `receive_message`, but gives `Ok(None)` once `timeout` passes.
    /// The message stays unacknowledged unless auto-acknowledgement is on.
    pub async fn receive_message_timeout(
        &self,
        timeout: Duration,
    ) -> Result<Option<InboundMessage>> {
        let message = self.core.receive_timeout(timeout).await?;
        if let Some(message) = &message {
            self.auto_ack(message);
        }
        Ok(message)
    }

    /// The next buffered message, without waiting.
    pub fn try_receive(&self) -> Result<Option<InboundMessage>> {
        let message = self.core.try_receive()?;
        if let Some(message) = &message {
            self.auto_ack(message);
        }
        Ok(message)
    }

    /// With auto-acknowledgement, each message is acked after `handler` returns.
    pub fn receive_async<F>(&self, mut handler: F) -> Result<()>
    where
        F: FnMut(InboundMessage) + Send + 'static,
    {
        if !self.auto_ack {
            return self.core.spawn_callback(handler);
        }
        let acker = Arc::clone(&self.acker);
        self.core.spawn_callback(move |message| {
            let tagged = message.clone();
            handler(message);
            if let Err(e) = acker.ack(&tagged) {
                warn!(error = %e, "auto acknowledgement failed");
            }
        })
    }

    /// Stops delivery locally and asks the broker to stop dispatching.
    pub fn pause(&self) -> Result<()> {
        self.core.ensure_started()?;
        self.core.buffer().set_paused(true);
        self.core.inner().set_flow_paused(self.flow, true)
    }

    /// Undoes [`pause`](Self::pause); deferred messages are delivered in order.
    pub fn resume(&self) -> Result<()> {
        self.core.ensure_started()?;
        self.core.buffer().set_paused(false);
        self.core.inner().set_flow_paused(self.flow, false)
    }

    /// Whether delivery is paused by [`pause`](Self::pause).
    pub fn is_paused(&self) -> bool {
        self.core.buffer().is_paused()
    }

    /// Unacknowledged messages go back to the queue for redelivery.
    pub async fn terminate(&self, grace: Duration) {
        let inner = Arc::clone(self.core.inner());
        if !self.core.shutdown(grace).await {
            return;
        }
        if inner.ensure_usable().is_ok() {
            if let Err(e) = inner.unbind(self.flow) {
                debug!(error = %e, "unbind on terminate failed");
            }
        }
        inner.remove_flow_route(self.flow);
        info!(flow = self.flow, "persistent receiver terminated");
    }
}
