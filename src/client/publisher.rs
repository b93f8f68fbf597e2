//! Direct and persistent publishers.
//!
//! A publisher accepts messages into its outbound buffer according to its
//! back-pressure strategy. A pump task forwards buffered frames to the
//! session while the service is connected and holds them while it is
//! reconnecting.

use std::fmt;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{Notify, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::broker::message::{DeliveryMode, Destination, Message};
use crate::client::buffer::{BackPressure, BufferRx, OutboundBuffer};
use crate::client::lifecycle::{Lifecycle, LifecycleCell};
use crate::client::message::{OutboundMessage, OutboundMessageBuilder, Topic};
use crate::client::metrics::Metric;
use crate::client::service::{FailureListener, ServiceInner, ServiceState};
use crate::transport::message::ClientFrame;
use crate::utils::{Error, Result, locked};

/// A direct message that never made it to subscribers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailedPublish {
    pub message_id: String,
    pub error: String,
}

/// Outcome of one persistent publish, delivered exactly once.
pub struct PublishReceipt<C> {
    pub message: Message,
    pub user_context: Option<C>,
    /// `None` when the broker accepted the message.
    pub error: Option<Error>,
    pub timestamp: DateTime<Utc>,
}

impl<C> PublishReceipt<C> {
    /// `true` when the broker confirmed the message.
    pub fn is_persisted(&self) -> bool {
        self.error.is_none()
    }
}

impl<C: fmt::Debug> fmt::Debug for PublishReceipt<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PublishReceipt")
            .field("message_id", &self.message.message_id)
            .field("user_context", &self.user_context)
            .field("error", &self.error)
            .field("timestamp", &self.timestamp)
            .finish()
    }
}

type ReadinessListener = Arc<dyn Fn() + Send + Sync>;

/// State the pump task shares with its publisher.
struct PumpShared {
    id: u64,
    queued: AtomicUsize,
    drained: Notify,
    failure_listener: Mutex<Option<FailureListener>>,
}

impl PumpShared {
    fn settle(&self) {
        self.queued.fetch_sub(1, Ordering::AcqRel);
        self.drained.notify_waiters();
    }

    fn report_failure(&self, message_id: String, error: &Error) {
        let listener = locked(&self.failure_listener).clone();
        match listener {
            Some(listener) => listener(FailedPublish {
                message_id,
                error: error.to_string(),
            }),
            None => warn!(publisher = self.id, %message_id, %error, "direct publish failed"),
        }
    }
}

/// Lifecycle, buffer and pump shared by every publisher flavour.
pub(crate) struct PublisherCore {
    inner: Arc<ServiceInner>,
    lifecycle: LifecycleCell,
    buffer: OutboundBuffer<ClientFrame>,
    rx: Mutex<Option<BufferRx<ClientFrame>>>,
    shared: Arc<PumpShared>,
    stop: watch::Sender<bool>,
    pump: Mutex<Option<JoinHandle<()>>>,
    readiness: Mutex<Option<ReadinessListener>>,
}

impl PublisherCore {
    pub fn new(inner: Arc<ServiceInner>, strategy: BackPressure, what: &'static str) -> Self {
        let (buffer, rx) = OutboundBuffer::new(strategy);
        let (stop, _) = watch::channel(false);
        let shared = Arc::new(PumpShared {
            id: inner.next_id(),
            queued: AtomicUsize::new(0),
            drained: Notify::new(),
            failure_listener: Mutex::new(None),
        });
        Self {
            inner,
            lifecycle: LifecycleCell::new(what),
            buffer,
            rx: Mutex::new(Some(rx)),
            shared,
            stop,
            pump: Mutex::new(None),
            readiness: Mutex::new(None),
        }
    }

    pub fn id(&self) -> u64 {
        self.shared.id
    }

    pub fn inner(&self) -> &Arc<ServiceInner> {
        &self.inner
    }

    pub fn lifecycle(&self) -> Lifecycle {
        self.lifecycle.get()
    }

    pub fn start(&self) -> Result<()> {
        self.lifecycle.start()?;
        if let Err(e) = self.inner.ensure_usable() {
            self.lifecycle.reset();
            return Err(e);
        }
        let Some(rx) = locked(&self.rx).take() else {
            return Err(Error::IllegalState("publisher already started".to_string()));
        };
        let pump = tokio::spawn(pump(
            Arc::clone(&self.inner),
            Arc::clone(&self.shared),
            rx,
            self.stop.subscribe(),
        ));
        *locked(&self.pump) = Some(pump);
        debug!(publisher = self.id(), strategy = ?self.buffer.strategy(), "publisher started");
        Ok(())
    }

    fn ensure_ready(&self) -> Result<()> {
        self.lifecycle.ensure_started()?;
        self.inner.ensure_usable()
    }

    fn note_overflow(&self, result: Result<()>) -> Result<()> {
        if let Err(Error::PublisherOverflow { .. }) = &result {
            self.inner.metrics.increment(Metric::PublisherOverflows);
        }
        if result.is_err() {
            self.shared.settle();
        }
        result
    }

    /// Buffers `frame`, waiting for room only under the `Wait` strategy.
    pub async fn accept(&self, frame: ClientFrame) -> Result<()> {
        self.ensure_ready()?;
        self.shared.queued.fetch_add(1, Ordering::AcqRel);
        let result = self.buffer.push(frame).await;
        self.note_overflow(result)
    }

    /// Buffers `frame` without waiting.
    pub fn try_accept(&self, frame: ClientFrame) -> Result<()> {
        self.ensure_ready()?;
        self.shared.queued.fetch_add(1, Ordering::AcqRel);
        let result = self.buffer.try_push(frame);
        self.note_overflow(result)
    }

    pub fn set_failure_listener(&self, listener: FailureListener) {
        *locked(&self.shared.failure_listener) = Some(Arc::clone(&listener));
        self.inner.register_failure_listener(self.id(), listener);
    }

    pub fn set_readiness_listener(&self, listener: ReadinessListener) {
        *locked(&self.readiness) = Some(listener);
    }

    /// Calls the readiness listener once there is room in the buffer.
    pub fn notify_when_ready(&self) {
        let Some(listener) = locked(&self.readiness).clone() else {
            debug!(publisher = self.id(), "no readiness listener registered");
            return;
        };
        self.buffer.notify_when_ready(move || listener());
    }

    pub fn is_ready(&self) -> bool {
        self.lifecycle.get() == Lifecycle::Started && self.buffer.has_capacity()
    }

    /// Stops accepting messages, gives the buffer up to `grace` to drain and
    /// fails whatever is left.
    pub async fn terminate(&self, grace: Duration) {
        if !self.lifecycle.terminate() {
            return;
        }

        let drained = tokio::time::timeout(grace, async {
            loop {
                let notified = self.shared.drained.notified();
                if self.shared.queued.load(Ordering::Acquire) == 0 {
                    break;
                }
                notified.await;
            }
        })
        .await;
        if drained.is_err() {
            warn!(
                publisher = self.id(),
                remaining = self.shared.queued.load(Ordering::Acquire),
                "publisher terminated before its buffer drained"
            );
        }

        self.stop.send_replace(true);
        let pump = locked(&self.pump).take();
        if let Some(pump) = pump {
            if let Err(e) = pump.await {
                warn!(error = %e, "publisher pump failed");
            }
        }
        self.inner.remove_failure_listener(self.id());
        info!(publisher = self.id(), "publisher terminated");
    }
}

/// Waits until the frame can go out on a live connection.
async fn wait_connected(inner: &ServiceInner, stop: &mut watch::Receiver<bool>) -> Result<()> {
    let mut state = inner.state_receiver();
    loop {
        let current = *state.borrow_and_update();
        match current {
            ServiceState::Connected => return Ok(()),
            ServiceState::Disconnected => {
                return Err(Error::Interrupted("service disconnected".to_string()));
            }
            ServiceState::NotConnected => {
                return Err(Error::IllegalState("service is not connected".to_string()));
            }
            ServiceState::Reconnecting => {}
        }
        tokio::select! {
            changed = state.changed() => {
                if changed.is_err() {
                    return Err(Error::Interrupted("service dropped".to_string()));
                }
            }
            _ = stop.changed() => {
                return Err(Error::IllegalState("publisher terminated".to_string()));
            }
        }
    }
}

fn forward(inner: &ServiceInner, shared: &PumpShared, frame: ClientFrame) {
    let (receipt, message_id) = match &frame {
        ClientFrame::Publish {
            receipt, message, ..
        } => {
            if let Some(receipt) = receipt {
                // tracked before the check so a timeout racing with us still untracks it
                inner.track_pending(*receipt, message.clone(), Some(shared.id));
                if !inner.receipts.contains(receipt) {
                    inner.untrack_pending(*receipt);
                    debug!(
                        receipt,
                        message_id = %message.message_id,
                        "receipt already reported, message not sent"
                    );
                    return;
                }
            }
            (*receipt, message.message_id.clone())
        }
        _ => (None, String::new()),
    };

    match inner.send(frame) {
        Ok(()) => {
            let metric = if receipt.is_some() {
                Metric::PersistentMessagesSent
            } else {
                Metric::DirectMessagesSent
            };
            inner.metrics.increment(metric);
        }
        Err(e) => match receipt {
            Some(receipt) => {
                inner.untrack_pending(receipt);
                inner.receipts.complete(&receipt, Err(e));
            }
            None => shared.report_failure(message_id, &e),
        },
    }
}

fn fail(inner: &ServiceInner, shared: &PumpShared, frame: ClientFrame, error: Error) {
    if let ClientFrame::Publish {
        receipt, message, ..
    } = frame
    {
        match receipt {
            Some(receipt) => {
                inner.receipts.complete(&receipt, Err(error));
            }
            None => shared.report_failure(message.message_id, &error),
        }
    }
}

async fn pump(
    inner: Arc<ServiceInner>,
    shared: Arc<PumpShared>,
    mut rx: BufferRx<ClientFrame>,
    mut stop: watch::Receiver<bool>,
) {
    loop {
        let next = tokio::select! {
            next = rx.recv() => next,
            _ = stop.changed() => break,
        };
        let Some(frame) = next else { break };

        match wait_connected(&inner, &mut stop).await {
            Ok(()) => forward(&inner, &shared, frame),
            Err(e) => fail(&inner, &shared, frame, e),
        }
        shared.settle();
    }

    while let Some(frame) = rx.try_recv() {
        fail(
            &inner,
            &shared,
            frame,
            Error::IllegalState("publisher terminated".to_string()),
        );
        shared.settle();
    }
}

/// Configures a [`DirectMessagePublisher`].
pub struct DirectMessagePublisherBuilder {
    inner: Arc<ServiceInner>,
    strategy: BackPressure,
}

impl DirectMessagePublisherBuilder {
    pub(crate) fn new(inner: Arc<ServiceInner>, strategy: BackPressure) -> Self {
        Self { inner, strategy }
    }

    /// Publishing fails with `Error::PublisherOverflow` while `capacity`
    /// messages are waiting to be sent.
    pub fn on_back_pressure_reject(mut self, capacity: usize) -> Self {
        self.strategy = BackPressure::Reject { capacity };
        self
    }

    /// Publishing waits for room while `capacity` messages are waiting to be sent.
    pub fn on_back_pressure_wait(mut self, capacity: usize) -> Self {
        self.strategy = BackPressure::Wait { capacity };
        self
    }

    /// Buffers without limit.
    pub fn on_back_pressure_elastic(mut self) -> Self {
        self.strategy = BackPressure::Elastic;
        self
    }

    /// Creates the publisher in the not-started state.
    pub fn build(self) -> DirectMessagePublisher {
        DirectMessagePublisher {
            core: PublisherCore::new(self.inner, self.strategy, "direct publisher"),
        }
    }
}

/// Fire-and-forget publishing to topics.
pub struct DirectMessagePublisher {
    core: PublisherCore,
}

impl DirectMessagePublisher {
    /// Starts the publisher. Fails unless the service is connected or reconnecting.
    pub fn start(&self) -> Result<()> {
        self.core.start()
    }

    pub fn lifecycle(&self) -> Lifecycle {
        self.core.lifecycle()
    }

    /// Same as [`MessagingService::message_builder`](crate::client::MessagingService::message_builder).
    pub fn message_builder(&self) -> OutboundMessageBuilder {
        OutboundMessageBuilder::new()
    }

    fn frame(&self, message: Message) -> ClientFrame {
        ClientFrame::Publish {
            message,
            receipt: None,
            publisher: Some(self.core.id()),
        }
    }

    /// Queues `message` for `topic`.
    ///
    /// Returns once the message is buffered, not when it reaches the broker.
    /// Refusals from the broker go to the publish failure listener.
    pub async fn publish(&self, message: OutboundMessage, topic: &Topic) -> Result<()> {
        self.send_message(message.into_message(topic.into(), DeliveryMode::Direct))
            .await
    }

    /// Publishes a bare payload without properties.
    pub async fn publish_bytes(&self, payload: impl Into<Vec<u8>>, topic: &Topic) -> Result<()> {
        let message = OutboundMessageBuilder::new().build(payload);
        self.publish(message, topic).await
    }

    /// Like `publish`, but never waits for buffer space.
    pub fn try_publish(&self, message: OutboundMessage, topic: &Topic) -> Result<()> {
        self.try_send_message(message.into_message(topic.into(), DeliveryMode::Direct))
    }

    pub(crate) async fn send_message(&self, message: Message) -> Result<()> {
        self.core.accept(self.frame(message)).await
    }

    pub(crate) fn try_send_message(&self, message: Message) -> Result<()> {
        self.core.try_accept(self.frame(message))
    }

    /// Called for each message the broker or the session could not deliver.
    pub fn set_publish_failure_listener<F>(&self, listener: F)
    where
        F: Fn(FailedPublish) + Send + Sync + 'static,
    {
        self.core.set_failure_listener(Arc::new(listener));
    }

    /// Listener for [`notify_when_ready`](Self::notify_when_ready).
    pub fn set_publisher_readiness_listener<F>(&self, listener: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.core.set_readiness_listener(Arc::new(listener));
    }

    /// Calls the readiness listener once the buffer has room again.
    pub fn notify_when_ready(&self) {
        self.core.notify_when_ready();
    }

    /// Whether a publish would be accepted right now.
    pub fn is_ready(&self) -> bool {
        self.core.is_ready()
    }

    /// Stops accepting messages and gives the buffer up to `grace` to drain.
    /// Whatever is left fails: persistent messages through their receipt,
    /// direct ones through the failure listener.
    pub async fn terminate(&self, grace: Duration) {
        self.core.terminate(grace).await;
    }
}

/// Configures a [`PersistentMessagePublisher`].
pub struct PersistentMessagePublisherBuilder {
    inner: Arc<ServiceInner>,
    strategy: BackPressure,
}

impl PersistentMessagePublisherBuilder {
    pub(crate) fn new(inner: Arc<ServiceInner>, strategy: BackPressure) -> Self {
        Self { inner, strategy }
    }

    /// Publishing fails with `Error::PublisherOverflow` while `capacity`
    /// messages are waiting to be sent.
    pub fn on_back_pressure_reject(mut self, capacity: usize) -> Self {
        self.strategy = BackPressure::Reject { capacity };
        self
    }

    /// Publishing waits for room while `capacity` messages are waiting to be sent.
    pub fn on_back_pressure_wait(mut self, capacity: usize) -> Self {
        self.strategy = BackPressure::Wait { capacity };
        self
    }

    /// Buffers without limit.
    pub fn on_back_pressure_elastic(mut self) -> Self {
        self.strategy = BackPressure::Elastic;
        self
    }

    /// `C` is the type of the user context handed back with each receipt.
    pub fn build<C: Send + 'static>(self) -> PersistentMessagePublisher<C> {
        let ack_timeout = Duration::from_millis(self.inner.config.publisher.ack_timeout_ms);
        PersistentMessagePublisher {
            core: PublisherCore::new(self.inner, self.strategy, "persistent publisher"),
            receipt_listener: Arc::new(Mutex::new(None)),
            ack_timeout,
            _context: PhantomData,
        }
    }
}

type ReceiptListener<C> = Arc<dyn Fn(PublishReceipt<C>) + Send + Sync>;

/// Guaranteed publishing to topics and queues. Every publish through a
/// started publisher produces exactly one outcome.
pub struct PersistentMessagePublisher<C = ()> {
    core: PublisherCore,
    receipt_listener: Arc<Mutex<Option<ReceiptListener<C>>>>,
    ack_timeout: Duration,
    _context: PhantomData<fn(C)>,
}

impl<C: Send + 'static> PersistentMessagePublisher<C> {
    /// Starts the publisher. Fails unless the service is connected or reconnecting.
    pub fn start(&self) -> Result<()> {
        self.core.start()
    }

    pub fn lifecycle(&self) -> Lifecycle {
        self.core.lifecycle()
    }

    /// Receives the outcome of every `publish` and `publish_with_context`,
    /// once per message, on its own task.
    pub fn set_message_publish_receipt_listener<F>(&self, listener: F)
    where
        F: Fn(PublishReceipt<C>) + Send + Sync + 'static,
    {
        *locked(&self.receipt_listener) = Some(Arc::new(listener));
    }

    /// Listener for [`notify_when_ready`](Self::notify_when_ready).
    pub fn set_publisher_readiness_listener<F>(&self, listener: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.core.set_readiness_listener(Arc::new(listener));
    }

    /// Calls the readiness listener once the buffer has room again.
    pub fn notify_when_ready(&self) {
        self.core.notify_when_ready();
    }

    /// Whether a publish would be accepted right now.
    pub fn is_ready(&self) -> bool {
        self.core.is_ready()
    }

    /// Buffers the message; the receipt listener gets its outcome.
    pub async fn publish(
        &self,
        message: OutboundMessage,
        destination: impl Into<Destination>,
    ) -> Result<()> {
        self.publish_inner(message, destination.into(), None).await
    }

    /// Like `publish`; `context` comes back with the receipt.
    pub async fn publish_with_context(
        &self,
        message: OutboundMessage,
        destination: impl Into<Destination>,
        context: C,
    ) -> Result<()> {
        self.publish_inner(message, destination.into(), Some(context))
            .await
    }

    async fn publish_inner(
        &self,
        message: OutboundMessage,
        destination: Destination,
        context: Option<C>,
    ) -> Result<()> {
        let message = message.into_message(destination, DeliveryMode::Persistent);
        let receipt = self.core.inner().next_id();
        let inner = Arc::clone(self.core.inner());
        let rx = inner.receipts.register(receipt);

        let frame = ClientFrame::Publish {
            message: message.clone(),
            receipt: Some(receipt),
            publisher: Some(self.core.id()),
        };
        if let Err(e) = self.core.accept(frame).await {
            inner.receipts.cancel(&receipt);
            return Err(e);
        }

        let listener = Arc::clone(&self.receipt_listener);
        let table = Arc::clone(&inner.receipts);
        table.on_complete(receipt, rx, Some(self.ack_timeout), move |outcome| {
            if matches!(outcome, Err(Error::Timeout(_))) {
                inner.untrack_pending(receipt);
            }
            let receipt = PublishReceipt {
                message,
                user_context: context,
                error: outcome.err(),
                timestamp: Utc::now(),
            };
            let listener = locked(&listener).clone();
            match listener {
                Some(listener) => listener(receipt),
                None => debug!(
                    message_id = %receipt.message.message_id,
                    persisted = receipt.is_persisted(),
                    "publish receipt without listener"
                ),
            }
        });
        Ok(())
    }

    /// Publishes and waits for the broker to persist the message.
    pub async fn publish_await_acknowledgement(
        &self,
        message: OutboundMessage,
        destination: impl Into<Destination>,
        timeout: Duration,
    ) -> Result<()> {
        let message = message.into_message(destination.into(), DeliveryMode::Persistent);
        let inner = self.core.inner();
        let receipt = inner.next_id();
        let rx = inner.receipts.register(receipt);

        let frame = ClientFrame::Publish {
            message,
            receipt: Some(receipt),
            publisher: Some(self.core.id()),
        };
        if let Err(e) = self.core.accept(frame).await {
            inner.receipts.cancel(&receipt);
            return Err(e);
        }

        let outcome = inner.receipts.wait(receipt, rx, Some(timeout)).await;
        if matches!(outcome, Err(Error::Timeout(_))) {
            inner.untrack_pending(receipt);
        }
        outcome
    }

    /// Stops accepting messages and gives the buffer up to `grace` to drain.
    /// Whatever is left fails: persistent messages through their receipt,
    /// direct ones through the failure listener.
    pub async fn terminate(&self, grace: Duration) {
        self.core.terminate(grace).await;
    }
}
