//! Connection management.
//!
//! `MessagingService` owns the logical session with the broker. One task per
//! service drives the WebSocket: it writes frames queued by publishers and
//! receivers, and routes everything the broker sends to the waiting
//! correlation, receiver buffer or listener.
//!
//! When the connection drops, the task reconnects according to the
//! reconnection strategy, re-sends every subscription and queue binding and
//! republishes persistent messages still waiting for a receipt. If the
//! strategy gives up, the service becomes `Disconnected` for good, emits
//! `ServiceInterrupted` and fails everything pending with `Error::Interrupted`.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use backon::ConstantBackoff;
use futures_util::{Sink, SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{OnceCell, broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, info, trace, warn};
use tungstenite::protocol::Message as WsMessage;

use crate::broker::message::Message;
use crate::broker::queue::QueueSpec;
use crate::broker::topic::TopicSubscription;
use crate::client::browser::MessageQueueBrowserBuilder;
use crate::client::buffer::{BackPressure, InboundBuffer, Pushed};
use crate::client::correlation::CorrelationTable;
use crate::client::message::{DeliveryTag, InboundMessage, OutboundMessageBuilder};
use crate::client::metrics::{ApiMetrics, Metric};
use crate::client::publisher::{
    DirectMessagePublisherBuilder, FailedPublish, PersistentMessagePublisherBuilder,
};
use crate::client::receiver::{DirectMessageReceiverBuilder, PersistentMessageReceiverBuilder};
use crate::client::request_reply::{
    RequestReplyMessagePublisherBuilder, RequestReplyMessageReceiverBuilder,
};
use crate::client::retry::RetryStrategy;
use crate::config::{AuthScheme, PublisherSettings, ReceiverSettings, Settings};
use crate::transport::message::{ClientFrame, Credentials, ServerFrame};
use crate::utils::{Error, Result, locked};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Deadline for broker confirmations of subscribe, bind and browse requests.
const CONTROL_TIMEOUT: Duration = Duration::from_secs(10);
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Receiver id of the per-service reply inbox.
pub(crate) const REPLY_INBOX_RECEIVER: u64 = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceState {
    NotConnected,
    Connected,
    Reconnecting,
    /// Terminal: disconnected by the application or interrupted.
    Disconnected,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServiceEvent {
    ReconnectionAttempt { attempt: u32, cause: String },
    Reconnected,
    ServiceInterrupted { cause: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiInfo {
    pub name: &'static str,
    pub version: &'static str,
    pub vendor: &'static str,
}

impl fmt::Display for ApiInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} ({})", self.name, self.version, self.vendor)
    }
}

/// Broker answer to a control request.
#[derive(Debug)]
pub(crate) enum Reply {
    Done,
    Browsed(Vec<Message>),
}

pub(crate) type FailureListener = Arc<dyn Fn(FailedPublish) + Send + Sync>;
pub(crate) type ActivationListener = Arc<dyn Fn(bool) + Send + Sync>;

/// Deliveries of one flow that the application has not acknowledged yet.
#[derive(Debug, Default)]
pub(crate) struct Unsettled {
    generation: u64,
    deliveries: HashSet<u64>,
}

impl Unsettled {
    pub fn track(&mut self, generation: u64, delivery: u64) {
        if self.generation != generation {
            self.generation = generation;
            self.deliveries.clear();
        }
        self.deliveries.insert(delivery);
    }

    /// Removes the delivery; `false` if it was settled already or belongs to
    /// an earlier connection.
    pub fn settle(&mut self, tag: &DeliveryTag) -> bool {
        tag.generation == self.generation && self.deliveries.remove(&tag.delivery)
    }

    /// Puts back a delivery whose acknowledgment could not be sent.
    pub fn restore(&mut self, tag: &DeliveryTag) {
        if tag.generation == self.generation {
            self.deliveries.insert(tag.delivery);
        }
    }

    pub fn forget(&mut self) {
        self.deliveries.clear();
    }

    pub fn len(&self) -> usize {
        self.deliveries.len()
    }
}

pub(crate) struct FlowRoute {
    pub buffer: Arc<InboundBuffer<InboundMessage>>,
    pub unsettled: Arc<Mutex<Unsettled>>,
    pub activation: Option<ActivationListener>,
}

/// Everything needed to bind a flow again after a reconnect.
#[derive(Debug, Clone)]
pub(crate) struct BindSpec {
    pub queue: QueueSpec,
    pub subscriptions: Vec<String>,
    pub selector: Option<String>,
    pub window: usize,
    pub create_if_missing: bool,
    pub paused: bool,
}

#[derive(Debug)]
struct PendingPublish {
    message: Message,
    publisher: Option<u64>,
    /// Connection generation the message was last written on.
    generation: u64,
}

#[derive(Debug, Default)]
struct RestoreState {
    subscriptions: BTreeSet<(u64, String, Option<String>)>,
    binds: BTreeMap<u64, BindSpec>,
    pending: BTreeMap<u64, PendingPublish>,
    generation: u64,
}

#[derive(Debug, Clone)]
pub(crate) struct ServiceConfig {
    pub url: String,
    pub vpn: String,
    pub client_name: String,
    pub connection_retry: RetryStrategy,
    pub reconnection_retry: RetryStrategy,
    pub publisher: PublisherSettings,
    pub receiver: ReceiverSettings,
}

pub(crate) struct ServiceInner {
    pub config: ServiceConfig,
    credentials: Mutex<Credentials>,
    state: watch::Sender<ServiceState>,
    events: broadcast::Sender<ServiceEvent>,
    outbound: Mutex<Option<mpsc::UnboundedSender<ClientFrame>>>,
    shutdown: watch::Sender<bool>,
    next_id: AtomicU64,
    direct_routes: Mutex<HashMap<u64, Arc<InboundBuffer<InboundMessage>>>>,
    flow_routes: Mutex<HashMap<u64, FlowRoute>>,
    failure_listeners: Mutex<HashMap<u64, FailureListener>>,
    pub receipts: Arc<CorrelationTable<u64, ()>>,
    pub requests: Arc<CorrelationTable<u64, Reply>>,
    pub replies: Arc<CorrelationTable<String, InboundMessage>>,
    restore: Mutex<RestoreState>,
    reply_inbox: String,
    inbox: OnceCell<()>,
    pub metrics: ApiMetrics,
    session_task: Mutex<Option<JoinHandle<()>>>,
}

impl ServiceInner {
    pub fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    pub fn state(&self) -> ServiceState {
        *self.state.borrow()
    }

    pub fn state_receiver(&self) -> watch::Receiver<ServiceState> {
        self.state.subscribe()
    }

    fn set_state(&self, state: ServiceState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            debug!(?previous, ?state, "service state changed");
        }
    }

    fn emit(&self, event: ServiceEvent) {
        // no subscribers is fine
        let _ = self.events.send(event);
    }

    pub fn reply_inbox(&self) -> &str {
        &self.reply_inbox
    }

    /// Publishing and receiving are allowed while connected or reconnecting.
    pub fn ensure_usable(&self) -> Result<()> {
        match self.state() {
            ServiceState::Connected | ServiceState::Reconnecting => Ok(()),
            ServiceState::NotConnected => {
                Err(Error::IllegalState("service is not connected".to_string()))
            }
            ServiceState::Disconnected => {
                Err(Error::IllegalState("service is disconnected".to_string()))
            }
        }
    }

    /// Queues a frame for the session task.
    pub fn send(&self, frame: ClientFrame) -> Result<()> {
        self.ensure_usable()?;
        let outbound = locked(&self.outbound);
        let tx = outbound
            .as_ref()
            .ok_or_else(|| Error::IllegalState("service is not connected".to_string()))?;
        tx.send(frame)
            .map_err(|_| Error::IllegalState("session closed".to_string()))
    }

    /// Sends a control frame and waits for the broker's answer.
    pub async fn request<F>(&self, build: F) -> Result<Reply>
    where
        F: FnOnce(u64) -> ClientFrame,
    {
        let id = self.next_id();
        let rx = self.requests.register(id);
        if let Err(e) = self.send(build(id)) {
            self.requests.cancel(&id);
            return Err(e);
        }
        self.requests.wait(id, rx, Some(CONTROL_TIMEOUT)).await
    }

    pub async fn subscribe(
        &self,
        receiver: u64,
        subscription: &TopicSubscription,
        share: Option<String>,
    ) -> Result<()> {
        let expression = subscription.expression().to_string();
        let entry = (receiver, expression.clone(), share.clone());
        locked(&self.restore).subscriptions.insert(entry.clone());

        let outcome = self
            .request(|request| ClientFrame::Subscribe {
                receiver,
                subscription: expression,
                share,
                request,
            })
            .await;
        if outcome.is_err() {
            locked(&self.restore).subscriptions.remove(&entry);
        }
        outcome.map(|_| ())
    }

    pub async fn unsubscribe(
        &self,
        receiver: u64,
        expression: &str,
        share: Option<String>,
    ) -> Result<()> {
        locked(&self.restore).subscriptions.remove(&(
            receiver,
            expression.to_string(),
            share.clone(),
        ));
        self.request(|request| ClientFrame::Unsubscribe {
            receiver,
            subscription: expression.to_string(),
            share,
            request,
        })
        .await
        .map(|_| ())
    }

    /// Subscribes the reply inbox once per service.
    pub async fn ensure_reply_inbox(&self) -> Result<()> {
        self.inbox
            .get_or_try_init(|| async {
                let inbox = TopicSubscription::parse(&self.reply_inbox)?;
                self.subscribe(REPLY_INBOX_RECEIVER, &inbox, None).await
            })
            .await
            .map(|_| ())
    }

    pub async fn bind(&self, flow: u64, spec: BindSpec) -> Result<()> {
        locked(&self.restore).binds.insert(flow, spec.clone());
        let outcome = self
            .request(|request| ClientFrame::Bind {
                flow,
                queue: spec.queue,
                subscriptions: spec.subscriptions,
                selector: spec.selector,
                window: spec.window,
                create_if_missing: spec.create_if_missing,
                request,
            })
            .await;
        if outcome.is_err() {
            locked(&self.restore).binds.remove(&flow);
        }
        outcome.map(|_| ())
    }

    pub fn unbind(&self, flow: u64) -> Result<()> {
        locked(&self.restore).binds.remove(&flow);
        self.send(ClientFrame::Unbind { flow })
    }

    pub fn set_flow_paused(&self, flow: u64, paused: bool) -> Result<()> {
        if let Some(bind) = locked(&self.restore).binds.get_mut(&flow) {
            bind.paused = paused;
        }
        self.send(ClientFrame::Flow { flow, paused })
    }

    pub fn register_direct_route(&self, receiver: u64, buffer: Arc<InboundBuffer<InboundMessage>>) {
        locked(&self.direct_routes).insert(receiver, buffer);
    }

    pub fn remove_direct_route(&self, receiver: u64) {
        locked(&self.direct_routes).remove(&receiver);
    }

    pub fn register_flow_route(&self, flow: u64, route: FlowRoute) {
        locked(&self.flow_routes).insert(flow, route);
    }

    pub fn remove_flow_route(&self, flow: u64) {
        locked(&self.flow_routes).remove(&flow);
    }

    pub fn register_failure_listener(&self, publisher: u64, listener: FailureListener) {
        locked(&self.failure_listeners).insert(publisher, listener);
    }

    pub fn remove_failure_listener(&self, publisher: u64) {
        locked(&self.failure_listeners).remove(&publisher);
    }

    /// Remembers a persistent message until its receipt arrives.
    pub fn track_pending(&self, receipt: u64, message: Message, publisher: Option<u64>) {
        locked(&self.restore).pending.insert(
            receipt,
            PendingPublish {
                message,
                publisher,
                generation: 0,
            },
        );
    }

    pub fn untrack_pending(&self, receipt: u64) {
        locked(&self.restore).pending.remove(&receipt);
    }

    /// Whether a persistent publish still has to be written on the current connection.
    fn claim_pending(&self, receipt: u64) -> bool {
        let mut restore = locked(&self.restore);
        let generation = restore.generation;
        match restore.pending.get_mut(&receipt) {
            Some(pending) if pending.generation != generation => {
                pending.generation = generation;
                true
            }
            _ => false,
        }
    }

    async fn forward<S>(&self, sink: &mut S, frame: ClientFrame) -> Result<()>
    where
        S: Sink<WsMessage, Error = tungstenite::Error> + Unpin,
    {
        if let ClientFrame::Publish {
            receipt: Some(receipt),
            ..
        } = &frame
        {
            if !self.claim_pending(*receipt) {
                trace!(receipt, "persistent publish already written or settled");
                return Ok(());
            }
        }
        write_frame(sink, &frame).await
    }

    fn route(&self, frame: ServerFrame) {
        match frame {
            ServerFrame::Connected { .. } => {}
            ServerFrame::Ok { request } => {
                self.requests.complete(&request, Ok(Reply::Done));
            }
            ServerFrame::Error {
                request: Some(request),
                kind,
                message,
            } => {
                self.requests.complete(&request, Err(kind.into_error(message)));
            }
            ServerFrame::Error {
                request: None,
                message,
                ..
            } => warn!(%message, "broker reported an error"),
            ServerFrame::Deliver { receivers, message } => self.deliver_direct(receivers, message),
            ServerFrame::FlowDeliver {
                flow,
                delivery,
                message,
            } => {
                let route = locked(&self.flow_routes)
                    .get(&flow)
                    .map(|route| (Arc::clone(&route.buffer), Arc::clone(&route.unsettled)));
                match route {
                    Some((buffer, unsettled)) => {
                        let generation = locked(&self.restore).generation;
                        locked(&unsettled).track(generation, delivery);
                        self.metrics.increment(Metric::PersistentMessagesReceived);
                        let tag = DeliveryTag {
                            flow,
                            delivery,
                            generation,
                        };
                        buffer.push(InboundMessage::guaranteed(message, tag));
                    }
                    None => debug!(flow, delivery, "delivery for unknown flow"),
                }
            }
            ServerFrame::FlowState { flow, active } => {
                let listener = locked(&self.flow_routes)
                    .get(&flow)
                    .and_then(|route| route.activation.clone());
                debug!(flow, active, "flow state");
                if let Some(listener) = listener {
                    tokio::spawn(async move { listener(active) });
                }
            }
            ServerFrame::PublishReceipt { receipt, error } => {
                self.untrack_pending(receipt);
                let outcome = match error {
                    None => {
                        self.metrics.increment(Metric::PublishReceiptsOk);
                        Ok(())
                    }
                    Some(reason) => {
                        self.metrics.increment(Metric::PublishReceiptsFailed);
                        Err(Error::PublishRejected(reason))
                    }
                };
                self.receipts.complete(&receipt, outcome);
            }
            ServerFrame::Rejected {
                message_id,
                publisher,
                error,
            } => {
                let listener = publisher
                    .and_then(|id| locked(&self.failure_listeners).get(&id).cloned());
                match listener {
                    Some(listener) => {
                        let failed = FailedPublish { message_id, error };
                        tokio::spawn(async move { listener(failed) });
                    }
                    None => warn!(%message_id, %error, "direct message rejected"),
                }
            }
            ServerFrame::Browsed { request, messages } => {
                self.requests
                    .complete(&request, Ok(Reply::Browsed(messages)));
            }
        }
    }

    fn deliver_direct(&self, receivers: Vec<u64>, message: Message) {
        for receiver in receivers {
            if receiver == REPLY_INBOX_RECEIVER {
                let Some(correlation_id) = message.correlation_id.clone() else {
                    debug!(id = %message.message_id, "reply without correlation id");
                    continue;
                };
                let reply = InboundMessage::direct(message.clone());
                if self.replies.complete(&correlation_id, Ok(reply)) {
                    self.metrics.increment(Metric::RepliesReceived);
                } else {
                    debug!(%correlation_id, "late reply discarded");
                }
                continue;
            }

            let buffer = locked(&self.direct_routes).get(&receiver).cloned();
            let Some(buffer) = buffer else {
                trace!(receiver, "message for removed receiver");
                continue;
            };
            self.metrics.increment(Metric::DirectMessagesReceived);
            match buffer.push(InboundMessage::direct(message.clone())) {
                Pushed::Buffered => {}
                Pushed::Evicted | Pushed::Dropped => {
                    self.metrics.increment(Metric::ReceivedMessagesDropped)
                }
            }
        }
    }

    /// Frames that rebuild this session's broker-side state on a new connection.
    fn restore_frames(&self) -> Vec<ClientFrame> {
        let mut restore = locked(&self.restore);
        restore.generation += 1;
        let generation = restore.generation;

        let mut frames = Vec::new();
        for (receiver, subscription, share) in &restore.subscriptions {
            frames.push(ClientFrame::Subscribe {
                receiver: *receiver,
                subscription: subscription.clone(),
                share: share.clone(),
                request: self.next_id(),
            });
        }
        for (flow, bind) in &restore.binds {
            frames.push(ClientFrame::Bind {
                flow: *flow,
                queue: bind.queue.clone(),
                subscriptions: bind.subscriptions.clone(),
                selector: bind.selector.clone(),
                window: bind.window,
                create_if_missing: bind.create_if_missing,
                request: self.next_id(),
            });
            if bind.paused {
                frames.push(ClientFrame::Flow {
                    flow: *flow,
                    paused: true,
                });
            }
        }
        for (receipt, pending) in restore.pending.iter_mut() {
            pending.generation = generation;
            frames.push(ClientFrame::Publish {
                message: pending.message.clone(),
                receipt: Some(*receipt),
                publisher: pending.publisher,
            });
        }
        frames
    }

    /// Ends the service for good and wakes everything waiting on it.
    fn terminate(&self, reason: &str) {
        self.set_state(ServiceState::Disconnected);
        locked(&self.outbound).take();

        let failed = self.receipts.fail_all(reason)
            + self.requests.fail_all(reason)
            + self.replies.fail_all(reason);
        locked(&self.restore).pending.clear();

        for buffer in locked(&self.direct_routes).values() {
            buffer.close();
        }
        for route in locked(&self.flow_routes).values() {
            route.buffer.close();
        }
        info!(reason, failed, "service terminated");
    }
}

async fn write_frame<S>(sink: &mut S, frame: &ClientFrame) -> Result<()>
where
    S: Sink<WsMessage, Error = tungstenite::Error> + Unpin,
{
    let text = serde_json::to_string(frame)?;
    sink.send(WsMessage::text(text)).await?;
    Ok(())
}

/// Opens a WebSocket and performs the `connect` handshake.
async fn open_session(inner: &ServiceInner) -> Result<WsStream> {
    let (mut ws, _) = connect_async(inner.config.url.as_str())
        .await
        .map_err(|e| Error::Connection(format!("{}: {e}", inner.config.url)))?;

    let credentials = locked(&inner.credentials).clone();
    let hello = ClientFrame::Connect {
        client_name: inner.config.client_name.clone(),
        vpn: inner.config.vpn.clone(),
        credentials,
    };
    write_frame(&mut ws, &hello).await?;

    let reply = tokio::time::timeout(HANDSHAKE_TIMEOUT, ws.next())
        .await
        .map_err(|_| Error::Connection("handshake timed out".to_string()))?;
    match reply {
        Some(Ok(WsMessage::Text(text))) => match serde_json::from_str::<ServerFrame>(text.as_str())? {
            ServerFrame::Connected { session_id } => {
                debug!(%session_id, "session established");
                Ok(ws)
            }
            ServerFrame::Error { kind, message, .. } => Err(kind.into_error(message)),
            other => Err(Error::Connection(format!(
                "unexpected handshake frame {other:?}"
            ))),
        },
        Some(Ok(other)) => Err(Error::Connection(format!(
            "unexpected handshake message {other:?}"
        ))),
        Some(Err(e)) => Err(e.into()),
        None => Err(Error::Connection("closed during handshake".to_string())),
    }
}

/// Initial connect, retried per the connection strategy.
async fn establish(inner: &ServiceInner) -> Result<WsStream> {
    let mut backoff = inner.config.connection_retry.backoff();
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        inner.metrics.increment(Metric::ConnectionAttempts);
        match open_session(inner).await {
            Ok(ws) => return Ok(ws),
            Err(e) if !e.is_retryable() => return Err(e),
            Err(e) => match backoff.next() {
                Some(delay) => {
                    warn!(attempt, error = %e, ?delay, "connect failed, retrying");
                    tokio::time::sleep(delay).await;
                }
                None => return Err(e),
            },
        }
    }
}

enum SessionEnd {
    Closed,
    Lost(String),
}

async fn drive(
    inner: &ServiceInner,
    ws: WsStream,
    out_rx: &mut mpsc::UnboundedReceiver<ClientFrame>,
    shutdown: &mut watch::Receiver<bool>,
) -> SessionEnd {
    let (mut sink, mut stream) = ws.split();
    if *shutdown.borrow_and_update() {
        close_session(inner, &mut sink, out_rx).await;
        return SessionEnd::Closed;
    }

    loop {
        tokio::select! {
            outgoing = out_rx.recv() => {
                let Some(frame) = outgoing else {
                    let _ = sink.close().await;
                    return SessionEnd::Closed;
                };
                if let Err(e) = inner.forward(&mut sink, frame).await {
                    return SessionEnd::Lost(e.to_string());
                }
            }
            incoming = stream.next() => match incoming {
                Some(Ok(WsMessage::Text(text))) => {
                    match serde_json::from_str::<ServerFrame>(text.as_str()) {
                        Ok(frame) => inner.route(frame),
                        Err(e) => warn!(error = %e, "unreadable broker frame"),
                    }
                }
                Some(Ok(WsMessage::Close(_))) | None => {
                    return SessionEnd::Lost("connection closed by broker".to_string());
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => return SessionEnd::Lost(e.to_string()),
            },
            _ = shutdown.changed() => {
                close_session(inner, &mut sink, out_rx).await;
                return SessionEnd::Closed;
            }
        }
    }
}

/// Writes whatever is still queued, then says goodbye.
async fn close_session<S>(
    inner: &ServiceInner,
    sink: &mut S,
    out_rx: &mut mpsc::UnboundedReceiver<ClientFrame>,
) where
    S: Sink<WsMessage, Error = tungstenite::Error> + Unpin,
{
    while let Ok(frame) = out_rx.try_recv() {
        if inner.forward(sink, frame).await.is_err() {
            return;
        }
    }
    let _ = write_frame(sink, &ClientFrame::Disconnect).await;
    let _ = sink.close().await;
}

/// Next reconnection attempt, or `None` once the strategy gives up.
async fn reconnect(
    inner: &ServiceInner,
    backoff: &mut ConstantBackoff,
    attempt: &mut u32,
    cause: &str,
    shutdown: &mut watch::Receiver<bool>,
) -> Option<WsStream> {
    loop {
        let delay = backoff.next()?;
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = shutdown.changed() => return None,
        }

        *attempt += 1;
        inner.metrics.increment(Metric::ReconnectionAttempts);
        inner.emit(ServiceEvent::ReconnectionAttempt {
            attempt: *attempt,
            cause: cause.to_string(),
        });
        match open_session(inner).await {
            Ok(ws) => return Some(ws),
            Err(e) if !e.is_retryable() => {
                warn!(attempt = *attempt, error = %e, "reconnection refused");
                return None;
            }
            Err(e) => debug!(attempt = *attempt, error = %e, "reconnection attempt failed"),
        }
    }
}

async fn session_loop(
    inner: Arc<ServiceInner>,
    mut ws: WsStream,
    mut out_rx: mpsc::UnboundedReceiver<ClientFrame>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let mut cause = match drive(&inner, ws, &mut out_rx, &mut shutdown).await {
            SessionEnd::Closed => return,
            SessionEnd::Lost(cause) => cause,
        };
        if *shutdown.borrow() {
            return;
        }

        warn!(%cause, "connection lost");
        inner.set_state(ServiceState::Reconnecting);
        let mut backoff = inner.config.reconnection_retry.backoff();
        let mut attempt = 0u32;

        ws = loop {
            let Some(mut candidate) =
                reconnect(&inner, &mut backoff, &mut attempt, &cause, &mut shutdown).await
            else {
                if !*shutdown.borrow() {
                    let reason = format!("reconnection failed after {attempt} attempts: {cause}");
                    inner.terminate(&reason);
                    inner.emit(ServiceEvent::ServiceInterrupted { cause: reason });
                }
                return;
            };

            for route in locked(&inner.flow_routes).values() {
                // the broker redelivers whatever was not acknowledged
                route.buffer.clear();
                locked(&route.unsettled).forget();
            }
            let frames = inner.restore_frames();
            let restored = frames.len();
            let mut written = Ok(());
            for frame in &frames {
                written = write_frame(&mut candidate, frame).await;
                if written.is_err() {
                    break;
                }
            }
            match written {
                Ok(()) => {
                    info!(attempt, restored, "reconnected");
                    break candidate;
                }
                Err(e) => cause = e.to_string(),
            }
        };

        inner.set_state(ServiceState::Connected);
        inner.metrics.increment(Metric::Reconnections);
        inner.emit(ServiceEvent::Reconnected);
    }
}

/// Handle to a messaging service. Clones share the same session.
#[derive(Clone)]
pub struct MessagingService {
    inner: Arc<ServiceInner>,
}

impl fmt::Debug for MessagingService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessagingService")
            .field("url", &self.inner.config.url)
            .field("client_name", &self.inner.config.client_name)
            .field("state", &self.inner.state())
            .finish()
    }
}

impl MessagingService {
    /// Starts configuring a service from the built-in defaults.
    pub fn builder() -> MessagingServiceBuilder {
        MessagingServiceBuilder::default()
    }

    /// Builds a service from loaded configuration.
    /// Fails when OAuth2 is selected without an access token.
    pub fn from_settings(settings: &Settings) -> Result<Self> {
        Ok(MessagingServiceBuilder::from_settings(settings)?.build())
    }

    /// Opens the session, retrying per the connection strategy.
    ///
    /// Only a service that was never connected can connect. Authentication
    /// failures are returned at once; after `disconnect` or an interruption a
    /// new service has to be built.
    pub async fn connect(&self) -> Result<()> {
        let current = self.inner.state();
        if current != ServiceState::NotConnected {
            return Err(Error::IllegalState(format!(
                "cannot connect a service in state {current:?}"
            )));
        }

        let ws = establish(&self.inner).await?;
        let (tx, rx) = mpsc::unbounded_channel();
        *locked(&self.inner.outbound) = Some(tx);
        self.inner.set_state(ServiceState::Connected);
        {
            let mut restore = locked(&self.inner.restore);
            restore.generation += 1;
        }
        let shutdown = self.inner.shutdown.subscribe();
        let task = tokio::spawn(session_loop(Arc::clone(&self.inner), ws, rx, shutdown));
        *locked(&self.inner.session_task) = Some(task);

        info!(
            url = %self.inner.config.url,
            client = %self.inner.config.client_name,
            "connected"
        );
        Ok(())
    }

    /// Flushes queued frames, closes the session and fails anything still pending.
    pub async fn disconnect(&self) -> Result<()> {
        match self.inner.state() {
            ServiceState::NotConnected | ServiceState::Disconnected => return Ok(()),
            ServiceState::Connected | ServiceState::Reconnecting => {}
        }

        self.inner.shutdown.send_replace(true);
        let task = locked(&self.inner.session_task).take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!(error = %e, "session task failed");
            }
        }
        self.inner.terminate("service disconnected");
        Ok(())
    }

    /// `true` only while the session is up; `false` while reconnecting.
    pub fn is_connected(&self) -> bool {
        self.inner.state() == ServiceState::Connected
    }

    /// Current connection state.
    pub fn state(&self) -> ServiceState {
        self.inner.state()
    }

    /// Subscribes to reconnection and interruption events.
    /// Events emitted before the call are not replayed.
    pub fn events(&self) -> broadcast::Receiver<ServiceEvent> {
        self.inner.events.subscribe()
    }

    fn spawn_listener<F>(&self, handler: F)
    where
        F: Fn(&ServiceEvent) + Send + 'static,
    {
        let mut events = self.events();
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) => {
                        handler(&event);
                        if matches!(event, ServiceEvent::ServiceInterrupted { .. }) {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        warn!(missed, "service event listener lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
    }

    /// Calls `listener` after every successful reconnection.
    pub fn add_reconnection_listener<F>(&self, listener: F)
    where
        F: Fn() + Send + 'static,
    {
        self.spawn_listener(move |event| {
            if matches!(event, ServiceEvent::Reconnected) {
                listener();
            }
        });
    }

    /// Calls `listener` with the attempt number and the cause of the drop
    /// before each reconnection attempt.
    pub fn add_reconnection_attempt_listener<F>(&self, listener: F)
    where
        F: Fn(u32, &str) + Send + 'static,
    {
        self.spawn_listener(move |event| {
            if let ServiceEvent::ReconnectionAttempt { attempt, cause } = event {
                listener(*attempt, cause);
            }
        });
    }

    /// Calls `listener` once if the service is lost for good.
    pub fn add_service_interruption_listener<F>(&self, listener: F)
    where
        F: Fn(&str) + Send + 'static,
    {
        self.spawn_listener(move |event| {
            if let ServiceEvent::ServiceInterrupted { cause } = event {
                listener(cause);
            }
        });
    }

    /// Replaces the OAuth2 token used from the next reconnection on.
    pub fn update_access_token(&self, token: impl Into<String>) -> Result<()> {
        let mut credentials = locked(&self.inner.credentials);
        match &mut *credentials {
            Credentials::OAuth2 { access_token } => {
                *access_token = token.into();
                Ok(())
            }
            Credentials::Basic { .. } => Err(Error::IllegalState(
                "service does not use OAuth2 authentication".to_string(),
            )),
        }
    }

    /// Name, version and vendor of this client library.
    pub fn api_info(&self) -> ApiInfo {
        ApiInfo {
            name: env!("CARGO_PKG_NAME"),
            version: env!("CARGO_PKG_VERSION"),
            vendor: "relaymq",
        }
    }

    /// Counters shared by everything built from this service.
    pub fn metrics(&self) -> &ApiMetrics {
        &self.inner.metrics
    }

    pub fn client_name(&self) -> &str {
        &self.inner.config.client_name
    }

    /// Builder for outbound messages with no defaults set.
    pub fn message_builder(&self) -> OutboundMessageBuilder {
        OutboundMessageBuilder::new()
    }

    /// Publisher for best-effort messages. Back pressure starts from the
    /// `publisher` settings.
    pub fn create_direct_message_publisher_builder(&self) -> DirectMessagePublisherBuilder {
        DirectMessagePublisherBuilder::new(
            Arc::clone(&self.inner),
            BackPressure::from_settings(&self.inner.config.publisher),
        )
    }

    /// Publisher for guaranteed messages with publish receipts.
    pub fn create_persistent_message_publisher_builder(&self) -> PersistentMessagePublisherBuilder {
        PersistentMessagePublisherBuilder::new(
            Arc::clone(&self.inner),
            BackPressure::from_settings(&self.inner.config.publisher),
        )
    }

    /// Receiver for topic subscriptions.
    pub fn create_direct_message_receiver_builder(&self) -> DirectMessageReceiverBuilder {
        DirectMessageReceiverBuilder::new(Arc::clone(&self.inner))
    }

    /// Receiver bound to a queue.
    pub fn create_persistent_message_receiver_builder(&self) -> PersistentMessageReceiverBuilder {
        PersistentMessageReceiverBuilder::new(Arc::clone(&self.inner))
    }

    /// Reads a queue without consuming it.
    pub fn create_message_queue_browser_builder(&self) -> MessageQueueBrowserBuilder {
        MessageQueueBrowserBuilder::new(Arc::clone(&self.inner))
    }

    /// Sends requests and waits for their replies.
    pub fn create_request_reply_message_publisher_builder(
        &self,
    ) -> RequestReplyMessagePublisherBuilder {
        RequestReplyMessagePublisherBuilder::new(Arc::clone(&self.inner))
    }

    /// Receives requests and answers them through a [`Replier`](crate::client::Replier).
    pub fn create_request_reply_message_receiver_builder(
        &self,
    ) -> RequestReplyMessageReceiverBuilder {
        RequestReplyMessageReceiverBuilder::new(Arc::clone(&self.inner))
    }
}

#[derive(Debug, Clone)]
pub struct MessagingServiceBuilder {
    host: String,
    port: u16,
    vpn: String,
    client_name: Option<String>,
    credentials: Credentials,
    tls: bool,
    connection_retry: RetryStrategy,
    reconnection_retry: RetryStrategy,
    publisher: PublisherSettings,
    receiver: ReceiverSettings,
}

impl Default for MessagingServiceBuilder {
    fn default() -> Self {
        let settings = Settings::default();
        let interval = Duration::from_millis(settings.retry.retry_interval_ms);
        Self {
            host: settings.service.host,
            port: settings.service.port,
            vpn: settings.service.vpn_name,
            client_name: None,
            credentials: Credentials::Basic {
                username: settings.authentication.username,
                password: settings.authentication.password,
            },
            tls: settings.tls.enabled,
            connection_retry: RetryStrategy::from_count(settings.retry.connection_retries, interval),
            reconnection_retry: RetryStrategy::from_count(
                settings.retry.reconnection_retries,
                interval,
            ),
            publisher: settings.publisher,
            receiver: settings.receiver,
        }
    }
}

impl MessagingServiceBuilder {
    /// Seeds every option from `settings`.
    /// Fails when OAuth2 is selected without an access token.
    pub fn from_settings(settings: &Settings) -> Result<Self> {
        let auth = &settings.authentication;
        let credentials = match auth.scheme {
            AuthScheme::Basic => Credentials::Basic {
                username: auth.username.clone(),
                password: auth.password.clone(),
            },
            AuthScheme::OAuth2 => Credentials::OAuth2 {
                access_token: auth.access_token.clone().ok_or_else(|| {
                    Error::Config("authentication.access_token is required for oauth2".into())
                })?,
            },
        };
        let interval = Duration::from_millis(settings.retry.retry_interval_ms);

        Ok(Self {
            host: settings.service.host.clone(),
            port: settings.service.port,
            vpn: settings.service.vpn_name.clone(),
            client_name: settings.service.client_name.clone(),
            credentials,
            tls: settings.tls.enabled,
            connection_retry: RetryStrategy::from_count(settings.retry.connection_retries, interval),
            reconnection_retry: RetryStrategy::from_count(
                settings.retry.reconnection_retries,
                interval,
            ),
            publisher: settings.publisher.clone(),
            receiver: settings.receiver.clone(),
        })
    }

    /// Broker host name or address.
    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    /// Broker WebSocket port.
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Message VPN sent in the `connect` handshake.
    pub fn with_vpn_name(mut self, vpn: impl Into<String>) -> Self {
        self.vpn = vpn.into();
        self
    }

    /// Name the broker reports for this client.
    /// A random `relaymq-<uuid>` name is used when unset.
    pub fn with_client_name(mut self, name: impl Into<String>) -> Self {
        self.client_name = Some(name.into());
        self
    }

    /// Credentials presented on every connect and reconnect.
    pub fn with_authentication_strategy(mut self, credentials: Credentials) -> Self {
        self.credentials = credentials;
        self
    }

    /// Username and password authentication.
    pub fn with_basic_authentication(
        self,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        self.with_authentication_strategy(Credentials::Basic {
            username: username.into(),
            password: password.into(),
        })
    }

    /// Bearer token authentication.
    /// The token can be replaced later with
    /// [`MessagingService::update_access_token`].
    pub fn with_oauth2_authentication(self, access_token: impl Into<String>) -> Self {
        self.with_authentication_strategy(Credentials::OAuth2 {
            access_token: access_token.into(),
        })
    }

    /// Connects over `wss://`. Needs the `tls` cargo feature at build time.
    pub fn with_tls(mut self, enabled: bool) -> Self {
        self.tls = enabled;
        self
    }

    /// Retry policy for the initial connect.
    pub fn with_connection_retry_strategy(mut self, strategy: RetryStrategy) -> Self {
        self.connection_retry = strategy;
        self
    }

    /// Retry policy after an established session drops.
    /// When it gives up the service is interrupted for good.
    pub fn with_reconnection_retry_strategy(mut self, strategy: RetryStrategy) -> Self {
        self.reconnection_retry = strategy;
        self
    }

    /// Default back pressure and receipt timeout of publishers.
    pub fn with_publisher_settings(mut self, settings: PublisherSettings) -> Self {
        self.publisher = settings;
        self
    }

    /// Default buffer, window and reply timeout of receivers.
    pub fn with_receiver_settings(mut self, settings: ReceiverSettings) -> Self {
        self.receiver = settings;
        self
    }

    /// WebSocket endpoint the service will connect to.
    pub fn url(&self) -> String {
        let scheme = if self.tls { "wss" } else { "ws" };
        format!("{scheme}://{}:{}", self.host, self.port)
    }

    /// Creates the service. Nothing is connected until [`MessagingService::connect`].
    pub fn build(self) -> MessagingService {
        let url = self.url();
        let client_name = self
            .client_name
            .unwrap_or_else(|| format!("relaymq-{}", uuid::Uuid::new_v4()));
        let (state, _) = watch::channel(ServiceState::NotConnected);
        let (events, _) = broadcast::channel(64);
        let (shutdown, _) = watch::channel(false);

        let inner = ServiceInner {
            config: ServiceConfig {
                url,
                vpn: self.vpn,
                client_name,
                connection_retry: self.connection_retry,
                reconnection_retry: self.reconnection_retry,
                publisher: self.publisher,
                receiver: self.receiver,
            },
            credentials: Mutex::new(self.credentials),
            state,
            events,
            outbound: Mutex::new(None),
            shutdown,
            next_id: AtomicU64::new(REPLY_INBOX_RECEIVER + 1),
            direct_routes: Mutex::new(HashMap::new()),
            flow_routes: Mutex::new(HashMap::new()),
            failure_listeners: Mutex::new(HashMap::new()),
            receipts: Arc::new(CorrelationTable::new()),
            requests: Arc::new(CorrelationTable::new()),
            replies: Arc::new(CorrelationTable::new()),
            restore: Mutex::new(RestoreState::default()),
            reply_inbox: format!("_inbox/{}", uuid::Uuid::new_v4()),
            inbox: OnceCell::new(),
            metrics: ApiMetrics::new(),
            session_task: Mutex::new(None),
        };

        MessagingService {
            inner: Arc::new(inner),
        }
    }
}
