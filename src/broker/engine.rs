//! Broker engine
//!
//! In-memory routing core of the reference broker:
//! - sessions and their authentication state
//! - direct topic subscriptions, including shared ones
//! - queues for guaranteed messages, their flows and acknowledgments
//! - a maintenance loop that redelivers messages whose ACK never came
//!
//! The API is synchronous and meant to sit behind `Arc<Mutex<Broker>>`.
//! Frames for clients are pushed into each session's unbounded channel, so the
//! lock is never held across network I/O.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::Utc;
use jsonwebtoken::{DecodingKey, EncodingKey, Header, Validation, decode, encode};
use tracing::{debug, error, info, warn};

use crate::broker::message::{DeliveryMode, Destination, Message};
use crate::broker::queue::{Consumer, FlowKey, MessageQueue, QueueSpec};
use crate::broker::selector::Selector;
use crate::broker::session::Session;
use crate::broker::topic::{SubscriberId, SubscriptionTable, TopicSubscription, validate_topic};
use crate::config::BrokerSettings;
use crate::persistence::Persistence;
use crate::transport::message::{Claims, Credentials, ServerFrame};
use crate::utils::{Error, Result, locked};

pub type SharedBroker = Arc<Mutex<Broker>>;

/// Locks the broker, recovering the guard if a previous holder panicked.
pub fn lock(broker: &Mutex<Broker>) -> MutexGuard<'_, Broker> {
    locked(broker)
}

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

#[derive(Debug)]
pub struct Broker {
    sessions: HashMap<String, Session>,
    subscriptions: SubscriptionTable,
    queues: HashMap<String, MessageQueue>,
    flows: HashMap<FlowKey, String>,
    persistence: Option<Persistence>,
    settings: BrokerSettings,
}

impl Default for Broker {
    fn default() -> Self {
        Self::new(BrokerSettings::default())
    }
}

impl Broker {
    /// How often the maintenance loop checks for overdue acknowledgments.
    const MAINTENANCE_INTERVAL: Duration = Duration::from_millis(1000);

    /// A broker whose durable queues only live in memory.
    pub fn new(settings: BrokerSettings) -> Self {
        Self {
            sessions: HashMap::new(),
            subscriptions: SubscriptionTable::new(),
            queues: HashMap::new(),
            flows: HashMap::new(),
            persistence: None,
            settings,
        }
    }

    /// A broker backed by a spool, with durable queues restored from it.
    pub fn with_persistence(settings: BrokerSettings, persistence: Persistence) -> Result<Self> {
        let mut broker = Self::new(settings);

        for stored in persistence.load_queues()? {
            let name = stored.spec.name.clone();
            let mut queue =
                MessageQueue::new(stored.spec, None, broker.settings.max_messages_per_queue);
            for expression in &stored.subscriptions {
                match TopicSubscription::parse(expression) {
                    Ok(sub) => {
                        queue.add_subscription(sub);
                    }
                    Err(e) => warn!(queue = %name, error = %e, "dropping stored subscription"),
                }
            }
            let messages = persistence.load_messages(&name)?;
            let restored = messages.len();
            for message in messages {
                if let Err(e) = queue.enqueue(message) {
                    warn!(queue = %name, error = %e, "spooled message not restored");
                }
            }
            info!(queue = %name, restored, "restored durable queue");
            broker.queues.insert(name, queue);
        }

        broker.persistence = Some(persistence);
        Ok(broker)
    }

    /// Opens the spool when `spool_path` is configured.
    pub fn from_settings(settings: BrokerSettings) -> Result<Self> {
        match settings.spool_path.clone() {
            Some(path) => {
                let ttl = i64::try_from(settings.message_ttl_secs).ok();
                let persistence = Persistence::open(&path, ttl)?;
                info!(path = %path, "opened message spool");
                Self::with_persistence(settings, persistence)
            }
            None => Ok(Self::new(settings)),
        }
    }

    pub fn settings(&self) -> &BrokerSettings {
        &self.settings
    }

    // ---- sessions ------------------------------------------------------

    pub fn register_session(&mut self, session: Session) -> Result<()> {
        if self.sessions.len() >= self.settings.max_connections {
            return Err(Error::Connection(format!(
                "connection limit of {} reached",
                self.settings.max_connections
            )));
        }
        debug!(session = %session.id, "session registered");
        self.sessions.insert(session.id.clone(), session);
        Ok(())
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_authenticated(&self, session_id: &str) -> bool {
        self.sessions
            .get(session_id)
            .is_some_and(|s| s.authenticated)
    }

    /// Checks credentials and returns the authenticated principal.
    pub fn authenticate(&self, credentials: &Credentials) -> Result<String> {
        match credentials {
            Credentials::Basic { username, password } => match self.settings.users.get(username)
            {
                Some(expected) if expected == password => Ok(username.clone()),
                _ => Err(Error::Authentication("invalid credentials".to_string())),
            },
            Credentials::OAuth2 { access_token } => decode::<Claims>(
                access_token,
                &DecodingKey::from_secret(self.settings.jwt_secret.as_bytes()),
                &Validation::default(),
            )
            .map(|data| data.claims.sub)
            .map_err(|e| Error::Authentication(format!("invalid access token: {e}"))),
        }
    }

    /// Signs an access token accepted by [`Broker::authenticate`].
    pub fn issue_token(&self, subject: &str, valid_for: chrono::Duration) -> Result<String> {
        let exp = (Utc::now() + valid_for).timestamp();
        let claims = Claims {
            sub: subject.to_string(),
            exp: usize::try_from(exp).unwrap_or(0),
        };
        encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(self.settings.jwt_secret.as_bytes()),
        )
        .map_err(|e| Error::Authentication(format!("cannot sign token: {e}")))
    }

    /// Handles the `connect` frame of a registered session.
    pub fn connect(
        &mut self,
        session_id: &str,
        client_name: &str,
        vpn: &str,
        credentials: &Credentials,
    ) -> Result<()> {
        let principal = self.authenticate(credentials)?;
        let session = self
            .sessions
            .get_mut(session_id)
            .ok_or_else(|| Error::IllegalState(format!("unknown session {session_id}")))?;
        session.authenticated = true;
        session.client_name = Some(client_name.to_string());
        session.principal = Some(principal.clone());
        info!(session = %session_id, client = client_name, vpn, principal = %principal, "client connected");
        Ok(())
    }

    /// Forgets a session: its subscriptions, its flows and its temporary queues.
    pub fn cleanup_session(&mut self, session_id: &str) {
        if self.sessions.remove(session_id).is_none() {
            return;
        }
        self.subscriptions.remove_session(session_id);

        let flows: Vec<FlowKey> = self
            .flows
            .keys()
            .filter(|k| k.session == session_id)
            .cloned()
            .collect();
        let mut touched = Vec::new();
        for key in flows {
            touched.extend(self.release_flow(&key));
        }

        let temporary: Vec<String> = self
            .queues
            .values()
            .filter(|q| q.owner.as_deref() == Some(session_id))
            .map(|q| q.name().to_string())
            .collect();
        for name in temporary {
            self.queues.remove(&name);
            self.flows.retain(|_, queue| queue != &name);
            debug!(queue = %name, "deleted temporary queue");
        }
        for name in touched {
            self.dispatch_queue(&name);
        }

        info!(session = %session_id, "cleaned up session");
    }

    pub fn send_to(&self, session_id: &str, frame: ServerFrame) {
        match self.sessions.get(session_id) {
            Some(session) => {
                session.send(frame);
            }
            None => debug!(session = %session_id, "no session to send to"),
        }
    }

    // ---- direct messaging ----------------------------------------------

    pub fn subscribe(
        &mut self,
        session_id: &str,
        receiver: u64,
        expression: &str,
        share: Option<String>,
    ) -> Result<()> {
        let filter = TopicSubscription::parse(expression)?;
        self.subscriptions
            .subscribe(filter, share, SubscriberId::new(session_id, receiver));
        debug!(session = %session_id, receiver, expression, "subscribed");
        Ok(())
    }

    pub fn unsubscribe(
        &mut self,
        session_id: &str,
        receiver: u64,
        expression: &str,
        share: Option<&str>,
    ) {
        self.subscriptions
            .unsubscribe(expression, share, &SubscriberId::new(session_id, receiver));
        debug!(session = %session_id, receiver, expression, "unsubscribed");
    }

    pub fn has_subscription(&self, session_id: &str, receiver: u64, expression: &str) -> bool {
        self.subscriptions
            .contains(expression, &SubscriberId::new(session_id, receiver))
    }

    /// Routes a message published by `session_id`.
    ///
    /// Topic messages go to every matching direct subscriber. Persistent
    /// messages are also spooled into every queue subscribed to the topic;
    /// a persistent message sent to a queue requires that queue to exist.
    pub fn publish(&mut self, session_id: &str, message: Message) -> Result<()> {
        let now = now_ms();
        if message.is_expired(now) {
            debug!(session = %session_id, id = %message.message_id, "dropping expired message");
            return Ok(());
        }

        match message.destination.clone() {
            Destination::Topic(topic) => {
                validate_topic(&topic)?;
                let mut targets = Vec::new();
                if message.delivery_mode == DeliveryMode::Persistent {
                    targets = self
                        .queues
                        .values()
                        .filter(|q| q.matches_topic(&topic))
                        .map(|q| q.name().to_string())
                        .collect();
                    if let Some(full) = targets
                        .iter()
                        .find(|name| self.queues.get(*name).is_some_and(|q| !q.has_room()))
                    {
                        return Err(Error::QueueFull(full.clone()));
                    }
                    for name in &targets {
                        self.spool(name, message.clone())?;
                    }
                }

                self.fan_out(&topic, &message);
                for name in &targets {
                    self.dispatch_queue(name);
                }
                debug!(session = %session_id, topic = %topic, queues = targets.len(), "published");
            }
            Destination::Queue(name) => {
                if !self.queues.contains_key(&name) {
                    return Err(Error::MissingResource(format!("queue '{name}'")));
                }
                self.spool(&name, message)?;
                self.dispatch_queue(&name);
                debug!(session = %session_id, queue = %name, "published to queue");
            }
        }
        Ok(())
    }

    fn fan_out(&mut self, topic: &str, message: &Message) {
        let mut by_session: BTreeMap<String, Vec<u64>> = BTreeMap::new();
        for id in self.subscriptions.route(topic) {
            by_session.entry(id.session).or_default().push(id.receiver);
        }
        for (session_id, receivers) in by_session {
            self.send_to(
                &session_id,
                ServerFrame::Deliver {
                    receivers,
                    message: message.clone(),
                },
            );
        }
    }

    // ---- guaranteed messaging ------------------------------------------

    fn spool(&mut self, name: &str, message: Message) -> Result<()> {
        let queue = self
            .queues
            .get_mut(name)
            .ok_or_else(|| Error::MissingResource(format!("queue '{name}'")))?;
        let durable = queue.spec.durable;
        queue.enqueue(message.clone())?;
        if durable {
            if let Some(persistence) = &self.persistence {
                persistence.store_message(name, &message)?;
            }
        }
        Ok(())
    }

    fn forget(&self, queue: &str, message: &Message) {
        if let Some(persistence) = &self.persistence {
            if let Err(e) = persistence.remove_message(queue, message) {
                error!(queue, id = %message.message_id, error = %e, "failed to remove spooled message");
            }
        }
    }

    fn save_definition(&self, name: &str) {
        let (Some(persistence), Some(queue)) = (&self.persistence, self.queues.get(name)) else {
            return;
        };
        if !queue.spec.durable {
            return;
        }
        let subscriptions: Vec<String> = queue.subscriptions().map(str::to_string).collect();
        if let Err(e) = persistence.save_queue(&queue.spec, &subscriptions) {
            error!(queue = %name, error = %e, "failed to save queue definition");
        }
    }

    /// Makes sure a queue exists.
    ///
    /// Non-durable queues are created on demand for their session. A missing
    /// durable queue is only created when `create_if_missing` is set.
    pub fn provision_queue(
        &mut self,
        session_id: &str,
        spec: &QueueSpec,
        create_if_missing: bool,
    ) -> Result<()> {
        if self.queues.contains_key(&spec.name) {
            return Ok(());
        }
        if spec.durable && !create_if_missing {
            return Err(Error::MissingResource(format!("queue '{}'", spec.name)));
        }

        let owner = (!spec.durable).then(|| session_id.to_string());
        let queue = MessageQueue::new(spec.clone(), owner, self.settings.max_messages_per_queue);
        self.queues.insert(spec.name.clone(), queue);
        self.save_definition(&spec.name);
        info!(queue = %spec.name, durable = spec.durable, access = ?spec.access, "queue provisioned");
        Ok(())
    }

    /// Binds flow `flow` of `session_id` to a queue.
    ///
    /// Exclusive queues answer with a `flow_state` frame telling the flow
    /// whether it is the active consumer.
    #[allow(clippy::too_many_arguments)]
    pub fn bind(
        &mut self,
        session_id: &str,
        flow: u64,
        spec: &QueueSpec,
        subscriptions: &[String],
        selector: Option<&str>,
        window: usize,
        create_if_missing: bool,
    ) -> Result<()> {
        let selector = selector.map(Selector::parse).transpose()?;
        let parsed = subscriptions
            .iter()
            .map(|s| TopicSubscription::parse(s))
            .collect::<Result<Vec<_>>>()?;

        self.provision_queue(session_id, spec, create_if_missing)?;

        let key = FlowKey::new(session_id, flow);
        let queue = self
            .queues
            .get_mut(&spec.name)
            .ok_or_else(|| Error::MissingResource(format!("queue '{}'", spec.name)))?;
        let mut changed = false;
        for sub in parsed {
            changed |= queue.add_subscription(sub);
        }
        let exclusive = queue.spec.is_exclusive();
        let active = queue.add_consumer(Consumer::new(key.clone(), selector, window));

        self.flows.insert(key, spec.name.clone());
        if changed {
            self.save_definition(&spec.name);
        }
        if exclusive {
            self.send_to(session_id, ServerFrame::FlowState { flow, active });
        }
        info!(session = %session_id, flow, queue = %spec.name, active, "flow bound");

        self.dispatch_queue(&spec.name);
        Ok(())
    }

    pub fn unbind(&mut self, session_id: &str, flow: u64) {
        let key = FlowKey::new(session_id, flow);
        if let Some(name) = self.release_flow(&key) {
            self.dispatch_queue(&name);
        }
    }

    fn release_flow(&mut self, key: &FlowKey) -> Option<String> {
        let name = self.flows.remove(key)?;
        let promoted = self
            .queues
            .get_mut(&name)
            .and_then(|q| q.remove_consumer(key));
        if let Some(next) = promoted {
            self.send_to(
                &next.session,
                ServerFrame::FlowState {
                    flow: next.flow,
                    active: true,
                },
            );
            info!(queue = %name, flow = %next, "flow activated");
        }
        debug!(queue = %name, flow = %key, "flow released");
        Some(name)
    }

    /// Settles one delivery. Returns `false` for unknown or repeated acks.
    pub fn ack(&mut self, session_id: &str, flow: u64, delivery: u64) -> bool {
        let key = FlowKey::new(session_id, flow);
        let Some(name) = self.flows.get(&key).cloned() else {
            debug!(flow = %key, delivery, "ack for unbound flow");
            return false;
        };
        let Some(queue) = self.queues.get_mut(&name) else {
            return false;
        };
        let durable = queue.spec.durable;
        match queue.ack(&key, delivery) {
            Some(message) => {
                if durable {
                    self.forget(&name, &message);
                }
                self.dispatch_queue(&name);
                true
            }
            None => {
                debug!(flow = %key, delivery, "duplicate or unknown ack ignored");
                false
            }
        }
    }

    /// Stops or restarts dispatch to one flow.
    pub fn set_flow(&mut self, session_id: &str, flow: u64, paused: bool) -> bool {
        let key = FlowKey::new(session_id, flow);
        let Some(name) = self.flows.get(&key).cloned() else {
            return false;
        };
        let updated = self
            .queues
            .get_mut(&name)
            .is_some_and(|q| q.set_paused(&key, paused));
        if updated && !paused {
            self.dispatch_queue(&name);
        }
        debug!(flow = %key, paused, "flow control");
        updated
    }

    pub fn browse(&self, queue: &str, selector: Option<&str>) -> Result<Vec<Message>> {
        let selector = selector.map(Selector::parse).transpose()?;
        let queue = self
            .queues
            .get(queue)
            .ok_or_else(|| Error::MissingResource(format!("queue '{queue}'")))?;
        Ok(queue.browse(selector.as_ref()))
    }

    pub fn remove_browsed(&mut self, queue: &str, message_id: &str) -> Result<bool> {
        let q = self
            .queues
            .get_mut(queue)
            .ok_or_else(|| Error::MissingResource(format!("queue '{queue}'")))?;
        let durable = q.spec.durable;
        match q.remove_message(message_id) {
            Some(message) => {
                if durable {
                    self.forget(queue, &message);
                }
                self.dispatch_queue(queue);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Writes the spool to disk.
    pub fn flush(&self) -> Result<()> {
        match &self.persistence {
            Some(persistence) => persistence.flush(),
            None => Ok(()),
        }
    }

    pub fn queue(&self, name: &str) -> Option<&MessageQueue> {
        self.queues.get(name)
    }

    pub fn queue_depth(&self, name: &str) -> Option<usize> {
        self.queues.get(name).map(MessageQueue::depth)
    }

    fn dispatch_queue(&mut self, name: &str) {
        let now = now_ms();
        let Some(queue) = self.queues.get_mut(name) else {
            return;
        };
        let durable = queue.spec.durable;
        let expired = queue.purge_expired(now);
        let dispatches = queue.dispatch(now);

        for message in &expired {
            debug!(queue = %name, id = %message.message_id, "message expired");
            if durable {
                self.forget(name, message);
            }
        }
        for d in dispatches {
            self.send_to(
                &d.flow.session,
                ServerFrame::FlowDeliver {
                    flow: d.flow.flow,
                    delivery: d.delivery,
                    message: d.message,
                },
            );
        }
    }

    /// Requeues deliveries whose ACK is overdue and dispatches again.
    ///
    /// Returns how many messages were put back.
    pub fn redeliver_expired(&mut self, now_ms: i64) -> usize {
        let timeout = i64::try_from(self.settings.redelivery_timeout_ms).unwrap_or(i64::MAX);
        let max = self.settings.max_redeliveries;
        let names: Vec<String> = self.queues.keys().cloned().collect();

        let mut total = 0;
        for name in &names {
            let Some(queue) = self.queues.get_mut(name) else {
                continue;
            };
            let durable = queue.spec.durable;
            let (requeued, dropped) = queue.redeliver_expired(now_ms, timeout, max);
            total += requeued;
            for message in &dropped {
                warn!(queue = %name, id = %message.message_id, max, "message dropped after max redeliveries");
                if durable {
                    self.forget(name, message);
                }
            }
            self.dispatch_queue(name);
        }
        total
    }

    pub async fn start_maintenance_loop(broker: SharedBroker) {
        loop {
            tokio::time::sleep(Self::MAINTENANCE_INTERVAL).await;

            let requeued = lock(&broker).redeliver_expired(now_ms());
            if requeued > 0 {
                info!(requeued, "redelivering unacknowledged messages");
            }
        }
    }
}
