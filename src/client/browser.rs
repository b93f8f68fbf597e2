//! Queue browsing: reading queue contents without consuming them.

use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::time::Instant;
use tracing::debug;

use crate::broker::selector::Selector;
use crate::client::lifecycle::{Lifecycle, LifecycleCell};
use crate::client::message::InboundMessage;
use crate::client::service::{Reply, ServiceInner};
use crate::transport::message::ClientFrame;
use crate::utils::{Error, Result, locked};

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Configures a [`MessageQueueBrowser`].
pub struct MessageQueueBrowserBuilder {
    inner: Arc<ServiceInner>,
    selector: Option<String>,
    poll_interval: Duration,
}

impl MessageQueueBrowserBuilder {
    pub(crate) fn new(inner: Arc<ServiceInner>) -> Self {
        Self {
            inner,
            selector: None,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    /// Only browse messages matching `expression`.
    pub fn with_message_selector(mut self, expression: impl Into<String>) -> Self {
        self.selector = Some(expression.into());
        self
    }

    /// How often an empty browser asks the broker again.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Fails with `Error::InvalidSelector` for a malformed selector.
    pub fn build(self, queue: impl Into<String>) -> Result<MessageQueueBrowser> {
        if let Some(expression) = &self.selector {
            Selector::parse(expression)?;
        }
        Ok(MessageQueueBrowser {
            inner: self.inner,
            queue: queue.into(),
            selector: self.selector,
            poll_interval: self.poll_interval,
            lifecycle: LifecycleCell::new("queue browser"),
            cache: Mutex::new(VecDeque::new()),
            seen: Mutex::new(HashSet::new()),
        })
    }
}

/// Walks a queue's messages in order, each at most once.
pub struct MessageQueueBrowser {
    inner: Arc<ServiceInner>,
    queue: String,
    selector: Option<String>,
    poll_interval: Duration,
    lifecycle: LifecycleCell,
    cache: Mutex<VecDeque<InboundMessage>>,
    seen: Mutex<HashSet<String>>,
}

impl MessageQueueBrowser {
    /// Starts browsing. Fails unless the service is connected or reconnecting.
    pub fn start(&self) -> Result<()> {
        self.lifecycle.start()?;
        if let Err(e) = self.inner.ensure_usable() {
            self.lifecycle.reset();
            return Err(e);
        }
        Ok(())
    }

    pub fn lifecycle(&self) -> Lifecycle {
        self.lifecycle.get()
    }

    pub fn queue_name(&self) -> &str {
        &self.queue
    }

    async fn refill(&self) -> Result<usize> {
        let queue = self.queue.clone();
        let selector = self.selector.clone();
        let reply = self
            .inner
            .request(|request| ClientFrame::Browse {
                request,
                queue,
                selector,
            })
            .await?;
        let Reply::Browsed(messages) = reply else {
            return Err(Error::Broker("unexpected reply to browse".to_string()));
        };

        let mut seen = locked(&self.seen);
        let mut cache = locked(&self.cache);
        let before = cache.len();
        for message in messages {
            if seen.insert(message.message_id.clone()) {
                cache.push_back(InboundMessage::direct(message));
            }
        }
        Ok(cache.len() - before)
    }

    /// Next message not browsed before, or `None` after `timeout`.
    pub async fn receive_message_timeout(
        &self,
        timeout: Duration,
    ) -> Result<Option<InboundMessage>> {
        self.lifecycle.ensure_started()?;
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(message) = locked(&self.cache).pop_front() {
                return Ok(Some(message));
            }
            let added = self.refill().await?;
            if added > 0 {
                continue;
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(self.poll_interval.min(deadline - now)).await;
        }
    }

    /// Only what the queue holds right now.
    pub async fn try_receive(&self) -> Result<Option<InboundMessage>> {
        self.receive_message_timeout(Duration::ZERO).await
    }

    /// Deletes a browsed message from the queue.
    pub async fn remove(&self, message: &InboundMessage) -> Result<()> {
        self.lifecycle.ensure_started()?;
        let queue = self.queue.clone();
        let message_id = message.message_id().to_string();
        debug!(queue = %self.queue, %message_id, "removing browsed message");
        self.inner
            .request(|request| ClientFrame::RemoveBrowsed {
                request,
                queue,
                message_id,
            })
            .await
            .map(|_| ())
    }

    /// Stops browsing and forgets what was already seen.
    pub fn terminate(&self) {
        if self.lifecycle.terminate() {
            locked(&self.cache).clear();
        }
    }
}
