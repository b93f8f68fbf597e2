//! Local buffers between the application and the session.
//!
//! `OutboundBuffer` holds frames a publisher has accepted but not yet handed
//! to the connection, and applies the publisher's back-pressure strategy.
//! `InboundBuffer` holds messages a receiver has been given but the
//! application has not consumed yet.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::{Notify, mpsc};
use tracing::trace;

use crate::config::{BackPressureKind, PublisherSettings};
use crate::utils::{Error, Result, locked};

/// What a publisher does when its buffer is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackPressure {
    /// Fail the publish with `Error::PublisherOverflow`.
    Reject { capacity: usize },
    /// Suspend the caller until there is room.
    Wait { capacity: usize },
    /// Never full.
    Elastic,
}

impl BackPressure {
    pub fn from_settings(settings: &PublisherSettings) -> Self {
        let capacity = settings.buffer_capacity.max(1);
        match settings.back_pressure {
            BackPressureKind::Reject => BackPressure::Reject { capacity },
            BackPressureKind::Wait => BackPressure::Wait { capacity },
            BackPressureKind::Elastic => BackPressure::Elastic,
        }
    }
}

#[derive(Debug)]
enum BufferTx<T> {
    Bounded(mpsc::Sender<T>),
    Unbounded(mpsc::UnboundedSender<T>),
}

/// Draining end of an [`OutboundBuffer`].
#[derive(Debug)]
pub enum BufferRx<T> {
    Bounded(mpsc::Receiver<T>),
    Unbounded(mpsc::UnboundedReceiver<T>),
}

impl<T> BufferRx<T> {
    pub async fn recv(&mut self) -> Option<T> {
        match self {
            BufferRx::Bounded(rx) => rx.recv().await,
            BufferRx::Unbounded(rx) => rx.recv().await,
        }
    }

    pub fn try_recv(&mut self) -> Option<T> {
        match self {
            BufferRx::Bounded(rx) => rx.try_recv().ok(),
            BufferRx::Unbounded(rx) => rx.try_recv().ok(),
        }
    }
}

#[derive(Debug)]
pub struct OutboundBuffer<T> {
    tx: BufferTx<T>,
    strategy: BackPressure,
}

impl<T: Send + 'static> OutboundBuffer<T> {
    pub fn new(strategy: BackPressure) -> (Self, BufferRx<T>) {
        let (tx, rx) = match strategy {
            BackPressure::Reject { capacity } | BackPressure::Wait { capacity } => {
                let (tx, rx) = mpsc::channel(capacity.max(1));
                (BufferTx::Bounded(tx), BufferRx::Bounded(rx))
            }
            BackPressure::Elastic => {
                let (tx, rx) = mpsc::unbounded_channel();
                (BufferTx::Unbounded(tx), BufferRx::Unbounded(rx))
            }
        };
        (Self { tx, strategy }, rx)
    }

    pub fn strategy(&self) -> BackPressure {
        self.strategy
    }

    /// Accepts `item` according to the strategy; only `Wait` ever suspends.
    pub async fn push(&self, item: T) -> Result<()> {
        match (&self.tx, self.strategy) {
            (BufferTx::Bounded(tx), BackPressure::Wait { .. }) => {
                tx.send(item).await.map_err(|_| closed())
            }
            _ => self.try_push(item),
        }
    }

    /// Accepts `item` without waiting. A full buffer fails with `PublisherOverflow`.
    pub fn try_push(&self, item: T) -> Result<()> {
        match &self.tx {
            BufferTx::Bounded(tx) => tx.try_send(item).map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => Error::PublisherOverflow {
                    capacity: tx.max_capacity(),
                },
                mpsc::error::TrySendError::Closed(_) => closed(),
            }),
            BufferTx::Unbounded(tx) => tx.send(item).map_err(|_| closed()),
        }
    }

    pub fn has_capacity(&self) -> bool {
        match &self.tx {
            BufferTx::Bounded(tx) => tx.capacity() > 0,
            BufferTx::Unbounded(_) => true,
        }
    }

    /// Calls `listener` once, as soon as at least one slot is free.
    pub fn notify_when_ready<F>(&self, listener: F)
    where
        F: FnOnce() + Send + 'static,
    {
        match &self.tx {
            BufferTx::Bounded(tx) => {
                let tx = tx.clone();
                tokio::spawn(async move {
                    if let Ok(permit) = tx.reserve().await {
                        drop(permit);
                        listener();
                    }
                });
            }
            BufferTx::Unbounded(_) => listener(),
        }
    }
}

fn closed() -> Error {
    Error::IllegalState("publisher terminated".to_string())
}

/// Local buffering policy for receivers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReceiverBufferStrategy {
    #[default]
    Elastic,
    /// Drop the oldest buffered message to make room.
    DropOldest { capacity: usize },
    /// Drop the incoming message.
    DropLatest { capacity: usize },
}

impl ReceiverBufferStrategy {
    /// `0` means unbounded.
    pub fn from_capacity(capacity: usize) -> Self {
        if capacity == 0 {
            ReceiverBufferStrategy::Elastic
        } else {
            ReceiverBufferStrategy::DropOldest { capacity }
        }
    }
}

#[derive(Debug)]
struct InboundState<T> {
    queue: VecDeque<T>,
    discarded: bool,
    paused: bool,
    closed: bool,
}

/// Outcome of a push into an [`InboundBuffer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pushed {
    Buffered,
    /// Buffered after evicting the oldest entry.
    Evicted,
    Dropped,
}

/// Result of a bounded wait on an [`InboundBuffer`].
#[derive(Debug)]
pub enum Popped<T> {
    Item(T, bool),
    TimedOut,
    Closed,
}

#[derive(Debug)]
pub struct InboundBuffer<T> {
    state: Mutex<InboundState<T>>,
    notify: Notify,
    strategy: ReceiverBufferStrategy,
}

impl<T> InboundBuffer<T> {
    pub fn new(strategy: ReceiverBufferStrategy) -> Self {
        Self {
            state: Mutex::new(InboundState {
                queue: VecDeque::new(),
                discarded: false,
                paused: false,
                closed: false,
            }),
            notify: Notify::new(),
            strategy,
        }
    }

    fn state(&self) -> MutexGuard<'_, InboundState<T>> {
        locked(&self.state)
    }

    pub fn push(&self, item: T) -> Pushed {
        let outcome = {
            let mut state = self.state();
            if state.closed {
                return Pushed::Dropped;
            }
            match self.strategy {
                ReceiverBufferStrategy::DropLatest { capacity } if state.queue.len() >= capacity => {
                    state.discarded = true;
                    Pushed::Dropped
                }
                ReceiverBufferStrategy::DropOldest { capacity } if state.queue.len() >= capacity => {
                    state.queue.pop_front();
                    state.queue.push_back(item);
                    state.discarded = true;
                    Pushed::Evicted
                }
                _ => {
                    state.queue.push_back(item);
                    Pushed::Buffered
                }
            }
        };
        if outcome != Pushed::Dropped {
            self.notify.notify_waiters();
        }
        trace!(?outcome, "inbound push");
        outcome
    }

    /// Next item and whether messages were dropped before it.
    /// Nothing comes out while paused.
    pub fn try_pop(&self) -> Option<(T, bool)> {
        let mut state = self.state();
        if state.paused {
            return None;
        }
        let item = state.queue.pop_front()?;
        let discarded = std::mem::take(&mut state.discarded);
        Some((item, discarded))
    }

    /// Waits for the next item. Returns `None` once closed and drained,
    /// or closed while paused.
    pub async fn pop(&self) -> Option<(T, bool)> {
        loop {
            let notified = self.notify.notified();
            {
                let state = self.state();
                if state.closed && (state.queue.is_empty() || state.paused) {
                    return None;
                }
            }
            if let Some(next) = self.try_pop() {
                return Some(next);
            }
            notified.await;
        }
    }

    /// Like [`InboundBuffer::pop`] with a deadline.
    pub async fn pop_timeout(&self, timeout: Duration) -> Popped<T> {
        match tokio::time::timeout(timeout, self.pop()).await {
            Ok(Some((item, discarded))) => Popped::Item(item, discarded),
            Ok(None) => Popped::Closed,
            Err(_) => Popped::TimedOut,
        }
    }

    pub fn set_paused(&self, paused: bool) {
        self.state().paused = paused;
        if !paused {
            self.notify.notify_waiters();
        }
    }

    pub fn is_paused(&self) -> bool {
        self.state().paused
    }

    /// Stops accepting items. Buffered ones can still be popped.
    pub fn close(&self) {
        self.state().closed = true;
        self.notify.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        self.state().closed
    }

    pub fn clear(&self) -> usize {
        let mut state = self.state();
        let count = state.queue.len();
        state.queue.clear();
        count
    }

    pub fn len(&self) -> usize {
        self.state().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
