//! Matching asynchronous outcomes back to the call that caused them.
//!
//! A `CorrelationTable` maps a key (receipt id, request id, correlation id)
//! to a one-shot completion. Completion, cancellation (timeout) and
//! interruption all remove the entry under the table lock, so whichever
//! happens first wins and the others find nothing.

use std::collections::HashMap;
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::oneshot;
use tracing::trace;

use crate::utils::{Error, Result, locked};

type Completion<V> = oneshot::Sender<Result<V>>;

#[derive(Debug)]
pub struct CorrelationTable<K, V> {
    pending: Mutex<HashMap<K, Completion<V>>>,
}

impl<K, V> Default for CorrelationTable<K, V>
where
    K: Eq + Hash,
{
    fn default() -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
        }
    }
}

impl<K, V> CorrelationTable<K, V>
where
    K: Eq + Hash + Clone + Debug,
{
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<K, Completion<V>>> {
        locked(&self.pending)
    }

    /// Starts tracking `key`. Registering a key twice abandons the first waiter.
    pub fn register(&self, key: K) -> oneshot::Receiver<Result<V>> {
        let (tx, rx) = oneshot::channel();
        self.entries().insert(key, tx);
        rx
    }

    /// Resolves `key`. Returns `false` if it was already resolved or never registered.
    pub fn complete(&self, key: &K, result: Result<V>) -> bool {
        let Some(tx) = self.entries().remove(key) else {
            trace!(?key, "no pending correlation");
            return false;
        };
        // the waiter may have gone away; the key is settled either way
        let _ = tx.send(result);
        true
    }

    /// Forgets `key` without resolving it.
    pub fn cancel(&self, key: &K) -> bool {
        self.entries().remove(key).is_some()
    }

    /// Resolves everything still pending with `Error::Interrupted`.
    pub fn fail_all(&self, reason: &str) -> usize {
        let drained: Vec<Completion<V>> = self.entries().drain().map(|(_, tx)| tx).collect();
        let count = drained.len();
        for tx in drained {
            let _ = tx.send(Err(Error::Interrupted(reason.to_string())));
        }
        count
    }

    pub fn contains(&self, key: &K) -> bool {
        self.entries().contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries().is_empty()
    }

    /// Waits for the outcome of `key`, giving up after `timeout`.
    ///
    /// A timeout only wins if it can still remove the entry; if a completion
    /// slipped in first, that completion is returned instead.
    pub async fn wait(
        &self,
        key: K,
        mut rx: oneshot::Receiver<Result<V>>,
        timeout: Option<Duration>,
    ) -> Result<V> {
        let Some(limit) = timeout else {
            return rx.await.unwrap_or_else(|_| Err(abandoned()));
        };

        match tokio::time::timeout(limit, &mut rx).await {
            Ok(outcome) => outcome.unwrap_or_else(|_| Err(abandoned())),
            Err(_) if self.cancel(&key) => Err(Error::Timeout(limit)),
            // a completion removed the entry first and is about to send
            Err(_) => rx.await.unwrap_or_else(|_| Err(abandoned())),
        }
    }
}

impl<K, V> CorrelationTable<K, V>
where
    K: Eq + Hash + Clone + Debug + Send + 'static,
    V: Send + 'static,
{
    /// Runs `handler` exactly once with the outcome of `key`, on its own task.
    pub fn on_complete<F>(
        self: &Arc<Self>,
        key: K,
        rx: oneshot::Receiver<Result<V>>,
        timeout: Option<Duration>,
        handler: F,
    ) where
        F: FnOnce(Result<V>) + Send + 'static,
    {
        let table = Arc::clone(self);
        tokio::spawn(async move {
            let outcome = table.wait(key, rx, timeout).await;
            handler(outcome);
        });
    }
}

fn abandoned() -> Error {
    Error::Interrupted("correlation abandoned".to_string())
}
