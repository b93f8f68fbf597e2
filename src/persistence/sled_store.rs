use std::path::Path;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use sled::{Db, Tree};
use tracing::{debug, warn};

use crate::broker::message::Message;
use crate::broker::queue::QueueSpec;
use crate::utils::Result;

const QUEUES_TREE: &str = "queues";

/// A durable queue definition as written to disk.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct StoredQueue {
    pub spec: QueueSpec,
    pub subscriptions: Vec<String>,
}

/// Spool for durable queues.
///
/// Queue definitions live in the `queues` tree; each queue's messages live in
/// a `queue:{name}` tree keyed so that iteration follows publish order.
#[derive(Clone)]
pub struct Persistence {
    db: Db,
    ttl_seconds: Option<i64>,
}

impl Persistence {
    pub fn open(path: impl AsRef<Path>, ttl_seconds: Option<i64>) -> Result<Self> {
        let db = sled::open(path)?;
        Ok(Self { db, ttl_seconds })
    }

    fn message_tree(&self, queue: &str) -> Result<Tree> {
        Ok(self.db.open_tree(format!("queue:{queue}"))?)
    }

    fn message_key(message: &Message) -> String {
        format!("{:020}_{}", message.timestamp.max(0), message.message_id)
    }

    pub fn save_queue(&self, spec: &QueueSpec, subscriptions: &[String]) -> Result<()> {
        let stored = StoredQueue {
            spec: spec.clone(),
            subscriptions: subscriptions.to_vec(),
        };
        let serialized = serde_json::to_vec(&stored)?;
        self.db
            .open_tree(QUEUES_TREE)?
            .insert(spec.name.as_bytes(), serialized)?;
        Ok(())
    }

    pub fn load_queues(&self) -> Result<Vec<StoredQueue>> {
        let tree = self.db.open_tree(QUEUES_TREE)?;
        let mut queues = Vec::new();
        for entry in tree.iter() {
            let (key, value) = entry?;
            match serde_json::from_slice::<StoredQueue>(&value) {
                Ok(queue) => queues.push(queue),
                Err(e) => warn!(key = %String::from_utf8_lossy(&key), error = %e, "skipping unreadable queue definition"),
            }
        }
        Ok(queues)
    }

    pub fn store_message(&self, queue: &str, message: &Message) -> Result<()> {
        let serialized = serde_json::to_vec(message)?;
        self.message_tree(queue)?
            .insert(Self::message_key(message), serialized)?;
        Ok(())
    }

    pub fn remove_message(&self, queue: &str, message: &Message) -> Result<()> {
        self.message_tree(queue)?
            .remove(Self::message_key(message))?;
        Ok(())
    }

    /// Spooled messages of `queue` in publish order, after dropping old ones.
    pub fn load_messages(&self, queue: &str) -> Result<Vec<Message>> {
        let removed = self.cleanup_old_messages(queue)?;
        if removed > 0 {
            debug!(queue, removed, "dropped aged-out messages");
        }

        let tree = self.message_tree(queue)?;
        Ok(tree
            .iter()
            .filter_map(|res| res.ok())
            .filter_map(|(_, val)| serde_json::from_slice(&val).ok())
            .collect())
    }

    /// Deletes messages older than the configured TTL or past their own expiration.
    fn cleanup_old_messages(&self, queue: &str) -> Result<usize> {
        let now_ms = Utc::now().timestamp_millis();
        let cutoff_ms = self.ttl_seconds.map(|ttl| now_ms - ttl * 1000);

        let tree = self.message_tree(queue)?;
        let old_keys: Vec<_> = tree
            .iter()
            .filter_map(|res| res.ok())
            .filter_map(|(key, val)| {
                let message: Message = serde_json::from_slice(&val).ok()?;
                let aged = cutoff_ms.is_some_and(|cutoff| message.timestamp < cutoff);
                (aged || message.is_expired(now_ms)).then_some(key)
            })
            .collect();

        let count = old_keys.len();
        for key in old_keys {
            tree.remove(key)?;
        }
        Ok(count)
    }

    pub fn flush(&self) -> Result<()> {
        self.db.flush()?;
        Ok(())
    }
}

impl std::fmt::Debug for Persistence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Persistence")
            .field("db", &"sled::Db")
            .field("ttl_seconds", &self.ttl_seconds)
            .finish()
    }
}
