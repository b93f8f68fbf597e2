//! The `persistence` module keeps durable queues across broker restarts.
//!
//! It uses `sled` as an embedded key-value store: queue definitions in one
//! tree and each queue's spooled messages in a tree of its own. Messages are
//! removed as soon as they are acknowledged.

pub mod sled_store;

pub use sled_store::{Persistence, StoredQueue};
