//! The reference broker: sessions, topic routing, queues and selectors.

pub mod engine;
pub mod message;
pub mod queue;
pub mod selector;
pub mod session;
pub mod topic;

pub use engine::{Broker, SharedBroker};
