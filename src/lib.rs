//! # relaymq
//!
//! `relaymq` is a publish/subscribe messaging SDK together with the small
//! reference broker it talks to over JSON frames on WebSockets.
//!
//! ## Core Modules
//!
//! - `client`: the SDK. A `MessagingService` manages the session and its
//!   reconnection; publishers, receivers, queue browsers and request/reply
//!   endpoints are built from it.
//! - `broker`: the reference broker's routing core: topic subscriptions with
//!   wildcards and share names, guaranteed-delivery queues, selectors.
//! - `transport`: the wire frames and the WebSocket server in front of the broker.
//! - `persistence`: the sled-backed spool for durable queues.
//! - `config`: layered configuration for both sides.
//! - `utils`: the crate error type and logging setup.

pub mod broker;
pub mod client;
pub mod config;
pub mod persistence;
pub mod transport;
pub mod utils;

pub use utils::{Error, Result};

#[cfg(test)]
mod tests;
