//! The `transport` module carries frames between clients and the broker over
//! WebSockets.
//!
//! It defines the JSON frames of the protocol and the server that accepts
//! connections, enforces authentication and forwards client frames to the
//! broker.

pub mod message;
pub mod websocket;

pub use websocket::{BrokerServer, ServerHandle};
