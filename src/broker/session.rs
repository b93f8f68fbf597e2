//! A connected client session as seen by the broker.
//!
//! The transport owns the socket; the broker only keeps the sending half of
//! the session's outbound channel. `authenticated` flips once the `connect`
//! frame has been accepted.

use tokio::sync::mpsc::UnboundedSender;
use tracing::debug;
use uuid::Uuid;

use crate::transport::message::ServerFrame;

#[derive(Debug)]
pub struct Session {
    pub id: String,
    pub sender: UnboundedSender<ServerFrame>,
    pub authenticated: bool,
    pub client_name: Option<String>,
    pub principal: Option<String>,
}

impl Session {
    pub fn new(sender: UnboundedSender<ServerFrame>) -> Self {
        Self {
            id: format!("session-{}", Uuid::new_v4()),
            sender,
            authenticated: false,
            client_name: None,
            principal: None,
        }
    }

    /// Queues a frame for the socket. Returns `false` once the connection is gone.
    pub fn send(&self, frame: ServerFrame) -> bool {
        match self.sender.send(frame) {
            Ok(()) => true,
            Err(_) => {
                debug!(session = %self.id, "outbound channel closed");
                false
            }
        }
    }
}
