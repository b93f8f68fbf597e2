//! WebSocket transport
//!
//! Accepts WebSocket connections and translates JSON frames into broker
//! operations:
//! - one task per connection, registering a `Session` with the `Broker`
//! - the first frame must be `connect`; anything else closes the connection
//! - broker output reaches the socket through the session's channel, so the
//!   broker lock is never held while writing to the network
//!
//! Sessions are cleaned up exactly once, when the connection task ends.

use std::net::SocketAddr;

use futures_util::{Sink, SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::accept_async;
use tracing::{debug, error, info, warn};
use tungstenite::protocol::Message as WsMessage;

use crate::broker::engine::{SharedBroker, lock};
use crate::broker::session::Session;
use crate::transport::message::{ClientFrame, ServerFrame};
use crate::utils::Result;

/// What the connection loop should do after a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameOutcome {
    Continue,
    Close,
}

pub struct BrokerServer {
    listener: TcpListener,
    broker: SharedBroker,
}

/// Controls a server started with [`BrokerServer::spawn`].
pub struct ServerHandle {
    addr: SocketAddr,
    shutdown: watch::Sender<bool>,
    kick: broadcast::Sender<()>,
    task: JoinHandle<()>,
}

impl ServerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn url(&self) -> String {
        format!("ws://{}", self.addr)
    }

    /// Closes every open connection but keeps accepting new ones.
    pub fn drop_connections(&self) {
        let _ = self.kick.send(());
    }

    /// Stops accepting and closes all connections.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.task.await {
            error!(error = %e, "server task failed");
        }
    }
}

impl BrokerServer {
    pub async fn bind(addr: &str, broker: SharedBroker) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self { listener, broker })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Serves until the process ends.
    pub async fn run(self) -> Result<()> {
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let (kick, _) = broadcast::channel(1);
        self.accept_loop(shutdown_rx, kick).await;
        Ok(())
    }

    pub fn spawn(self) -> Result<ServerHandle> {
        let addr = self.local_addr()?;
        let (shutdown, shutdown_rx) = watch::channel(false);
        let (kick, _) = broadcast::channel(1);
        let task = tokio::spawn(self.accept_loop(shutdown_rx, kick.clone()));
        Ok(ServerHandle {
            addr,
            shutdown,
            kick,
            task,
        })
    }

    async fn accept_loop(self, mut shutdown: watch::Receiver<bool>, kick: broadcast::Sender<()>) {
        match self.listener.local_addr() {
            Ok(addr) => info!("WebSocket server listening on ws://{addr}"),
            Err(e) => warn!(error = %e, "listener has no local address"),
        }

        loop {
            tokio::select! {
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        debug!(%peer, "accepted connection");
                        tokio::spawn(serve_connection(
                            stream,
                            self.broker.clone(),
                            shutdown.clone(),
                            kick.subscribe(),
                        ));
                    }
                    Err(e) => {
                        error!(error = %e, "accept failed");
                    }
                },
                _ = shutdown.changed() => break,
            }
        }
        info!("WebSocket server stopped");
    }
}

async fn serve_connection(
    stream: TcpStream,
    broker: SharedBroker,
    mut shutdown: watch::Receiver<bool>,
    mut kick: broadcast::Receiver<()>,
) {
    let ws_stream = match accept_async(stream).await {
        Ok(ws) => ws,
        Err(e) => {
            warn!(error = %e, "WebSocket handshake error");
            return;
        }
    };
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<ServerFrame>();
    let session = Session::new(tx);
    let session_id = session.id.clone();

    let registered = lock(&broker).register_session(session);
    if let Err(e) = registered {
        warn!(error = %e, "refusing connection");
        if let Ok(text) = serde_json::to_string(&ServerFrame::failure(None, &e)) {
            let _ = ws_sender.send(WsMessage::text(text)).await;
        }
        let _ = ws_sender.close().await;
        return;
    }

    loop {
        tokio::select! {
            Some(frame) = rx.recv() => {
                if !write_frame(&mut ws_sender, &session_id, &frame).await {
                    break;
                }
            }
            incoming = ws_receiver.next() => match incoming {
                Some(Ok(WsMessage::Text(text))) => {
                    let frame = match serde_json::from_str::<ClientFrame>(text.as_str()) {
                        Ok(frame) => frame,
                        Err(e) => {
                            warn!(
                                session = %session_id,
                                error = %e,
                                frame = %text.chars().take(100).collect::<String>(),
                                "invalid client frame"
                            );
                            continue;
                        }
                    };
                    if handle_frame(&broker, &session_id, frame) == FrameOutcome::Close {
                        // flush replies queued by the last frame
                        while let Ok(frame) = rx.try_recv() {
                            if !write_frame(&mut ws_sender, &session_id, &frame).await {
                                break;
                            }
                        }
                        break;
                    }
                }
                Some(Ok(WsMessage::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!(session = %session_id, error = %e, "read failed");
                    break;
                }
            },
            _ = shutdown.changed() => break,
            _ = kick.recv() => break,
        }
    }

    lock(&broker).cleanup_session(&session_id);
    let _ = ws_sender.close().await;
    info!(session = %session_id, "disconnected");
}

async fn write_frame<S>(ws_sender: &mut S, session_id: &str, frame: &ServerFrame) -> bool
where
    S: Sink<WsMessage> + Unpin,
    S::Error: std::fmt::Display,
{
    let text = match serde_json::to_string(frame) {
        Ok(json) => json,
        Err(e) => {
            error!(session = %session_id, error = %e, "failed to serialize frame");
            return true;
        }
    };
    match ws_sender.send(WsMessage::text(text)).await {
        Ok(()) => true,
        Err(e) => {
            debug!(session = %session_id, error = %e, "failed to send frame");
            false
        }
    }
}

/// Applies one client frame to the broker and queues the replies.
pub fn handle_frame(broker: &SharedBroker, session_id: &str, frame: ClientFrame) -> FrameOutcome {
    let mut broker = lock(broker);

    if !broker.is_authenticated(session_id) {
        return match frame {
            ClientFrame::Connect {
                client_name,
                vpn,
                credentials,
            } => match broker.connect(session_id, &client_name, &vpn, &credentials) {
                Ok(()) => {
                    broker.send_to(
                        session_id,
                        ServerFrame::Connected {
                            session_id: session_id.to_string(),
                        },
                    );
                    FrameOutcome::Continue
                }
                Err(e) => {
                    warn!(session = %session_id, error = %e, "connect refused");
                    broker.send_to(session_id, ServerFrame::failure(None, &e));
                    FrameOutcome::Close
                }
            },
            _ => {
                warn!(session = %session_id, "frame before connect");
                broker.send_to(session_id, ServerFrame::error(None, "must authenticate first"));
                FrameOutcome::Close
            }
        };
    }

    match frame {
        ClientFrame::Connect { .. } => {
            broker.send_to(session_id, ServerFrame::error(None, "already connected"));
        }
        ClientFrame::Subscribe {
            receiver,
            subscription,
            share,
            request,
        } => {
            let reply = match broker.subscribe(session_id, receiver, &subscription, share) {
                Ok(()) => ServerFrame::Ok { request },
                Err(e) => ServerFrame::failure(Some(request), &e),
            };
            broker.send_to(session_id, reply);
        }
        ClientFrame::Unsubscribe {
            receiver,
            subscription,
            share,
            request,
        } => {
            broker.unsubscribe(session_id, receiver, &subscription, share.as_deref());
            broker.send_to(session_id, ServerFrame::Ok { request });
        }
        ClientFrame::Publish {
            message,
            receipt,
            publisher,
        } => {
            let message_id = message.message_id.clone();
            let result = broker.publish(session_id, message);
            match (receipt, result) {
                (Some(receipt), result) => broker.send_to(
                    session_id,
                    ServerFrame::PublishReceipt {
                        receipt,
                        error: result.err().map(|e| e.to_string()),
                    },
                ),
                (None, Err(e)) => broker.send_to(
                    session_id,
                    ServerFrame::Rejected {
                        message_id,
                        publisher,
                        error: e.to_string(),
                    },
                ),
                (None, Ok(())) => {}
            }
        }
        ClientFrame::Bind {
            flow,
            queue,
            subscriptions,
            selector,
            window,
            create_if_missing,
            request,
        } => {
            let reply = match broker.bind(
                session_id,
                flow,
                &queue,
                &subscriptions,
                selector.as_deref(),
                window,
                create_if_missing,
            ) {
                Ok(()) => ServerFrame::Ok { request },
                Err(e) => ServerFrame::failure(Some(request), &e),
            };
            broker.send_to(session_id, reply);
        }
        ClientFrame::Unbind { flow } => broker.unbind(session_id, flow),
        ClientFrame::Ack { flow, delivery } => {
            broker.ack(session_id, flow, delivery);
        }
        ClientFrame::Flow { flow, paused } => {
            broker.set_flow(session_id, flow, paused);
        }
        ClientFrame::Browse {
            request,
            queue,
            selector,
        } => {
            let reply = match broker.browse(&queue, selector.as_deref()) {
                Ok(messages) => ServerFrame::Browsed { request, messages },
                Err(e) => ServerFrame::failure(Some(request), &e),
            };
            broker.send_to(session_id, reply);
        }
        ClientFrame::RemoveBrowsed {
            request,
            queue,
            message_id,
        } => {
            let reply = match broker.remove_browsed(&queue, &message_id) {
                Ok(_) => ServerFrame::Ok { request },
                Err(e) => ServerFrame::failure(Some(request), &e),
            };
            broker.send_to(session_id, reply);
        }
        ClientFrame::Disconnect => return FrameOutcome::Close,
    }
    FrameOutcome::Continue
}
