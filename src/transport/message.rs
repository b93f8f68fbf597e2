//! Wire frames exchanged between the client SDK and the broker.
//!
//! Every frame is one JSON text message tagged by `"type"`.

use serde::{Deserialize, Serialize};

use crate::broker::message::Message;
use crate::broker::queue::QueueSpec;
use crate::utils::Error;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "scheme", rename_all = "snake_case")]
pub enum Credentials {
    Basic { username: String, password: String },
    #[serde(rename = "oauth2")]
    OAuth2 { access_token: String },
}

/// Claims carried by OAuth2 access tokens.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub exp: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    Connect {
        client_name: String,
        vpn: String,
        credentials: Credentials,
    },
    Subscribe {
        receiver: u64,
        subscription: String,
        #[serde(default)]
        share: Option<String>,
        request: u64,
    },
    Unsubscribe {
        receiver: u64,
        subscription: String,
        #[serde(default)]
        share: Option<String>,
        request: u64,
    },
    Publish {
        message: Message,
        /// Present for persistent messages; echoed in the `publish_receipt`.
        #[serde(default)]
        receipt: Option<u64>,
        /// Echoed in `rejected` so the failure reaches the right publisher.
        #[serde(default)]
        publisher: Option<u64>,
    },
    Bind {
        flow: u64,
        queue: QueueSpec,
        #[serde(default)]
        subscriptions: Vec<String>,
        #[serde(default)]
        selector: Option<String>,
        window: usize,
        #[serde(default)]
        create_if_missing: bool,
        request: u64,
    },
    Unbind {
        flow: u64,
    },
    Ack {
        flow: u64,
        delivery: u64,
    },
    Flow {
        flow: u64,
        paused: bool,
    },
    Browse {
        request: u64,
        queue: String,
        #[serde(default)]
        selector: Option<String>,
    },
    RemoveBrowsed {
        request: u64,
        queue: String,
        message_id: String,
    },
    Disconnect,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    Connected {
        session_id: String,
    },
    Ok {
        request: u64,
    },
    Error {
        #[serde(default)]
        request: Option<u64>,
        #[serde(default)]
        kind: ErrorKind,
        message: String,
    },
    /// One frame per session, listing every local receiver the message matched.
    Deliver {
        receivers: Vec<u64>,
        message: Message,
    },
    FlowDeliver {
        flow: u64,
        delivery: u64,
        message: Message,
    },
    FlowState {
        flow: u64,
        active: bool,
    },
    PublishReceipt {
        receipt: u64,
        #[serde(default)]
        error: Option<String>,
    },
    /// A direct message the broker refused.
    Rejected {
        message_id: String,
        #[serde(default)]
        publisher: Option<u64>,
        error: String,
    },
    Browsed {
        request: u64,
        messages: Vec<Message>,
    },
}

/// Category of a broker-side failure, so clients can rebuild a typed error.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Authentication,
    MissingResource,
    QueueFull,
    InvalidRequest,
    #[default]
    Other,
}

impl ErrorKind {
    /// Splits an error into its kind and the detail worth sending.
    pub fn classify(err: &Error) -> (Self, String) {
        match err {
            Error::Authentication(detail) => (ErrorKind::Authentication, detail.clone()),
            Error::MissingResource(detail) => (ErrorKind::MissingResource, detail.clone()),
            Error::QueueFull(queue) => (ErrorKind::QueueFull, queue.clone()),
            Error::InvalidTopic { .. } | Error::InvalidSelector { .. } => {
                (ErrorKind::InvalidRequest, err.to_string())
            }
            other => (ErrorKind::Other, other.to_string()),
        }
    }

    pub fn into_error(self, message: String) -> Error {
        match self {
            ErrorKind::Authentication => Error::Authentication(message),
            ErrorKind::MissingResource => Error::MissingResource(message),
            ErrorKind::QueueFull => Error::QueueFull(message),
            ErrorKind::InvalidRequest | ErrorKind::Other => Error::Broker(message),
        }
    }
}

impl ServerFrame {
    pub fn error(request: Option<u64>, message: impl Into<String>) -> Self {
        ServerFrame::Error {
            request,
            kind: ErrorKind::Other,
            message: message.into(),
        }
    }

    pub fn failure(request: Option<u64>, err: &Error) -> Self {
        let (kind, message) = ErrorKind::classify(err);
        ServerFrame::Error {
            request,
            kind,
            message,
        }
    }
}
