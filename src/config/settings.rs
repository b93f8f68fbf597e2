use std::collections::HashMap;

use serde::Deserialize;

/// Top-level configuration for both sides of the system.
///
/// The client SDK reads `service`, `authentication`, `tls`, `retry`,
/// `publisher` and `receiver`; the reference broker reads `broker`.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct Settings {
    pub service: ServiceSettings,
    pub authentication: AuthenticationSettings,
    pub tls: TlsSettings,
    pub retry: RetrySettings,
    pub publisher: PublisherSettings,
    pub receiver: ReceiverSettings,
    pub broker: BrokerSettings,
}

/// Broker endpoint the client connects to.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct ServiceSettings {
    pub host: String,
    pub port: u16,
    pub vpn_name: String,
    /// Generated when absent.
    pub client_name: Option<String>,
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AuthScheme {
    Basic,
    OAuth2,
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct AuthenticationSettings {
    pub scheme: AuthScheme,
    pub username: String,
    pub password: String,
    pub access_token: Option<String>,
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct TlsSettings {
    pub enabled: bool,
}

/// Retry counts use `-1` for "forever" and `0` for "never".
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct RetrySettings {
    pub connection_retries: i32,
    pub reconnection_retries: i32,
    pub retry_interval_ms: u64,
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum BackPressureKind {
    Reject,
    Wait,
    Elastic,
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct PublisherSettings {
    pub back_pressure: BackPressureKind,
    pub buffer_capacity: usize,
    pub ack_timeout_ms: u64,
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct ReceiverSettings {
    /// Local buffer limit for direct receivers. `0` means unbounded.
    pub buffer_capacity: usize,
    /// Unacknowledged messages the broker may push to one persistent receiver.
    pub window_size: usize,
    pub reply_timeout_ms: u64,
}

/// Settings for the reference broker.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct BrokerSettings {
    pub host: String,
    pub port: u16,
    pub max_connections: usize,
    pub message_ttl_secs: u64,
    /// Directory of the sled spool. Durable queues are memory-only when absent.
    pub spool_path: Option<String>,
    pub max_messages_per_queue: usize,
    pub max_redeliveries: u32,
    pub redelivery_timeout_ms: u64,
    pub jwt_secret: String,
    pub users: HashMap<String, String>,
}

/// Partial configuration loaded from files or environment.
///
/// Every field is optional; missing values are filled from `Settings::default()`.
#[derive(Debug, Deserialize, Default)]
pub struct PartialSettings {
    pub service: Option<PartialServiceSettings>,
    pub authentication: Option<PartialAuthenticationSettings>,
    pub tls: Option<PartialTlsSettings>,
    pub retry: Option<PartialRetrySettings>,
    pub publisher: Option<PartialPublisherSettings>,
    pub receiver: Option<PartialReceiverSettings>,
    pub broker: Option<PartialBrokerSettings>,
}

#[derive(Debug, Deserialize)]
pub struct PartialServiceSettings {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub vpn_name: Option<String>,
    pub client_name: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct PartialAuthenticationSettings {
    pub scheme: Option<AuthScheme>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub access_token: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct PartialTlsSettings {
    pub enabled: Option<bool>,
}

#[derive(Debug, Deserialize)]
pub struct PartialRetrySettings {
    pub connection_retries: Option<i32>,
    pub reconnection_retries: Option<i32>,
    pub retry_interval_ms: Option<u64>,
}

#[derive(Debug, Deserialize)]
pub struct PartialPublisherSettings {
    pub back_pressure: Option<BackPressureKind>,
    pub buffer_capacity: Option<usize>,
    pub ack_timeout_ms: Option<u64>,
}

#[derive(Debug, Deserialize)]
pub struct PartialReceiverSettings {
    pub buffer_capacity: Option<usize>,
    pub window_size: Option<usize>,
    pub reply_timeout_ms: Option<u64>,
}

#[derive(Debug, Deserialize)]
pub struct PartialBrokerSettings {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub max_connections: Option<usize>,
    pub message_ttl_secs: Option<u64>,
    pub spool_path: Option<String>,
    pub max_messages_per_queue: Option<usize>,
    pub max_redeliveries: Option<u32>,
    pub redelivery_timeout_ms: Option<u64>,
    pub jwt_secret: Option<String>,
    pub users: Option<HashMap<String, String>>,
}

impl PartialSettings {
    /// Overlay whatever was specified on top of `defaults`.
    pub fn merge_over(self, defaults: Settings) -> Settings {
        let Settings {
            service,
            authentication,
            tls,
            retry,
            publisher,
            receiver,
            broker,
        } = defaults;

        Settings {
            service: match self.service {
                Some(p) => ServiceSettings {
                    host: p.host.unwrap_or(service.host),
                    port: p.port.unwrap_or(service.port),
                    vpn_name: p.vpn_name.unwrap_or(service.vpn_name),
                    client_name: p.client_name.or(service.client_name),
                },
                None => service,
            },
            authentication: match self.authentication {
                Some(p) => AuthenticationSettings {
                    scheme: p.scheme.unwrap_or(authentication.scheme),
                    username: p.username.unwrap_or(authentication.username),
                    password: p.password.unwrap_or(authentication.password),
                    access_token: p.access_token.or(authentication.access_token),
                },
                None => authentication,
            },
            tls: match self.tls {
                Some(p) => TlsSettings {
                    enabled: p.enabled.unwrap_or(tls.enabled),
                },
                None => tls,
            },
            retry: match self.retry {
                Some(p) => RetrySettings {
                    connection_retries: p.connection_retries.unwrap_or(retry.connection_retries),
                    reconnection_retries: p
                        .reconnection_retries
                        .unwrap_or(retry.reconnection_retries),
                    retry_interval_ms: p.retry_interval_ms.unwrap_or(retry.retry_interval_ms),
                },
                None => retry,
            },
            publisher: match self.publisher {
                Some(p) => PublisherSettings {
                    back_pressure: p.back_pressure.unwrap_or(publisher.back_pressure),
                    buffer_capacity: p.buffer_capacity.unwrap_or(publisher.buffer_capacity),
                    ack_timeout_ms: p.ack_timeout_ms.unwrap_or(publisher.ack_timeout_ms),
                },
                None => publisher,
            },
            receiver: match self.receiver {
                Some(p) => ReceiverSettings {
                    buffer_capacity: p.buffer_capacity.unwrap_or(receiver.buffer_capacity),
                    window_size: p.window_size.unwrap_or(receiver.window_size),
                    reply_timeout_ms: p.reply_timeout_ms.unwrap_or(receiver.reply_timeout_ms),
                },
                None => receiver,
            },
            broker: match self.broker {
                Some(p) => BrokerSettings {
                    host: p.host.unwrap_or(broker.host),
                    port: p.port.unwrap_or(broker.port),
                    max_connections: p.max_connections.unwrap_or(broker.max_connections),
                    message_ttl_secs: p.message_ttl_secs.unwrap_or(broker.message_ttl_secs),
                    spool_path: p.spool_path.or(broker.spool_path),
                    max_messages_per_queue: p
                        .max_messages_per_queue
                        .unwrap_or(broker.max_messages_per_queue),
                    max_redeliveries: p.max_redeliveries.unwrap_or(broker.max_redeliveries),
                    redelivery_timeout_ms: p
                        .redelivery_timeout_ms
                        .unwrap_or(broker.redelivery_timeout_ms),
                    jwt_secret: p.jwt_secret.unwrap_or(broker.jwt_secret),
                    users: p.users.unwrap_or(broker.users),
                },
                None => broker,
            },
        }
    }
}

impl Default for ServiceSettings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
            vpn_name: "default".to_string(),
            client_name: None,
        }
    }
}

impl Default for AuthenticationSettings {
    fn default() -> Self {
        Self {
            scheme: AuthScheme::Basic,
            username: "admin".to_string(),
            password: "password".to_string(),
            access_token: None,
        }
    }
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            connection_retries: 0,
            reconnection_retries: 3,
            retry_interval_ms: 3000,
        }
    }
}

impl Default for PublisherSettings {
    fn default() -> Self {
        Self {
            back_pressure: BackPressureKind::Elastic,
            buffer_capacity: 1000,
            ack_timeout_ms: 10_000,
        }
    }
}

impl Default for ReceiverSettings {
    fn default() -> Self {
        Self {
            buffer_capacity: 0,
            window_size: 255,
            reply_timeout_ms: 10_000,
        }
    }
}

impl Default for BrokerSettings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
            max_connections: 1000,
            message_ttl_secs: 3600,
            spool_path: None,
            max_messages_per_queue: 10_000,
            max_redeliveries: 5,
            redelivery_timeout_ms: 60_000,
            jwt_secret: "relaymq-dev-secret".to_string(),
            users: HashMap::from([("admin".to_string(), "password".to_string())]),
        }
    }
}

/// Provides default values for `Settings`.
impl Default for Settings {
    fn default() -> Self {
        Self {
            service: ServiceSettings::default(),
            authentication: AuthenticationSettings::default(),
            tls: TlsSettings { enabled: false },
            retry: RetrySettings::default(),
            publisher: PublisherSettings::default(),
            receiver: ReceiverSettings::default(),
            broker: BrokerSettings::default(),
        }
    }
}
