// src/core/transport.rs

//! Seams toward the wire-level collaborators: the session factory that
//! negotiates transport and opens protocol sessions, and the token sender
//! that authorizes them. Framing, TLS, and WebSocket byte mechanics all
//! live behind these traits, outside this crate.

use crate::config::TransportConfig;
use crate::core::credential::{AccessRights, Credential};
use crate::core::errors::HubMuxError;
use crate::core::singleton::Recyclable;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use std::sync::Arc;
use std::time::Duration;
use url::Url;

/// A shareable handle to one protocol session.
pub type SessionHandle = Arc<dyn AmqpSession>;
/// A shareable handle to one send or receive link.
pub type LinkHandle = Arc<dyn AmqpLink>;
/// Callback invoked once when a link reports itself closed.
pub type CloseCallback = Box<dyn FnOnce() + Send>;

/// Direction of a link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkRole {
    Sender,
    Receiver,
}

/// When the receiving side settles deliveries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettleMode {
    First,
    Second,
}

/// Settings for attaching a link to a session.
#[derive(Debug, Clone)]
pub struct LinkSettings {
    /// Unique link name; readable in peer-side logs.
    pub name: String,
    pub role: LinkRole,
    /// Absolute address of the link's source (receiver) or target (sender).
    pub address: String,
    /// Link credit granted up front; receivers only.
    pub prefetch: u32,
    pub settle_mode: SettleMode,
}

impl LinkSettings {
    pub fn sender(address: String) -> Self {
        Self {
            name: unique_link_name(),
            role: LinkRole::Sender,
            address,
            prefetch: 0,
            settle_mode: SettleMode::First,
        }
    }

    pub fn receiver(address: String, prefetch: u32) -> Self {
        Self {
            name: unique_link_name(),
            role: LinkRole::Receiver,
            address,
            prefetch,
            settle_mode: SettleMode::Second,
        }
    }
}

fn unique_link_name() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

/// Everything this crate needs from a protocol session.
#[async_trait]
pub trait AmqpSession: Send + Sync + std::fmt::Debug {
    fn is_open(&self) -> bool;

    /// Completes when the session transitions to closed, whether by fault,
    /// peer close, or local close.
    fn closed(&self) -> BoxFuture<'static, ()>;

    /// Attaches a new, not-yet-opened link to this session.
    async fn attach_link(&self, settings: LinkSettings) -> Result<LinkHandle, HubMuxError>;

    async fn close(&self);
}

impl Recyclable for SessionHandle {
    fn is_open(&self) -> bool {
        AmqpSession::is_open(self.as_ref())
    }

    fn closed(&self) -> BoxFuture<'static, ()> {
        AmqpSession::closed(self.as_ref())
    }
}

/// Everything this crate needs from a link.
#[async_trait]
pub trait AmqpLink: Send + Sync + std::fmt::Debug {
    fn name(&self) -> &str;

    fn is_open(&self) -> bool;

    /// Performs the attach/open handshake with the peer.
    async fn open(&self, timeout: Duration) -> Result<(), HubMuxError>;

    async fn close(&self);

    /// Registers a callback fired once when the link closes. Ties a token
    /// refresh loop's lifetime to its link.
    fn on_closed(&self, callback: CloseCallback);
}

/// Opens protocol sessions over the configured transport.
#[async_trait]
pub trait SessionFactory: Send + Sync {
    async fn create_session(
        &self,
        endpoint: &Url,
        transport: &TransportConfig,
        timeout: Duration,
    ) -> Result<SessionHandle, HubMuxError>;
}

/// One token authorization request.
#[derive(Debug, Clone)]
pub struct TokenRequest {
    pub credential: Arc<Credential>,
    pub audience: String,
    pub resource: String,
    pub rights: AccessRights,
}

/// Sends security tokens over an open session. Returns the token's expiry;
/// `None` means the token never expires and needs no renewal.
#[async_trait]
pub trait TokenSender: Send + Sync {
    async fn send_token(
        &self,
        session: &SessionHandle,
        request: &TokenRequest,
        timeout: Duration,
    ) -> Result<Option<DateTime<Utc>>, HubMuxError>;
}
