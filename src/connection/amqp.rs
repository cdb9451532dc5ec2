// src/connection/amqp.rs

//! The base connection: owns one authorized protocol session through a
//! `FaultTolerantSingleton` and manufactures send/receive links on it.
//! How the connection authorizes itself and its links is pluggable via
//! `ScopePolicy`, selected at construction.

use crate::config::{TokenConfig, TransportConfig};
use crate::core::credential::{AccessRights, Credential};
use crate::core::errors::HubMuxError;
use crate::core::singleton::FaultTolerantSingleton;
use crate::core::tasks::refresher::TokenRefresher;
use crate::core::timeout::Budget;
use crate::core::transport::{
    LinkHandle, LinkSettings, SessionFactory, SessionHandle, TokenRequest, TokenSender,
};
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// How a connection authorizes itself and the links built on it.
#[async_trait]
pub trait ScopePolicy: Send + Sync {
    /// Runs once per successful session creation, before the session is
    /// handed to any caller.
    async fn on_session_created(
        &self,
        session: &SessionHandle,
        timeout: Duration,
    ) -> Result<(), HubMuxError>;

    /// Runs for each freshly attached link, before the link is opened.
    async fn authorize_link(
        &self,
        session: &SessionHandle,
        link: &LinkHandle,
        credential: &Arc<Credential>,
        audience: String,
        timeout: Duration,
    ) -> Result<(), HubMuxError>;

    /// Stops every renewal loop this scope has started.
    fn cancel_refreshers(&self);
}

pub struct AmqpConnection {
    credential: Arc<Credential>,
    session: FaultTolerantSingleton<SessionHandle>,
    scope: Arc<dyn ScopePolicy>,
}

impl AmqpConnection {
    pub fn new(
        credential: Arc<Credential>,
        transport: TransportConfig,
        factory: Arc<dyn SessionFactory>,
        scope: Arc<dyn ScopePolicy>,
    ) -> Arc<Self> {
        let create = {
            let credential = credential.clone();
            let scope = scope.clone();
            move |timeout: Duration| {
                let credential = credential.clone();
                let transport = transport.clone();
                let factory = factory.clone();
                let scope = scope.clone();
                let future: futures::future::BoxFuture<'static, Result<SessionHandle, HubMuxError>> =
                    Box::pin(async move {
                        let budget = Budget::new(timeout);
                        let session = factory
                            .create_session(&credential.endpoint, &transport, budget.check()?)
                            .await?;
                        // Authorize before the session becomes observable.
                        if let Err(err) = scope.on_session_created(&session, budget.check()?).await
                        {
                            session.close().await;
                            return Err(err);
                        }
                        Ok(session)
                    });
                future
            }
        };
        // The singleton's close callback is synchronous; the wire-level
        // close runs detached.
        let close = |session: SessionHandle| {
            tokio::spawn(async move { session.close().await });
        };
        Arc::new(Self {
            credential,
            session: FaultTolerantSingleton::new(create, close),
            scope,
        })
    }

    pub fn credential(&self) -> &Arc<Credential> {
        &self.credential
    }

    /// Warms the connection up by ensuring its session is open.
    pub async fn open(&self, timeout: Duration) -> Result<(), HubMuxError> {
        self.session.get_or_create(timeout).await.map(|_| ())
    }

    /// Closes the session and stops every renewal loop. Never propagates.
    pub fn close(&self) {
        self.scope.cancel_refreshers();
        self.session.close();
    }

    /// Closes after an unexpected condition, swallowing the error.
    pub fn safe_close(&self, err: &HubMuxError) {
        warn!(%err, host = %self.credential.host_name, "closing connection after error");
        self.close();
    }

    /// Opens a sending link addressed at `path`, authorized for
    /// `credential`.
    pub async fn create_sending_link(
        &self,
        path: &str,
        credential: &Arc<Credential>,
        timeout: Duration,
    ) -> Result<LinkHandle, HubMuxError> {
        let budget = Budget::new(timeout);
        let session = self.ensure_session(&budget).await?;
        let address = credential.link_address(path)?;
        let link = session
            .attach_link(LinkSettings::sender(address.to_string()))
            .await?;
        self.open_link(
            &session,
            &link,
            credential,
            credential.audience_for(path),
            &budget,
        )
        .await?;
        Ok(link)
    }

    /// Opens a receiving link with `prefetch` initial credit.
    pub async fn create_receiving_link(
        &self,
        path: &str,
        credential: &Arc<Credential>,
        timeout: Duration,
        prefetch: u32,
    ) -> Result<LinkHandle, HubMuxError> {
        let budget = Budget::new(timeout);
        let session = self.ensure_session(&budget).await?;
        let address = credential.link_address(path)?;
        let link = session
            .attach_link(LinkSettings::receiver(address.to_string(), prefetch))
            .await?;
        self.open_link(
            &session,
            &link,
            credential,
            credential.audience_for(path),
            &budget,
        )
        .await?;
        Ok(link)
    }

    /// Prefers an already open session over a (possibly contended) create.
    async fn ensure_session(&self, budget: &Budget) -> Result<SessionHandle, HubMuxError> {
        match self.session.try_get_opened() {
            Some(session) => Ok(session),
            None => self.session.get_or_create(budget.check()?).await,
        }
    }

    /// Authorizes and opens a freshly attached link. A half-open link never
    /// escapes: on non-fatal failure it is closed before the error
    /// propagates.
    async fn open_link(
        &self,
        session: &SessionHandle,
        link: &LinkHandle,
        credential: &Arc<Credential>,
        audience: String,
        budget: &Budget,
    ) -> Result<(), HubMuxError> {
        let result = async {
            self.scope
                .authorize_link(session, link, credential, audience, budget.check()?)
                .await?;
            link.open(budget.check()?).await
        }
        .await;
        if let Err(err) = result {
            if !err.is_fatal() {
                link.close().await;
            }
            return Err(err);
        }
        Ok(())
    }
}

/// Scope policy for a connection owned by one hub-level credential: the
/// session itself is authorized once, and links need no per-link token.
pub struct SharedScope {
    credential: Arc<Credential>,
    rights: AccessRights,
    sender: Arc<dyn TokenSender>,
    config: TokenConfig,
    refresher: Mutex<Option<Arc<TokenRefresher>>>,
}

impl SharedScope {
    pub fn new(
        credential: Arc<Credential>,
        rights: AccessRights,
        sender: Arc<dyn TokenSender>,
        config: TokenConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            credential,
            rights,
            sender,
            config,
            refresher: Mutex::new(None),
        })
    }

    fn hub_request(&self) -> TokenRequest {
        TokenRequest {
            credential: self.credential.clone(),
            audience: self.credential.host_name.clone(),
            resource: self.credential.resource(),
            rights: self.rights,
        }
    }
}

#[async_trait]
impl ScopePolicy for SharedScope {
    async fn on_session_created(
        &self,
        session: &SessionHandle,
        timeout: Duration,
    ) -> Result<(), HubMuxError> {
        let refresher = TokenRefresher::new(
            session.clone(),
            self.sender.clone(),
            self.hub_request(),
            self.config.clone(),
        );
        refresher.send_initial_token(timeout).await?;
        let previous = self.refresher.lock().replace(refresher);
        if let Some(previous) = previous {
            previous.cancel();
        }
        Ok(())
    }

    async fn authorize_link(
        &self,
        _session: &SessionHandle,
        _link: &LinkHandle,
        credential: &Arc<Credential>,
        _audience: String,
        _timeout: Duration,
    ) -> Result<(), HubMuxError> {
        // The session-level token covers every link under a hub-scope
        // credential.
        if !credential.is_hub_scope() {
            return Err(HubMuxError::InvalidCredential(
                "a shared connection requires a hub-scope credential".into(),
            ));
        }
        Ok(())
    }

    fn cancel_refreshers(&self) {
        if let Some(refresher) = self.refresher.lock().take() {
            refresher.cancel();
        }
    }
}

/// Scope policy for a multiplexed connection: every device link is
/// authorized lazily with its own token and renewal loop.
pub struct MuxScope {
    rights: AccessRights,
    sender: Arc<dyn TokenSender>,
    config: TokenConfig,
    max_links: usize,
    refreshers: Arc<DashMap<String, Arc<TokenRefresher>>>,
}

impl MuxScope {
    pub fn new(
        rights: AccessRights,
        sender: Arc<dyn TokenSender>,
        config: TokenConfig,
        max_links: usize,
    ) -> Arc<Self> {
        Arc::new(Self {
            rights,
            sender,
            config,
            max_links,
            refreshers: Arc::new(DashMap::new()),
        })
    }

    pub fn active_refreshers(&self) -> usize {
        self.refreshers.len()
    }
}

#[async_trait]
impl ScopePolicy for MuxScope {
    async fn on_session_created(
        &self,
        _session: &SessionHandle,
        _timeout: Duration,
    ) -> Result<(), HubMuxError> {
        // Links authorize lazily; only clear renewal loops left over from a
        // previous session incarnation.
        self.cancel_refreshers();
        Ok(())
    }

    async fn authorize_link(
        &self,
        session: &SessionHandle,
        link: &LinkHandle,
        credential: &Arc<Credential>,
        audience: String,
        timeout: Duration,
    ) -> Result<(), HubMuxError> {
        if credential.is_hub_scope() {
            return Err(HubMuxError::InvalidCredential(
                "a multiplexed connection requires a device-scope credential".into(),
            ));
        }
        if self.refreshers.len() >= self.max_links {
            return Err(HubMuxError::CapacityExhausted(format!(
                "connection already authorizes {} links",
                self.max_links
            )));
        }

        let request = TokenRequest {
            credential: credential.clone(),
            audience: audience.clone(),
            resource: credential.resource(),
            rights: self.rights,
        };
        let refresher = TokenRefresher::new(
            session.clone(),
            self.sender.clone(),
            request,
            self.config.clone(),
        );

        // The renewal loop must not outlive its link.
        {
            let refreshers = self.refreshers.clone();
            let audience = audience.clone();
            link.on_closed(Box::new(move || {
                if let Some((_, refresher)) = refreshers.remove(&audience) {
                    refresher.cancel();
                }
            }));
        }

        let inserted = match self.refreshers.entry(audience) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                // Another link for this audience already holds a fresh
                // token; skip the redundant send.
                false
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(refresher.clone());
                true
            }
        };
        if inserted {
            refresher.send_initial_token(timeout).await?;
        } else {
            debug!(audience = %refresher.audience(), "audience already authorized on this connection");
        }
        Ok(())
    }

    fn cancel_refreshers(&self) {
        for entry in self.refreshers.iter() {
            entry.value().cancel();
        }
        self.refreshers.clear();
    }
}
