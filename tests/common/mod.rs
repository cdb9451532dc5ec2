// tests/common/mod.rs

//! Shared test doubles: an in-memory session factory, sessions and links
//! with injectable failures, and a recording token sender.

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use hubmux::config::{ClientConfig, TransportConfig};
use hubmux::core::credential::{AuthMethod, Credential};
use hubmux::core::errors::HubMuxError;
use hubmux::core::transport::{
    AmqpLink, AmqpSession, CloseCallback, LinkHandle, LinkSettings, SessionFactory, SessionHandle,
    TokenRequest, TokenSender,
};
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use url::Url;

pub struct MockLink {
    settings: LinkSettings,
    open: AtomicBool,
    fail_open: bool,
    open_calls: AtomicUsize,
    close_calls: AtomicUsize,
    on_closed: Mutex<Vec<CloseCallback>>,
}

impl std::fmt::Debug for MockLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockLink")
            .field("open", &self.open)
            .finish_non_exhaustive()
    }
}

impl MockLink {
    pub fn settings(&self) -> &LinkSettings {
        &self.settings
    }

    pub fn open_calls(&self) -> usize {
        self.open_calls.load(Ordering::SeqCst)
    }

    pub fn close_calls(&self) -> usize {
        self.close_calls.load(Ordering::SeqCst)
    }

    /// Simulates the peer detaching the link.
    pub fn fire_closed(&self) {
        self.open.store(false, Ordering::SeqCst);
        for callback in self.on_closed.lock().drain(..) {
            callback();
        }
    }
}

#[async_trait]
impl AmqpLink for MockLink {
    fn name(&self) -> &str {
        &self.settings.name
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    async fn open(&self, _timeout: Duration) -> Result<(), HubMuxError> {
        self.open_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_open {
            return Err(HubMuxError::Transport("injected link open failure".into()));
        }
        self.open.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn close(&self) {
        self.close_calls.fetch_add(1, Ordering::SeqCst);
        self.fire_closed();
    }

    fn on_closed(&self, callback: CloseCallback) {
        self.on_closed.lock().push(callback);
    }
}

#[derive(Debug)]
pub struct MockSession {
    open: AtomicBool,
    closed_token: CancellationToken,
    fail_link_open: AtomicBool,
    links: Mutex<Vec<Arc<MockLink>>>,
}

impl MockSession {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            open: AtomicBool::new(true),
            closed_token: CancellationToken::new(),
            fail_link_open: AtomicBool::new(false),
            links: Mutex::new(Vec::new()),
        })
    }

    pub fn handle(self: &Arc<Self>) -> SessionHandle {
        self.clone()
    }

    /// Simulates the peer or transport dropping the session.
    pub fn simulate_fault(&self) {
        self.open.store(false, Ordering::SeqCst);
        self.closed_token.cancel();
    }

    pub fn fail_link_open(&self, fail: bool) {
        self.fail_link_open.store(fail, Ordering::SeqCst);
    }

    pub fn links(&self) -> Vec<Arc<MockLink>> {
        self.links.lock().clone()
    }
}

#[async_trait]
impl AmqpSession for MockSession {
    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    fn closed(&self) -> BoxFuture<'static, ()> {
        Box::pin(self.closed_token.clone().cancelled_owned())
    }

    async fn attach_link(&self, settings: LinkSettings) -> Result<LinkHandle, HubMuxError> {
        if !self.is_open() {
            return Err(HubMuxError::Transport("session is closed".into()));
        }
        let link = Arc::new(MockLink {
            settings,
            open: AtomicBool::new(false),
            fail_open: self.fail_link_open.load(Ordering::SeqCst),
            open_calls: AtomicUsize::new(0),
            close_calls: AtomicUsize::new(0),
            on_closed: Mutex::new(Vec::new()),
        });
        self.links.lock().push(link.clone());
        Ok(link)
    }

    async fn close(&self) {
        self.open.store(false, Ordering::SeqCst);
        self.closed_token.cancel();
    }
}

pub struct MockFactory {
    sessions: Mutex<Vec<Arc<MockSession>>>,
    created: AtomicUsize,
    fail_next: AtomicUsize,
    create_delay: Mutex<Option<Duration>>,
}

impl MockFactory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            sessions: Mutex::new(Vec::new()),
            created: AtomicUsize::new(0),
            fail_next: AtomicUsize::new(0),
            create_delay: Mutex::new(None),
        })
    }

    pub fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    /// Makes the next `n` creation attempts fail.
    pub fn fail_next(&self, n: usize) {
        self.fail_next.store(n, Ordering::SeqCst);
    }

    /// Delays every creation attempt, to widen race windows.
    pub fn set_create_delay(&self, delay: Duration) {
        *self.create_delay.lock() = Some(delay);
    }

    pub fn sessions(&self) -> Vec<Arc<MockSession>> {
        self.sessions.lock().clone()
    }

    pub fn last_session(&self) -> Arc<MockSession> {
        self.sessions.lock().last().cloned().unwrap()
    }
}

#[async_trait]
impl SessionFactory for MockFactory {
    async fn create_session(
        &self,
        _endpoint: &Url,
        _transport: &TransportConfig,
        _timeout: Duration,
    ) -> Result<SessionHandle, HubMuxError> {
        let delay = *self.create_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(HubMuxError::Transport(
                "injected session creation failure".into(),
            ));
        }
        self.created.fetch_add(1, Ordering::SeqCst);
        let session = MockSession::new();
        self.sessions.lock().push(session.clone());
        Ok(session)
    }
}

pub struct MockTokenSender {
    attempts: AtomicUsize,
    audiences: Mutex<Vec<String>>,
    ttl: Mutex<Option<Duration>>,
    fail_next: AtomicUsize,
    fail_fatal: AtomicBool,
}

impl MockTokenSender {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            attempts: AtomicUsize::new(0),
            audiences: Mutex::new(Vec::new()),
            ttl: Mutex::new(Some(Duration::from_secs(10 * 60))),
            fail_next: AtomicUsize::new(0),
            fail_fatal: AtomicBool::new(false),
        })
    }

    /// Attempts, including failed ones.
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    /// Audiences of successful sends, in order.
    pub fn audiences(&self) -> Vec<String> {
        self.audiences.lock().clone()
    }

    /// Token lifetime reported for successful sends. `None` means the token
    /// never expires.
    pub fn set_ttl(&self, ttl: Option<Duration>) {
        *self.ttl.lock() = ttl;
    }

    pub fn fail_next(&self, n: usize, fatal: bool) {
        self.fail_fatal.store(fatal, Ordering::SeqCst);
        self.fail_next.store(n, Ordering::SeqCst);
    }
}

#[async_trait]
impl TokenSender for MockTokenSender {
    async fn send_token(
        &self,
        _session: &SessionHandle,
        request: &TokenRequest,
        _timeout: Duration,
    ) -> Result<Option<DateTime<Utc>>, HubMuxError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            if self.fail_fatal.load(Ordering::SeqCst) {
                return Err(HubMuxError::Fatal("injected fatal token failure".into()));
            }
            return Err(HubMuxError::Transport("injected token failure".into()));
        }
        self.audiences.lock().push(request.audience.clone());
        let ttl = *self.ttl.lock();
        Ok(ttl.map(|ttl| Utc::now() + chrono::Duration::from_std(ttl).unwrap()))
    }
}

/// Opt-in tracing for debugging a failing test: RUST_LOG=debug cargo test.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn hub_credential(host: &str) -> Credential {
    Credential {
        host_name: host.to_string(),
        endpoint: Url::parse(&format!("amqps://{host}:5671/")).unwrap(),
        device_id: None,
        auth: AuthMethod::SharedAccessKey {
            policy_name: Some("hub-owner".to_string()),
            key: "c2VjcmV0LWtleQ==".to_string(),
        },
    }
}

pub fn device_credential(host: &str, device_id: &str) -> Credential {
    Credential {
        host_name: host.to_string(),
        endpoint: Url::parse(&format!("amqps://{host}:5671/")).unwrap(),
        device_id: Some(device_id.to_string()),
        auth: AuthMethod::SharedAccessKey {
            policy_name: None,
            key: "ZGV2aWNlLWtleQ==".to_string(),
        },
    }
}

pub fn test_config(idle_timeout: Duration) -> ClientConfig {
    let mut config = ClientConfig::default();
    config.pooling.idle_timeout = idle_timeout;
    config
}

pub fn small_pool_config(
    idle_timeout: Duration,
    max_pools: usize,
    max_devices: usize,
    lightly_ceiling: usize,
    semi_ceiling: usize,
) -> ClientConfig {
    let mut config = test_config(idle_timeout);
    config.pooling.max_pools = max_pools;
    config.pooling.max_devices_per_connection = max_devices;
    config.pooling.lightly_loaded_ceiling = lightly_ceiling;
    config.pooling.semi_loaded_ceiling = semi_ceiling;
    config
}
