// src/connection/cache.rs

//! Process-wide connection cache.
//!
//! Hub-scope credentials share one reference-counted connection per cache
//! key. Device-scope credentials go through a pool of multiplexed
//! connections instead. Acquisition hands back a `PooledConnection` lease
//! whose drop releases the underlying slot; a slot at zero references is
//! not torn down inline but handed to the idle reaper, which re-validates
//! before evicting.

use crate::config::{ClientConfig, TransportConfig};
use crate::connection::amqp::{AmqpConnection, SharedScope};
use crate::connection::mux::MuxConnection;
use crate::connection::pool::DeviceScopeConnectionPool;
use crate::core::credential::{AccessRights, Credential, CredentialKey};
use crate::core::errors::HubMuxError;
use crate::core::tasks::reaper::{EvictionEvent, IdleReaper};
use crate::core::transport::{LinkHandle, SessionFactory, TokenSender};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

#[derive(Debug)]
struct RefState {
    ref_count: usize,
    // Bumped on every transition into and out of the zero-reference state.
    generation: u64,
    evicted: bool,
}

/// A shared connection plus the reference bookkeeping that drives its idle
/// eviction.
pub(crate) struct CachedEntry {
    key: CredentialKey,
    connection: Arc<AmqpConnection>,
    state: Mutex<RefState>,
    evict_tx: mpsc::UnboundedSender<EvictionEvent>,
}

impl CachedEntry {
    fn new(
        key: CredentialKey,
        connection: Arc<AmqpConnection>,
        evict_tx: mpsc::UnboundedSender<EvictionEvent>,
    ) -> Arc<Self> {
        Arc::new(Self {
            key,
            connection,
            state: Mutex::new(RefState {
                ref_count: 0,
                generation: 0,
                evicted: false,
            }),
            evict_tx,
        })
    }

    pub(crate) fn connection(&self) -> &Arc<AmqpConnection> {
        &self.connection
    }

    /// Claims a reference. Fails if the entry has already been evicted, in
    /// which case the caller must install a fresh entry.
    fn try_add_ref(&self) -> bool {
        let mut state = self.state.lock();
        if state.evicted {
            return false;
        }
        if state.ref_count == 0 {
            state.generation += 1;
        }
        state.ref_count += 1;
        true
    }

    /// Drops a reference. At zero the idle clock starts.
    pub(crate) fn release(&self) {
        let mut state = self.state.lock();
        state.ref_count = state.ref_count.saturating_sub(1);
        if state.ref_count == 0 && !state.evicted {
            state.generation += 1;
            let _ = self.evict_tx.send(EvictionEvent::SharedIdle {
                key: self.key.clone(),
                generation: state.generation,
            });
            debug!(host = self.key.host_name(), "shared connection idle, eviction armed");
        }
    }

    /// Confirms an idle timer against the current state.
    fn try_evict(&self, generation: u64) -> bool {
        let mut state = self.state.lock();
        if state.evicted || state.ref_count > 0 || state.generation != generation {
            return false;
        }
        state.evicted = true;
        true
    }

    fn mark_evicted(&self) -> bool {
        let mut state = self.state.lock();
        if state.evicted {
            return false;
        }
        state.evicted = true;
        true
    }

    #[cfg(test)]
    pub(crate) fn ref_count(&self) -> usize {
        self.state.lock().ref_count
    }
}

enum Lease {
    Shared(Arc<CachedEntry>),
    Mux {
        pool: Arc<DeviceScopeConnectionPool>,
        mux: Arc<MuxConnection>,
    },
}

/// A live claim on a cached connection. Dropping the lease releases the
/// claim; the connection itself stays cached until its idle window expires.
pub struct PooledConnection {
    credential: Arc<Credential>,
    inner: Lease,
}

impl std::fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConnection")
            .field("credential", &self.credential)
            .finish_non_exhaustive()
    }
}

impl PooledConnection {
    pub fn connection(&self) -> &Arc<AmqpConnection> {
        match &self.inner {
            Lease::Shared(entry) => entry.connection(),
            Lease::Mux { mux, .. } => mux.connection(),
        }
    }

    pub fn credential(&self) -> &Arc<Credential> {
        &self.credential
    }

    /// Ensures the underlying session is open.
    pub async fn open(&self, timeout: Duration) -> Result<(), HubMuxError> {
        self.connection().open(timeout).await
    }

    pub async fn open_sending_link(
        &self,
        path: &str,
        timeout: Duration,
    ) -> Result<LinkHandle, HubMuxError> {
        self.connection()
            .create_sending_link(path, &self.credential, timeout)
            .await
    }

    pub async fn open_receiving_link(
        &self,
        path: &str,
        timeout: Duration,
        prefetch: u32,
    ) -> Result<LinkHandle, HubMuxError> {
        self.connection()
            .create_receiving_link(path, &self.credential, timeout, prefetch)
            .await
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        match &self.inner {
            Lease::Shared(entry) => entry.release(),
            Lease::Mux { pool, mux } => pool.release(mux),
        }
    }
}

pub struct ConnectionCache {
    shared: DashMap<CredentialKey, Arc<CachedEntry>>,
    pools: DashMap<CredentialKey, Arc<DeviceScopeConnectionPool>>,
    factory: Arc<dyn SessionFactory>,
    token_sender: Arc<dyn TokenSender>,
    config: ClientConfig,
    evict_tx: mpsc::UnboundedSender<EvictionEvent>,
    cancel: CancellationToken,
    disposed: AtomicBool,
}

impl ConnectionCache {
    /// Builds a cache and spawns its idle reaper. The reaper holds only a
    /// weak handle, so dropping the last `Arc` ends it as well.
    pub fn new(
        factory: Arc<dyn SessionFactory>,
        token_sender: Arc<dyn TokenSender>,
        config: ClientConfig,
    ) -> Arc<Self> {
        let (evict_tx, evict_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let cache = Arc::new(Self {
            shared: DashMap::new(),
            pools: DashMap::new(),
            factory,
            token_sender,
            config,
            evict_tx,
            cancel: cancel.clone(),
            disposed: AtomicBool::new(false),
        });
        let reaper = IdleReaper {
            cache: Arc::downgrade(&cache),
            rx: evict_rx,
            idle_timeout: cache.config.pooling.idle_timeout,
            shutdown: cancel,
        };
        tokio::spawn(reaper.run());
        cache
    }

    /// Acquires a lease on a connection for `credential`. Synchronous: the
    /// session itself is established lazily on first use of the lease.
    pub fn acquire_connection(
        self: &Arc<Self>,
        credential: &Credential,
        rights: AccessRights,
        transport: &TransportConfig,
    ) -> Result<PooledConnection, HubMuxError> {
        if self.disposed.load(Ordering::SeqCst) {
            return Err(HubMuxError::Disposed);
        }
        let credential = Arc::new(credential.clone());
        if credential.is_hub_scope() {
            self.acquire_shared(credential, rights, transport)
        } else {
            self.acquire_pooled(credential, rights, transport)
        }
    }

    fn acquire_shared(
        self: &Arc<Self>,
        credential: Arc<Credential>,
        rights: AccessRights,
        transport: &TransportConfig,
    ) -> Result<PooledConnection, HubMuxError> {
        let key = credential.key();
        loop {
            let entry = self
                .shared
                .entry(key.clone())
                .or_insert_with(|| {
                    debug!(host = %credential.host_name, "caching new shared connection");
                    let scope = SharedScope::new(
                        credential.clone(),
                        rights,
                        self.token_sender.clone(),
                        self.config.tokens.clone(),
                    );
                    let connection = AmqpConnection::new(
                        credential.clone(),
                        transport.clone(),
                        self.factory.clone(),
                        scope,
                    );
                    CachedEntry::new(key.clone(), connection, self.evict_tx.clone())
                })
                .clone();
            if entry.try_add_ref() {
                return Ok(PooledConnection {
                    credential,
                    inner: Lease::Shared(entry),
                });
            }
            // Lost the race against eviction; drop the dead entry and retry.
            self.shared
                .remove_if(&key, |_, current| Arc::ptr_eq(current, &entry));
        }
    }

    fn acquire_pooled(
        self: &Arc<Self>,
        credential: Arc<Credential>,
        rights: AccessRights,
        transport: &TransportConfig,
    ) -> Result<PooledConnection, HubMuxError> {
        let key = credential.key();
        loop {
            let pool = self
                .pools
                .entry(key.clone())
                .or_insert_with(|| {
                    debug!(host = %credential.host_name, "creating device-scope pool");
                    DeviceScopeConnectionPool::new(
                        key.clone(),
                        credential.clone(),
                        rights,
                        self.factory.clone(),
                        self.token_sender.clone(),
                        transport.clone(),
                        self.config.clone(),
                        self.evict_tx.clone(),
                    )
                })
                .clone();
            match pool.admit()? {
                Some(mux) => {
                    return Ok(PooledConnection {
                        credential,
                        inner: Lease::Mux { pool, mux },
                    });
                }
                None => {
                    // The pool closed after its last connection was evicted.
                    self.pools
                        .remove_if(&key, |_, current| Arc::ptr_eq(current, &pool));
                }
            }
        }
    }

    /// Explicit form of dropping the lease.
    pub fn release_connection(&self, connection: PooledConnection) {
        drop(connection);
    }

    /// Eviction callback for a shared connection whose idle window expired.
    pub(crate) fn evict_shared_if_idle(&self, key: &CredentialKey, generation: u64) {
        let Some(entry) = self.shared.get(key).map(|e| e.value().clone()) else {
            return;
        };
        if !entry.try_evict(generation) {
            return;
        }
        self.shared
            .remove_if(key, |_, current| Arc::ptr_eq(current, &entry));
        info!(host = key.host_name(), "evicting idle shared connection");
        entry.connection().close();
    }

    /// Eviction callback for a multiplexed connection. Removes the pool as
    /// well once its last connection is gone.
    pub(crate) fn evict_mux_if_idle(&self, key: &CredentialKey, mux_id: u64, generation: u64) {
        let Some(pool) = self.pools.get(key).map(|p| p.value().clone()) else {
            return;
        };
        if pool.evict_if_idle(mux_id, generation) && pool.is_closed() {
            self.pools
                .remove_if(key, |_, current| Arc::ptr_eq(current, &pool));
        }
    }

    /// Tears down every cached connection. Leases handed out earlier stay
    /// valid as handles but their connections are closed. Idempotent.
    pub fn shutdown(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("shutting down connection cache");
        self.cancel.cancel();
        for entry in self.shared.iter() {
            if entry.value().mark_evicted() {
                entry.value().connection().close();
            }
        }
        self.shared.clear();
        for pool in self.pools.iter() {
            pool.value().close_all();
        }
        self.pools.clear();
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    /// Number of cached shared connections.
    pub fn shared_len(&self) -> usize {
        self.shared.len()
    }

    /// Number of live device-scope pools.
    pub fn pool_len(&self) -> usize {
        self.pools.len()
    }

    /// The pool serving `credential`, if one exists.
    pub fn device_pool(&self, credential: &Credential) -> Option<Arc<DeviceScopeConnectionPool>> {
        self.pools.get(&credential.key()).map(|p| p.value().clone())
    }
}

impl Drop for ConnectionCache {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
