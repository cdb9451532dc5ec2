// src/connection/pool.rs

//! Pool of multiplexed connections for one device-scope credential family.
//!
//! Connections are kept in three occupancy tiers. Admission drains the
//! lightly loaded tier first, then grows the pool while capacity remains,
//! then falls back to busier tiers. Only when every connection hosts its
//! maximum number of devices does admission fail.

use crate::config::{ClientConfig, TransportConfig};
use crate::connection::amqp::{AmqpConnection, MuxScope};
use crate::connection::mux::{LoadTier, MuxConnection};
use crate::core::credential::{AccessRights, Credential, CredentialKey};
use crate::core::errors::HubMuxError;
use crate::core::tasks::reaper::EvictionEvent;
use crate::core::transport::{SessionFactory, TokenSender};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;
use tracing::{debug, info};

#[derive(Default)]
struct PoolState {
    lightly: HashMap<u64, Arc<MuxConnection>>,
    semi: HashMap<u64, Arc<MuxConnection>>,
    fully: HashMap<u64, Arc<MuxConnection>>,
    closed: bool,
}

impl PoolState {
    fn total(&self) -> usize {
        self.lightly.len() + self.semi.len() + self.fully.len()
    }

    fn tier_mut(&mut self, tier: LoadTier) -> &mut HashMap<u64, Arc<MuxConnection>> {
        match tier {
            LoadTier::Lightly => &mut self.lightly,
            LoadTier::Semi => &mut self.semi,
            LoadTier::Fully => &mut self.fully,
        }
    }

    fn remove(&mut self, id: u64) -> Option<Arc<MuxConnection>> {
        self.lightly
            .remove(&id)
            .or_else(|| self.semi.remove(&id))
            .or_else(|| self.fully.remove(&id))
    }

    fn drain(&mut self) -> Vec<Arc<MuxConnection>> {
        self.lightly
            .drain()
            .chain(self.semi.drain())
            .chain(self.fully.drain())
            .map(|(_, mux)| mux)
            .collect()
    }
}

pub struct DeviceScopeConnectionPool {
    key: CredentialKey,
    // Any credential of the family works for establishing sessions; only
    // the endpoint and transport matter at that level.
    credential: Arc<Credential>,
    rights: AccessRights,
    factory: Arc<dyn SessionFactory>,
    token_sender: Arc<dyn TokenSender>,
    transport: TransportConfig,
    config: ClientConfig,
    evict_tx: mpsc::UnboundedSender<EvictionEvent>,
    state: Mutex<PoolState>,
    next_id: AtomicU64,
}

impl DeviceScopeConnectionPool {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        key: CredentialKey,
        credential: Arc<Credential>,
        rights: AccessRights,
        factory: Arc<dyn SessionFactory>,
        token_sender: Arc<dyn TokenSender>,
        transport: TransportConfig,
        config: ClientConfig,
        evict_tx: mpsc::UnboundedSender<EvictionEvent>,
    ) -> Arc<Self> {
        Arc::new(Self {
            key,
            credential,
            rights,
            factory,
            token_sender,
            transport,
            config,
            evict_tx,
            state: Mutex::new(PoolState::default()),
            next_id: AtomicU64::new(0),
        })
    }

    fn tier_for(&self, count: usize) -> LoadTier {
        let pooling = &self.config.pooling;
        if count < pooling.lightly_loaded_ceiling {
            LoadTier::Lightly
        } else if count < pooling.semi_loaded_ceiling {
            LoadTier::Semi
        } else {
            LoadTier::Fully
        }
    }

    /// Claims a device slot on some connection in the pool, creating a new
    /// connection when the pool has room to grow. `Ok(None)` means the pool
    /// has been closed and the caller must fetch a fresh pool.
    pub(crate) fn admit(&self) -> Result<Option<Arc<MuxConnection>>, HubMuxError> {
        let mut state = self.state.lock();
        if state.closed {
            return Ok(None);
        }

        let max_devices = self.config.pooling.max_devices_per_connection;
        let mut candidate = state.lightly.values().next().cloned();
        if candidate.is_none() && state.total() < self.config.pooling.max_pools {
            let mux = self.new_connection();
            state.lightly.insert(mux.id(), mux.clone());
            debug!(
                mux_id = mux.id(),
                total = state.total(),
                "created multiplexed connection"
            );
            candidate = Some(mux);
        }
        if candidate.is_none() {
            candidate = state.semi.values().next().cloned();
        }
        if candidate.is_none() {
            candidate = state
                .fully
                .values()
                .find(|mux| mux.device_count() < max_devices)
                .cloned();
        }

        let Some(mux) = candidate else {
            return Err(HubMuxError::CapacityExhausted(format!(
                "every connection in the pool hosts {max_devices} devices"
            )));
        };

        let previous = mux.device_count();
        // Eviction marks and removes under this same lock, so a connection
        // still present in a tier map accepts the device.
        let Some(current) = mux.try_add_device() else {
            return Err(HubMuxError::Internal(
                "pooled connection evicted while registered".into(),
            ));
        };
        self.reclassify(&mut state, &mux, previous, current);
        Ok(Some(mux))
    }

    /// Returns a device slot. A connection dropping to zero devices starts
    /// its idle clock inside `MuxConnection::remove_device`.
    pub(crate) fn release(&self, mux: &Arc<MuxConnection>) {
        let mut state = self.state.lock();
        let previous = mux.device_count();
        let current = mux.remove_device();
        if !state.closed {
            self.reclassify(&mut state, mux, previous, current);
        }
    }

    fn reclassify(
        &self,
        state: &mut PoolState,
        mux: &Arc<MuxConnection>,
        previous: usize,
        current: usize,
    ) {
        let from = self.tier_for(previous);
        let to = self.tier_for(current);
        if from == to {
            return;
        }
        if state.tier_mut(from).remove(&mux.id()).is_some() {
            state.tier_mut(to).insert(mux.id(), mux.clone());
        }
    }

    /// Eviction path entered from the reaper. Returns true when the pool
    /// itself became empty and was closed.
    pub(crate) fn evict_if_idle(&self, mux_id: u64, generation: u64) -> bool {
        let (victim, pool_closed) = {
            let mut state = self.state.lock();
            let Some(mux) = state
                .lightly
                .get(&mux_id)
                .or_else(|| state.semi.get(&mux_id))
                .or_else(|| state.fully.get(&mux_id))
                .cloned()
            else {
                return false;
            };
            if !mux.try_evict(generation) {
                return false;
            }
            state.remove(mux_id);
            if state.total() == 0 {
                state.closed = true;
            }
            (mux, state.closed)
        };
        info!(mux_id, pool_closed, "evicting idle multiplexed connection");
        victim.connection().close();
        pool_closed
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Closes every connection and marks the pool closed. Idempotent.
    pub(crate) fn close_all(&self) {
        let victims = {
            let mut state = self.state.lock();
            state.closed = true;
            state.drain()
        };
        for mux in victims {
            if mux.mark_evicted() {
                mux.connection().close();
            }
        }
    }

    fn new_connection(&self) -> Arc<MuxConnection> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let scope = MuxScope::new(
            self.rights,
            self.token_sender.clone(),
            self.config.tokens.clone(),
            self.config.pooling.max_devices_per_connection,
        );
        let connection = AmqpConnection::new(
            self.credential.clone(),
            self.transport.clone(),
            self.factory.clone(),
            scope,
        );
        MuxConnection::new(id, self.key.clone(), connection, self.evict_tx.clone())
    }

    /// Current connection count per tier, for observability and tests.
    pub fn tier_sizes(&self) -> (usize, usize, usize) {
        let state = self.state.lock();
        (state.lightly.len(), state.semi.len(), state.fully.len())
    }

    /// Per-connection occupancy and tier membership.
    pub fn snapshot(&self) -> Vec<(u64, usize, LoadTier)> {
        let state = self.state.lock();
        let mut out = Vec::with_capacity(state.total());
        for (tier, map) in [
            (LoadTier::Lightly, &state.lightly),
            (LoadTier::Semi, &state.semi),
            (LoadTier::Fully, &state.fully),
        ] {
            for mux in map.values() {
                out.push((mux.id(), mux.device_count(), tier));
            }
        }
        out
    }

    pub fn connection_count(&self) -> usize {
        self.state.lock().total()
    }
}
