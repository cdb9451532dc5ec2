// src/connection/mux.rs

//! One multiplexed connection inside a device-scope pool, together with the
//! occupancy bookkeeping that decides which tier it sits in.

use crate::connection::amqp::AmqpConnection;
use crate::core::credential::CredentialKey;
use crate::core::tasks::reaper::EvictionEvent;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::debug;

/// Occupancy band of a multiplexed connection. The pool prefers handing out
/// lightly loaded connections and treats fully loaded ones as a last resort.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadTier {
    Lightly,
    Semi,
    Fully,
}

#[derive(Debug)]
struct MuxState {
    device_count: usize,
    // Bumped on every count transition away from or back to zero; an idle
    // timer armed under an older generation must not fire.
    generation: u64,
    evicted: bool,
}

pub struct MuxConnection {
    id: u64,
    key: CredentialKey,
    connection: Arc<AmqpConnection>,
    state: Mutex<MuxState>,
    evict_tx: mpsc::UnboundedSender<EvictionEvent>,
}

impl MuxConnection {
    pub(crate) fn new(
        id: u64,
        key: CredentialKey,
        connection: Arc<AmqpConnection>,
        evict_tx: mpsc::UnboundedSender<EvictionEvent>,
    ) -> Arc<Self> {
        Arc::new(Self {
            id,
            key,
            connection,
            state: Mutex::new(MuxState {
                device_count: 0,
                generation: 0,
                evicted: false,
            }),
            evict_tx,
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn connection(&self) -> &Arc<AmqpConnection> {
        &self.connection
    }

    pub fn device_count(&self) -> usize {
        self.state.lock().device_count
    }

    /// Claims a slot on this connection. Returns the new occupancy, or
    /// `None` if the connection has been evicted in the meantime.
    pub(crate) fn try_add_device(&self) -> Option<usize> {
        let mut state = self.state.lock();
        if state.evicted {
            return None;
        }
        if state.device_count == 0 {
            // Invalidate any idle timer armed for the zero-count window.
            state.generation += 1;
        }
        state.device_count += 1;
        Some(state.device_count)
    }

    /// Releases one slot. When the count reaches zero the idle clock for
    /// this connection starts.
    pub(crate) fn remove_device(&self) -> usize {
        let mut state = self.state.lock();
        state.device_count = state.device_count.saturating_sub(1);
        if state.device_count == 0 && !state.evicted {
            state.generation += 1;
            let _ = self.evict_tx.send(EvictionEvent::MuxIdle {
                key: self.key.clone(),
                mux_id: self.id,
                generation: state.generation,
            });
            debug!(mux_id = self.id, "multiplexed connection idle, eviction armed");
        }
        state.device_count
    }

    /// Confirms an idle timer. Fails when the connection was re-acquired
    /// (generation moved on or count rose) or already evicted.
    pub(crate) fn try_evict(&self, generation: u64) -> bool {
        let mut state = self.state.lock();
        if state.evicted || state.device_count > 0 || state.generation != generation {
            return false;
        }
        state.evicted = true;
        true
    }

    pub(crate) fn mark_evicted(&self) -> bool {
        let mut state = self.state.lock();
        if state.evicted {
            return false;
        }
        state.evicted = true;
        true
    }

    pub fn is_evicted(&self) -> bool {
        self.state.lock().evicted
    }
}
