// src/core/tasks/reaper.rs

//! Idle-eviction task for the connection cache.
//!
//! Entries never tear themselves down from inside a timer callback.
//! A decrement-to-zero enqueues an event here; the reaper holds it for the
//! idle window and then calls back into the cache's guarded eviction path,
//! where generation and count are re-validated, so a concurrent re-acquire
//! always wins the race against a firing timer.

use crate::connection::cache::ConnectionCache;
use crate::core::credential::CredentialKey;
use futures::StreamExt;
use std::sync::Weak;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::time::DelayQueue;
use tracing::debug;

/// A candidate eviction, tagged with the generation observed when the count
/// reached zero. A stale generation means the timer was logically cancelled.
#[derive(Debug)]
pub(crate) enum EvictionEvent {
    SharedIdle {
        key: CredentialKey,
        generation: u64,
    },
    MuxIdle {
        key: CredentialKey,
        mux_id: u64,
        generation: u64,
    },
}

pub(crate) struct IdleReaper {
    pub(crate) cache: Weak<ConnectionCache>,
    pub(crate) rx: mpsc::UnboundedReceiver<EvictionEvent>,
    pub(crate) idle_timeout: Duration,
    pub(crate) shutdown: CancellationToken,
}

impl IdleReaper {
    pub(crate) async fn run(mut self) {
        let mut queue: DelayQueue<EvictionEvent> = DelayQueue::new();
        debug!("idle reaper started");
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    debug!("idle reaper shutting down");
                    return;
                }
                event = self.rx.recv() => {
                    match event {
                        Some(event) => {
                            queue.insert(event, self.idle_timeout);
                        }
                        None => return,
                    }
                }
                Some(expired) = queue.next(), if !queue.is_empty() => {
                    let Some(cache) = self.cache.upgrade() else { return };
                    match expired.into_inner() {
                        EvictionEvent::SharedIdle { key, generation } => {
                            cache.evict_shared_if_idle(&key, generation);
                        }
                        EvictionEvent::MuxIdle { key, mux_id, generation } => {
                            cache.evict_mux_if_idle(&key, mux_id, generation);
                        }
                    }
                }
            }
        }
    }
}
