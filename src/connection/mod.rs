// src/connection/mod.rs

//! Connection fabric: the base connection and its scope policies, the
//! shared-connection cache, and device-scope multiplexing pools.

pub mod amqp;
pub(crate) mod cache;
pub mod mux;
pub mod pool;

pub use amqp::{AmqpConnection, MuxScope, ScopePolicy, SharedScope};
pub use cache::{ConnectionCache, PooledConnection};
pub use mux::{LoadTier, MuxConnection};
pub use pool::DeviceScopeConnectionPool;
