// src/core/tasks/mod.rs

//! Long-running background tasks: per-audience token renewal and idle
//! eviction.

pub(crate) mod reaper;
pub mod refresher;
