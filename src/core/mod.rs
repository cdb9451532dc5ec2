// src/core/mod.rs

//! Leaf types of the connection fabric: errors, credentials, the
//! fault-tolerant resource slot, and the collaborator seams.

pub mod credential;
pub mod errors;
pub mod singleton;
pub mod tasks;
pub mod timeout;
pub mod transport;

pub use errors::HubMuxError;
