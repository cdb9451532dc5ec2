// src/core/timeout.rs

//! A small helper for spending one timeout budget across several awaits.

use crate::core::errors::HubMuxError;
use std::time::Duration;
use tokio::time::Instant;

/// Tracks a single operation-wide deadline so each successive sub-operation
/// (session open, token send, link open) only sees the time that is left.
#[derive(Debug, Clone, Copy)]
pub struct Budget {
    total: Duration,
    deadline: Instant,
}

impl Budget {
    pub fn new(total: Duration) -> Self {
        Self {
            total,
            deadline: Instant::now() + total,
        }
    }

    /// Time left in the budget, saturating at zero.
    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    /// Time left, or a `Timeout` error once the budget is spent.
    pub fn check(&self) -> Result<Duration, HubMuxError> {
        let left = self.remaining();
        if left.is_zero() {
            Err(HubMuxError::Timeout(self.total))
        } else {
            Ok(left)
        }
    }

    pub fn total(&self) -> Duration {
        self.total
    }
}
