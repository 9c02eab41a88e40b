//! Per-stack advisory leases.
//!
//! An exclusive lease is a row in `stack_leases` naming its holder and
//! expiry. Holding it serializes operations on one stack across processes.
//! A shared hold (a row in `stack_holds`) pins a stack without serializing
//! other holders; leaf applies take one on their hub so the hub cannot be
//! re-applied or torn down underneath them. A crashed holder blocks the
//! stack until its row expires.

use crate::error::{HavenError, Result};
use crate::state::StateManager;
use crate::types::StackId;
use std::time::Duration;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Exclusive,
    Shared,
}

/// A held lease. Must be released explicitly.
pub(crate) struct Lease {
    stack_id: StackId,
    holder: String,
    mode: Mode,
}

impl Lease {
    /// Take the exclusive lease or fail fast with `StackBusy`.
    pub(crate) async fn acquire(state: &StateManager, stack_id: &StackId, ttl: Duration) -> Result<Self> {
        let holder = new_holder();
        if !state.try_acquire_lease(stack_id, &holder, ttl).await? {
            return Err(HavenError::StackBusy { stack_id: stack_id.to_string() });
        }
        debug!(stack_id = %stack_id, holder = %holder, "Acquired lease");
        Ok(Self { stack_id: stack_id.clone(), holder, mode: Mode::Exclusive })
    }

    /// Take a shared hold or fail fast with `StackBusy`.
    pub(crate) async fn acquire_shared(state: &StateManager, stack_id: &StackId, ttl: Duration) -> Result<Self> {
        let holder = new_holder();
        if !state.try_acquire_hold(stack_id, &holder, ttl).await? {
            return Err(HavenError::StackBusy { stack_id: stack_id.to_string() });
        }
        debug!(stack_id = %stack_id, holder = %holder, "Acquired shared hold");
        Ok(Self { stack_id: stack_id.clone(), holder, mode: Mode::Shared })
    }

    pub(crate) async fn release(self, state: &StateManager) {
        let released = match self.mode {
            Mode::Exclusive => state.release_lease(&self.stack_id, &self.holder).await,
            Mode::Shared => state.release_hold(&self.stack_id, &self.holder).await,
        };
        if let Err(e) = released {
            warn!(stack_id = %self.stack_id, mode = ?self.mode, "Failed to release lease: {}", e);
        }
    }
}

fn new_holder() -> String {
    format!("{}:{}", std::process::id(), uuid::Uuid::new_v4())
}
