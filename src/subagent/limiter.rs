//! Concurrency, total and depth budget for nested agent runs.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;

use crate::config::SubagentConfig;
use crate::error::{Result, WardenError};

/// Held for as long as a sub-agent runs; dropping it frees the slot.
#[derive(Debug)]
pub struct SubagentPermit {
    _slot: OwnedSemaphorePermit,
    depth: usize,
}

impl SubagentPermit {
    pub fn depth(&self) -> usize {
        self.depth
    }
}

/// Shared by every loop of one serving process.
///
/// Concurrency is global; the total budget is counted per root request (one
/// top-level user turn and everything it spawns).
#[derive(Debug)]
pub struct SubagentLimiter {
    slots: Arc<Semaphore>,
    max_concurrent: usize,
    max_total: usize,
    max_depth: usize,
    spawned: Mutex<HashMap<String, usize>>,
}

impl SubagentLimiter {
    pub fn new(config: &SubagentConfig) -> Self {
        let max_concurrent = config.max_concurrent.max(1);
        Self {
            slots: Arc::new(Semaphore::new(max_concurrent)),
            max_concurrent,
            max_total: config.max_total,
            max_depth: config.max_depth,
            spawned: Mutex::new(HashMap::new()),
        }
    }

    fn spawned(&self) -> MutexGuard<'_, HashMap<String, usize>> {
        self.spawned.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn max_depth(&self) -> usize {
        self.max_depth
    }

    /// Admit a sub-agent that would run at `child_depth` under `root_request_id`.
    ///
    /// Depth and total budget violations are rejected immediately. Otherwise
    /// this waits for a free slot, giving up (and returning the reserved
    /// total) if `cancel` fires first.
    pub async fn admit(
        &self,
        root_request_id: &str,
        child_depth: usize,
        cancel: &CancellationToken,
    ) -> Result<SubagentPermit> {
        if child_depth > self.max_depth {
            return Err(WardenError::SubagentLimitExceeded(format!(
                "maximum nesting depth {} reached",
                self.max_depth
            )));
        }

        {
            let mut spawned = self.spawned();
            let count = spawned.entry(root_request_id.to_string()).or_insert(0);
            if *count >= self.max_total {
                return Err(WardenError::SubagentLimitExceeded(format!(
                    "at most {} sub-agents per request",
                    self.max_total
                )));
            }
            *count += 1;
        }

        let acquired = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            permit = self.slots.clone().acquire_owned() => Some(permit),
        };
        match acquired {
            Some(Ok(slot)) => {
                tracing::debug!(root_request_id, depth = child_depth, active = self.active(), "sub-agent admitted");
                Ok(SubagentPermit {
                    _slot: slot,
                    depth: child_depth,
                })
            }
            Some(Err(_)) => {
                self.unreserve(root_request_id);
                Err(WardenError::InvalidState("sub-agent limiter closed".into()))
            }
            None => {
                self.unreserve(root_request_id);
                Err(WardenError::Canceled)
            }
        }
    }

    fn unreserve(&self, root_request_id: &str) {
        let mut spawned = self.spawned();
        if let Some(count) = spawned.get_mut(root_request_id) {
            *count = count.saturating_sub(1);
        }
    }

    /// Forget the total for a finished root request.
    pub fn release_root(&self, root_request_id: &str) {
        self.spawned().remove(root_request_id);
    }

    /// Sub-agents spawned so far under a root request.
    pub fn spawned_for(&self, root_request_id: &str) -> usize {
        self.spawned().get(root_request_id).copied().unwrap_or(0)
    }

    /// Sub-agents currently holding a slot.
    pub fn active(&self) -> usize {
        self.max_concurrent - self.slots.available_permits()
    }
}
