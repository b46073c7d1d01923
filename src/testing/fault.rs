//! Fault injection for the in-memory collaborators.
//!
//! Each collaborator call passes through a named fault point before
//! touching its data. Tests arm a point to make the next N calls fail with
//! a transient store error, which is how page retries and crash/resume
//! paths are exercised.
//!
//! # Example
//!
//! ```rust
//! use unmerge::testing::{FaultAction, FaultInjector};
//!
//! let faults = FaultInjector::new();
//! faults.enable("hash_locks.reassign", FaultAction::FailTimes(1));
//!
//! assert!(faults.check("hash_locks.reassign", "hash_locks").is_err());
//! assert!(faults.check("hash_locks.reassign", "hash_locks").is_ok());
//! ```

use crate::error::{Result, StoreError};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

/// What an armed fault point does when hit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultAction {
    /// Fail every call.
    Fail,
    /// Fail the next `n` calls, then pass.
    FailTimes(u64),
    /// Pass the first `n` calls, then fail every call after.
    FailAfter(u64),
}

#[derive(Debug)]
struct FaultState {
    action: FaultAction,
    hits: u64,
    triggered: u64,
}

/// Registry of armed fault points.
#[derive(Debug, Default)]
pub struct FaultInjector {
    points: RwLock<HashMap<String, FaultState>>,
    total_triggered: AtomicU64,
}

impl FaultInjector {
    /// Create an injector with no armed points.
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm a fault point.
    pub fn enable(&self, name: &str, action: FaultAction) {
        self.points.write().insert(
            name.to_string(),
            FaultState {
                action,
                hits: 0,
                triggered: 0,
            },
        );
    }

    /// Disarm a fault point.
    pub fn disable(&self, name: &str) {
        self.points.write().remove(name);
    }

    /// Disarm everything.
    pub fn disable_all(&self) {
        self.points.write().clear();
    }

    /// How many times `name` failed a call.
    pub fn triggered(&self, name: &str) -> u64 {
        self.points.read().get(name).map(|s| s.triggered).unwrap_or(0)
    }

    /// Failures injected across all points.
    pub fn total_triggered(&self) -> u64 {
        self.total_triggered.load(Ordering::Relaxed)
    }

    /// Pass through fault point `name` on behalf of `store`.
    pub fn check(&self, name: &str, store: &'static str) -> Result<()> {
        let mut points = self.points.write();
        let Some(state) = points.get_mut(name) else {
            return Ok(());
        };

        state.hits += 1;
        let fire = match state.action {
            FaultAction::Fail => true,
            FaultAction::FailTimes(n) => state.triggered < n,
            FaultAction::FailAfter(n) => state.hits > n,
        };
        if !fire {
            return Ok(());
        }

        state.triggered += 1;
        self.total_triggered.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(point = name, store, hits = state.hits, "Injected fault");
        Err(StoreError::Unavailable {
            store,
            reason: format!("injected fault at {name}"),
        }
        .into())
    }
}
