//! Testing utilities for the unmerge engine.
//!
//! - [`FaultInjector`]: named fault points that make collaborator calls
//!   fail with transient store errors.
//! - [`Harness`]: every collaborator in memory, sharing one injector.
//!
//! End-to-end scenarios (full runs, crash and resume, injected faults)
//! live in the test-only submodules.
//!
//! # Example
//!
//! ```rust
//! use unmerge::testing::{FaultAction, Harness};
//!
//! let harness = Harness::new();
//! harness.faults.enable("events.fetch_page", FaultAction::FailTimes(1));
//! let runner = harness.runner();
//! # let _ = runner;
//! ```

mod fault;
mod harness;

pub use fault::{FaultAction, FaultInjector};
pub use harness::{wait_for_result, Harness};


#[cfg(test)]
mod recovery_e2e_tests;
