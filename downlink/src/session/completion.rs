//! Exactly-once completion handlers for background wakeups.
//!
//! A host that relaunches the process to service background transfers hands
//! over a wakeup identifier and a handler that must run exactly once, after
//! every transfer tied to that identifier has settled. The ledger keeps one
//! latch per identifier:
//!
//! 1. While work is outstanding the handler is parked.
//! 2. When outstanding work drains to zero the handler fires and the latch
//!    locks, so later registrations for the same drain are dropped.
//! 3. Newly admitted work re-arms the latch for the next drain cycle.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Opaque identifier a host uses to correlate a background wakeup with the
/// session that produced it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WakeupId(String);

impl WakeupId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for WakeupId {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

impl From<String> for WakeupId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl fmt::Display for WakeupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Callback invoked once all transfers for a wakeup identifier settle.
pub type CompletionHandler = Box<dyn FnOnce() + Send + 'static>;

#[derive(Default)]
struct Latch {
    outstanding: usize,
    handler: Option<CompletionHandler>,
    fired: bool,
}

/// Tracks, per wakeup identifier, how much work remains and whether the
/// registered handler already ran for the current drain cycle.
///
/// The ledger never runs handlers itself. Methods return a ready handler to
/// the caller, which invokes it outside any lock.
#[derive(Default)]
pub(crate) struct CompletionLedger {
    latches: HashMap<WakeupId, Latch>,
}

impl CompletionLedger {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Records the current amount of outstanding work for `id`.
    ///
    /// Returns the handler when this update drained the identifier.
    #[must_use]
    pub(crate) fn set_outstanding(
        &mut self,
        id: &WakeupId,
        outstanding: usize,
    ) -> Option<CompletionHandler> {
        let latch = self.latches.entry(id.clone()).or_default();
        if outstanding > 0 && latch.outstanding == 0 && latch.fired {
            // New work after a drain starts the next cycle.
            latch.fired = false;
        }
        latch.outstanding = outstanding;
        Self::take_ready(latch)
    }

    /// Parks `handler` for `id`, replacing any handler parked earlier.
    ///
    /// Returns the handler immediately when nothing is outstanding. A
    /// registration arriving after the current cycle already fired is
    /// dropped.
    #[must_use]
    pub(crate) fn register(
        &mut self,
        id: &WakeupId,
        handler: CompletionHandler,
    ) -> Option<CompletionHandler> {
        let latch = self.latches.entry(id.clone()).or_default();
        if latch.fired {
            tracing::warn!(wakeup = %id, "completion handler already ran for this cycle, dropping");
            return None;
        }
        if latch.handler.is_some() {
            tracing::debug!(wakeup = %id, "replacing parked completion handler");
        }
        latch.handler = Some(handler);
        Self::take_ready(latch)
    }

    fn take_ready(latch: &mut Latch) -> Option<CompletionHandler> {
        if latch.outstanding == 0 && !latch.fired && latch.handler.is_some() {
            latch.fired = true;
            return latch.handler.take();
        }
        None
    }
}

// =============================================================================
// Tests
// =============================================================================
