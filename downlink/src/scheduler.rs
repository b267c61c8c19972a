//! Bounded admission control for active transfers.
//!
//! The scheduler decides which transfers may move bytes right now. It
//! keeps an active set bounded by a ceiling and a FIFO queue of transfers
//! waiting for a slot:
//!
//! 1. Admission is granted synchronously while a slot is free
//! 2. Waiting transfers are admitted in arrival order as slots release
//! 3. Raising the ceiling admits waiting transfers immediately; lowering
//!    it never interrupts transfers that are already active
//!
//! The scheduler is plain data with no locking of its own; the session
//! serializes access through its mutex.

use crate::identity::TransferId;
use std::collections::{HashSet, VecDeque};

/// Outcome of an admission request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// A slot was free; the transfer may start immediately.
    Admitted,
    /// All slots are taken; the transfer waits in FIFO order.
    Queued,
}

/// Tracks which transfers hold a concurrency slot and which are waiting.
#[derive(Debug)]
pub struct AdmissionScheduler {
    ceiling: usize,
    active: HashSet<TransferId>,
    waiting: VecDeque<TransferId>,
}

impl AdmissionScheduler {
    /// Creates a scheduler with the given concurrency ceiling.
    pub fn new(ceiling: usize) -> Self {
        Self {
            ceiling,
            active: HashSet::new(),
            waiting: VecDeque::new(),
        }
    }

    /// Requests a slot for a transfer.
    ///
    /// Returns [`Admission::Admitted`] when a slot is free, otherwise
    /// appends the id to the wait queue and returns [`Admission::Queued`].
    /// Requesting admission for an id that is already active or already
    /// waiting changes nothing and reports its current position.
    pub fn request_admission(&mut self, id: TransferId) -> Admission {
        if self.active.contains(&id) {
            return Admission::Admitted;
        }
        if self.waiting.contains(&id) {
            return Admission::Queued;
        }
        if self.active.len() < self.ceiling {
            self.active.insert(id);
            Admission::Admitted
        } else {
            self.waiting.push_back(id);
            Admission::Queued
        }
    }

    /// Releases whatever claim a transfer holds.
    ///
    /// An active id frees its slot; a waiting id leaves the queue. Freed
    /// slots are refilled from the front of the queue, and the ids
    /// admitted this way are returned so the caller can start them.
    pub fn release(&mut self, id: &TransferId) -> Vec<TransferId> {
        if !self.active.remove(id) {
            self.waiting.retain(|waiting| waiting != id);
        }
        self.fill_slots()
    }

    /// Changes the ceiling.
    ///
    /// Raising it admits waiting transfers up to the new bound and returns
    /// them. Lowering it only constrains future admissions; transfers that
    /// are already active keep their slots until they release naturally.
    pub fn set_ceiling(&mut self, ceiling: usize) -> Vec<TransferId> {
        self.ceiling = ceiling;
        self.fill_slots()
    }

    /// Current ceiling.
    pub fn ceiling(&self) -> usize {
        self.ceiling
    }

    /// Number of transfers holding a slot.
    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    /// Number of transfers waiting for a slot.
    pub fn waiting_count(&self) -> usize {
        self.waiting.len()
    }

    /// True when the id currently holds a slot.
    pub fn is_active(&self, id: &TransferId) -> bool {
        self.active.contains(id)
    }

    /// True when the id is waiting for a slot.
    pub fn is_waiting(&self, id: &TransferId) -> bool {
        self.waiting.contains(id)
    }

    /// True when no transfer is active or waiting.
    pub fn is_idle(&self) -> bool {
        self.active.is_empty() && self.waiting.is_empty()
    }

    fn fill_slots(&mut self) -> Vec<TransferId> {
        let mut admitted = Vec::new();
        while self.active.len() < self.ceiling {
            match self.waiting.pop_front() {
                Some(id) => {
                    self.active.insert(id.clone());
                    admitted.push(id);
                }
                None => break,
            }
        }
        admitted
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn id(n: usize) -> TransferId {
        TransferId::compute(&format!("https://example.com/file-{n}"), None)
    }

    #[test]
    fn test_admits_until_ceiling() {
        let mut scheduler = AdmissionScheduler::new(2);
        assert_eq!(scheduler.request_admission(id(1)), Admission::Admitted);
        assert_eq!(scheduler.request_admission(id(2)), Admission::Admitted);
        assert_eq!(scheduler.request_admission(id(3)), Admission::Queued);
        assert_eq!(scheduler.active_count(), 2);
        assert_eq!(scheduler.waiting_count(), 1);
    }

    #[test]
    fn test_release_admits_fifo_head() {
        let mut scheduler = AdmissionScheduler::new(2);
        scheduler.request_admission(id(1));
        scheduler.request_admission(id(2));
        scheduler.request_admission(id(3));
        scheduler.request_admission(id(4));

        let admitted = scheduler.release(&id(1));
        assert_eq!(admitted, vec![id(3)]);
        assert!(scheduler.is_active(&id(3)));
        assert!(scheduler.is_waiting(&id(4)));
    }

    #[test]
    fn test_pause_resume_scenario() {
        // Ceiling 2: A and B admitted, C waits. Pausing A admits C;
        // resuming A queues it until a slot frees.
        let mut scheduler = AdmissionScheduler::new(2);
        scheduler.request_admission(id(1));
        scheduler.request_admission(id(2));
        assert_eq!(scheduler.request_admission(id(3)), Admission::Queued);

        let admitted = scheduler.release(&id(1));
        assert_eq!(admitted, vec![id(3)]);

        assert_eq!(scheduler.request_admission(id(1)), Admission::Queued);
        assert_eq!(scheduler.active_count(), 2);

        let admitted = scheduler.release(&id(2));
        assert_eq!(admitted, vec![id(1)]);
    }

    #[test]
    fn test_duplicate_requests_change_nothing() {
        let mut scheduler = AdmissionScheduler::new(1);
        assert_eq!(scheduler.request_admission(id(1)), Admission::Admitted);
        assert_eq!(scheduler.request_admission(id(1)), Admission::Admitted);
        assert_eq!(scheduler.active_count(), 1);

        assert_eq!(scheduler.request_admission(id(2)), Admission::Queued);
        assert_eq!(scheduler.request_admission(id(2)), Admission::Queued);
        assert_eq!(scheduler.waiting_count(), 1);
    }

    #[test]
    fn test_release_of_waiting_id_leaves_queue() {
        let mut scheduler = AdmissionScheduler::new(1);
        scheduler.request_admission(id(1));
        scheduler.request_admission(id(2));
        scheduler.request_admission(id(3));

        let admitted = scheduler.release(&id(2));
        assert!(admitted.is_empty());
        assert_eq!(scheduler.waiting_count(), 1);

        // With id(2) gone, id(3) is next in line.
        let admitted = scheduler.release(&id(1));
        assert_eq!(admitted, vec![id(3)]);
    }

    #[test]
    fn test_release_of_unknown_id_is_noop() {
        let mut scheduler = AdmissionScheduler::new(1);
        scheduler.request_admission(id(1));
        let admitted = scheduler.release(&id(9));
        assert!(admitted.is_empty());
        assert_eq!(scheduler.active_count(), 1);
    }

    #[test]
    fn test_raising_ceiling_admits_waiting() {
        let mut scheduler = AdmissionScheduler::new(1);
        scheduler.request_admission(id(1));
        scheduler.request_admission(id(2));
        scheduler.request_admission(id(3));

        let admitted = scheduler.set_ceiling(3);
        assert_eq!(admitted, vec![id(2), id(3)]);
        assert_eq!(scheduler.active_count(), 3);
        assert!(scheduler.is_idle() || scheduler.waiting_count() == 0);
    }

    #[test]
    fn test_lowering_ceiling_keeps_active() {
        let mut scheduler = AdmissionScheduler::new(3);
        scheduler.request_admission(id(1));
        scheduler.request_admission(id(2));
        scheduler.request_admission(id(3));

        let admitted = scheduler.set_ceiling(1);
        assert!(admitted.is_empty());
        assert_eq!(scheduler.active_count(), 3);

        // Nothing new gets in until enough slots release.
        assert_eq!(scheduler.request_admission(id(4)), Admission::Queued);
        assert!(scheduler.release(&id(1)).is_empty());
        assert!(scheduler.release(&id(2)).is_empty());
        assert_eq!(scheduler.release(&id(3)), vec![id(4)]);
    }

    #[test]
    fn test_is_idle() {
        let mut scheduler = AdmissionScheduler::new(1);
        assert!(scheduler.is_idle());
        scheduler.request_admission(id(1));
        assert!(!scheduler.is_idle());
        scheduler.release(&id(1));
        assert!(scheduler.is_idle());
    }

    proptest! {
        /// With a fixed ceiling, no interleaving of requests and releases
        /// pushes the active set past the ceiling, and no id is ever both
        /// active and waiting.
        #[test]
        fn test_active_never_exceeds_fixed_ceiling(
            ceiling in 1usize..5,
            ops in prop::collection::vec((any::<bool>(), 0usize..8), 1..200),
        ) {
            let mut scheduler = AdmissionScheduler::new(ceiling);
            for (request, n) in ops {
                if request {
                    scheduler.request_admission(id(n));
                } else {
                    scheduler.release(&id(n));
                }
                prop_assert!(scheduler.active_count() <= ceiling);
                for n in 0..8 {
                    prop_assert!(!(scheduler.is_active(&id(n)) && scheduler.is_waiting(&id(n))));
                }
            }
        }

        /// With ceiling changes mixed in, the active count only ever
        /// exceeds the ceiling through a lowering, and such excess never
        /// grows: admissions stop until releases bring it back down.
        #[test]
        fn test_excess_only_decays_after_lowering(
            ops in prop::collection::vec((0u8..3, 0usize..8), 1..200),
        ) {
            let mut scheduler = AdmissionScheduler::new(2);
            for (op, n) in ops {
                let before = scheduler.active_count();
                match op {
                    0 => { scheduler.request_admission(id(n)); }
                    1 => { scheduler.release(&id(n)); }
                    _ => { scheduler.set_ceiling(n.max(1)); }
                }
                let after = scheduler.active_count();
                prop_assert!(after <= scheduler.ceiling() || after <= before);
            }
        }
    }
}
