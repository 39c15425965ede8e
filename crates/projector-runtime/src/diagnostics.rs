//! Diagnostic sink for event faults and batch counters.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

use crate::error::EventFault;

/// A fault together with the batch it occurred in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FaultRecord {
    /// Sequence number of the batch (1-based, per scope).
    pub batch: u64,
    pub fault: EventFault,
}

/// Counters over every batch a scope processed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchCounters {
    pub batches: u64,
    pub events_applied: u64,
    pub events_ignored: u64,
    pub events_faulted: u64,
}

#[derive(Debug, Default)]
struct DiagnosticsInner {
    capacity: usize,
    faults: VecDeque<FaultRecord>,
    counters: BatchCounters,
}

/// Shared, bounded record of what happened to delivered batches.
///
/// Only the most recent `capacity` faults are kept; counters are never
/// truncated.
#[derive(Debug, Clone, Default)]
pub struct Diagnostics {
    inner: Rc<RefCell<DiagnosticsInner>>,
}

impl Diagnostics {
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            inner: Rc::new(RefCell::new(DiagnosticsInner {
                capacity,
                faults: VecDeque::with_capacity(capacity.min(64)),
                counters: BatchCounters::default(),
            })),
        }
    }

    /// Start a new batch and return its sequence number.
    pub(crate) fn begin_batch(&self) -> u64 {
        let mut inner = self.inner.borrow_mut();
        inner.counters.batches += 1;
        inner.counters.batches
    }

    pub(crate) fn record_applied(&self, count: u64) {
        self.inner.borrow_mut().counters.events_applied += count;
    }

    pub(crate) fn record_ignored(&self) {
        self.inner.borrow_mut().counters.events_ignored += 1;
    }

    pub(crate) fn record_fault(&self, batch: u64, fault: EventFault) {
        let mut inner = self.inner.borrow_mut();
        inner.counters.events_faulted += 1;
        if inner.capacity == 0 {
            return;
        }
        if inner.faults.len() == inner.capacity {
            inner.faults.pop_front();
        }
        inner.faults.push_back(FaultRecord { batch, fault });
    }

    #[must_use]
    pub fn counters(&self) -> BatchCounters {
        self.inner.borrow().counters
    }

    /// Retained faults, oldest first.
    #[must_use]
    pub fn faults(&self) -> Vec<FaultRecord> {
        self.inner.borrow().faults.iter().cloned().collect()
    }

    #[must_use]
    pub fn last_fault(&self) -> Option<FaultRecord> {
        self.inner.borrow().faults.back().cloned()
    }

    /// Drop retained faults; counters are kept.
    pub fn clear_faults(&self) {
        self.inner.borrow_mut().faults.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fault(n: usize) -> EventFault {
        EventFault::MissingId {
            type_name: "user".into(),
            index: n,
            id_field: "id".into(),
        }
    }

    #[test]
    fn ring_keeps_most_recent() {
        let diag = Diagnostics::with_capacity(2);
        let batch = diag.begin_batch();
        for n in 0..3 {
            diag.record_fault(batch, fault(n));
        }
        let kept: Vec<_> = diag.faults().into_iter().map(|r| r.fault).collect();
        assert_eq!(kept, vec![fault(1), fault(2)]);
        assert_eq!(diag.counters().events_faulted, 3);
    }

    #[test]
    fn zero_capacity_still_counts() {
        let diag = Diagnostics::with_capacity(0);
        diag.record_fault(1, fault(0));
        assert!(diag.faults().is_empty());
        assert_eq!(diag.counters().events_faulted, 1);
    }
}
