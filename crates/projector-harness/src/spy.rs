//! Delivery spy for repository subscriptions.

use std::cell::RefCell;
use std::rc::Rc;

use projector_core::{BatchCallback, ChangeEvent};

/// Records every batch delivered through the callback it hands out.
#[derive(Debug, Clone, Default)]
pub struct BatchRecorder {
    batches: Rc<RefCell<Vec<Vec<ChangeEvent>>>>,
}

impl BatchRecorder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A callback that appends each delivered batch to this recorder.
    #[must_use]
    pub fn callback(&self) -> BatchCallback {
        let batches = Rc::clone(&self.batches);
        Rc::new(move |events: &[ChangeEvent]| {
            batches.borrow_mut().push(events.to_vec());
        })
    }

    /// Number of batches delivered so far.
    #[must_use]
    pub fn deliveries(&self) -> usize {
        self.batches.borrow().len()
    }

    /// Copy of every delivered batch, in delivery order.
    #[must_use]
    pub fn batches(&self) -> Vec<Vec<ChangeEvent>> {
        self.batches.borrow().clone()
    }

    /// Type names of every delivered event, flattened.
    #[must_use]
    pub fn delivered_types(&self) -> Vec<String> {
        self.batches
            .borrow()
            .iter()
            .flatten()
            .map(|e| e.type_name.clone())
            .collect()
    }

    pub fn reset(&self) {
        self.batches.borrow_mut().clear();
    }
}
