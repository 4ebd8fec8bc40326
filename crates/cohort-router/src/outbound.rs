//! Buffer for events waiting to be published.

use cohort_types::{CohortEvent, EventCategory};
use parking_lot::Mutex;
use std::collections::VecDeque;

#[derive(Debug, Default)]
struct Lanes {
    registry: VecDeque<CohortEvent>,
    typedef: VecDeque<CohortEvent>,
    instance: VecDeque<CohortEvent>,
}

impl Lanes {
    fn lane(&mut self, category: EventCategory) -> &mut VecDeque<CohortEvent> {
        match category {
            EventCategory::Registry => &mut self.registry,
            EventCategory::TypeDef => &mut self.typedef,
            EventCategory::Instance => &mut self.instance,
        }
    }
}

/// Outbound events, released registry events first, then type definition
/// events, then instance events. Order within a category is FIFO.
#[derive(Debug, Default)]
pub struct OutboundQueue {
    lanes: Mutex<Lanes>,
}

impl OutboundQueue {
    /// Creates an empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends an event to its category's lane.
    pub fn push(&self, event: CohortEvent) {
        self.lanes.lock().lane(event.category()).push_back(event);
    }

    /// Puts back an event that could not be sent, ahead of its lane.
    pub fn requeue(&self, event: CohortEvent) {
        self.lanes.lock().lane(event.category()).push_front(event);
    }

    /// Removes the next event to send.
    pub fn pop(&self) -> Option<CohortEvent> {
        let mut lanes = self.lanes.lock();
        lanes
            .registry
            .pop_front()
            .or_else(|| lanes.typedef.pop_front())
            .or_else(|| lanes.instance.pop_front())
    }

    /// Returns the number of buffered events.
    pub fn len(&self) -> usize {
        let lanes = self.lanes.lock();
        lanes.registry.len() + lanes.typedef.len() + lanes.instance.len()
    }

    /// Returns true if nothing is buffered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
