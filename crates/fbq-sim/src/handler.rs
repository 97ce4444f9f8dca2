//! Simulated handler task: a bounded inbox fed by the consume loop.
//!
//! Records for the priority unit jump the line, so entries finish out of
//! ring order and the sweep has gaps to close.

use fbq_core::{DispatchRecord, DispatchStatus, Dispatcher};
use heapless::Deque;

/// Records the inbox holds; every slot of two full rings.
pub const INBOX_DEPTH: usize = 128;

/// Dispatch status when the inbox is full.
pub const STATUS_BUSY: DispatchStatus = DispatchStatus(1);

pub struct HandlerTask<P> {
    inbox: Deque<DispatchRecord<P>, INBOX_DEPTH>,
    priority_unit: u8,
    dispatched: u64,
}

impl<P> HandlerTask<P> {
    pub fn new(priority_unit: u8) -> Self {
        Self {
            inbox: Deque::new(),
            priority_unit,
            dispatched: 0,
        }
    }

    /// Next record to service.
    pub fn take(&mut self) -> Option<DispatchRecord<P>> {
        self.inbox.pop_front()
    }

    pub fn pending(&self) -> usize {
        self.inbox.len()
    }

    pub fn dispatched(&self) -> u64 {
        self.dispatched
    }
}

impl<P> Dispatcher<P> for HandlerTask<P> {
    fn dispatch(&mut self, record: DispatchRecord<P>) -> Result<(), DispatchStatus> {
        let unit_id = record.unit_id;
        let queued = if unit_id == self.priority_unit {
            self.inbox.push_front(record)
        } else {
            self.inbox.push_back(record)
        };
        if queued.is_err() {
            log::warn!("handler inbox full, unit {:#04x} refused", unit_id);
            return Err(STATUS_BUSY);
        }
        self.dispatched += 1;
        Ok(())
    }
}
