//! Tail sweeping for command rings.
//!
//! Entries may finish out of order, but a ring slot can only be returned to the
//! producer from the tail forward. Finished entries are marked in a per-ring
//! bitmask; the tail moves across the contiguous run of marked entries starting
//! at the current tail and stops at the first unfinished entry or at head.

use core::cell::RefCell;

use critical_section::Mutex;
use fbq_hal::{PrivilegeControl, PrivilegeLevel, QueueRegisters};

use crate::bitset::BitSet;
use crate::config::RING_MASK_WORDS;
use crate::error::{Error, Fault};

/// Holds an elevated privilege level until dropped.
pub(crate) struct Elevated<'a, P: PrivilegeControl> {
    ctl: &'a P,
    previous: PrivilegeLevel,
}

impl<'a, P: PrivilegeControl> Elevated<'a, P> {
    pub(crate) fn new(ctl: &'a P) -> Self {
        let previous = ctl.elevate();
        Self { ctl, previous }
    }
}

impl<P: PrivilegeControl> Drop for Elevated<'_, P> {
    fn drop(&mut self) {
        self.ctl.restore(self.previous);
    }
}

/// Completion marks for one ring.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SweepMask {
    queue_id: u8,
    done: BitSet<RING_MASK_WORDS>,
}

impl SweepMask {
    pub fn new(queue_id: u8, num_elements: u32) -> Result<Self, Error> {
        let done = match BitSet::new(num_elements as usize) {
            Some(done) if !done.is_empty() => done,
            _ => return Err(Error::InvalidArgument),
        };
        Ok(Self { queue_id, done })
    }

    pub fn queue_id(&self) -> u8 {
        self.queue_id
    }

    pub fn num_elements(&self) -> u32 {
        self.done.len() as u32
    }

    pub fn is_complete(&self, index: u32) -> bool {
        self.done.get(index as usize).unwrap_or(false)
    }

    /// True if no entry is waiting for the tail to reach it.
    pub fn is_clear(&self) -> bool {
        self.done.is_clear()
    }

    /// Mark `index` finished. Marking an entry twice is a fault.
    pub fn mark(&mut self, index: u32) -> Result<(), Error> {
        let Ok(was) = self.done.set(index as usize) else {
            return Err(Error::InvalidArgument);
        };
        if was {
            return Err(Fault::AlreadySwept {
                queue_id: self.queue_id,
                index,
            }
            .into());
        }
        Ok(())
    }

    /// Clear marks from `tail` forward while contiguous and short of `head`.
    /// Returns the new tail.
    pub fn advance(&mut self, tail: u32, head: u32) -> u32 {
        let n = self.num_elements();
        let mut pos = tail;
        while pos != head && self.is_complete(pos) {
            let _ = self.done.clear(pos as usize);
            pos = if pos + 1 >= n { 0 } else { pos + 1 };
        }
        pos
    }
}

/// Sweep masks for `Q` rings, guarded by a critical section.
pub struct SweepEngine<const Q: usize> {
    masks: Mutex<RefCell<[SweepMask; Q]>>,
}

impl<const Q: usize> SweepEngine<Q> {
    pub fn new(masks: [SweepMask; Q]) -> Self {
        Self {
            masks: Mutex::new(RefCell::new(masks)),
        }
    }

    /// Mark `completed` finished on ring `queue_id` and move the hardware tail
    /// across any contiguous run of finished entries. Returns the tail after
    /// the sweep.
    pub fn sweep<R>(&self, regs: &R, queue_id: u8, completed: u32) -> Result<u32, Error>
    where
        R: QueueRegisters + PrivilegeControl,
    {
        critical_section::with(|cs| -> Result<u32, Error> {
            let mut masks = self.masks.borrow_ref_mut(cs);
            let Some(mask) = masks.iter_mut().find(|m| m.queue_id == queue_id) else {
                return Err(Error::InvalidArgument);
            };

            mask.mark(completed)?;

            let n = mask.num_elements();
            let tail = regs.cmd_tail(queue_id);
            let head = regs.cmd_head(queue_id);
            if tail >= n || head >= n {
                return Err(Fault::RingPointerOutOfRange {
                    queue_id,
                    head,
                    tail,
                }
                .into());
            }

            let new_tail = mask.advance(tail, head);
            if new_tail != tail {
                let _elevated = Elevated::new(regs);
                regs.set_cmd_tail(queue_id, new_tail);
            }
            log::debug!(
                "sweep q{}: completed {}, tail {} -> {} (head {})",
                queue_id,
                completed,
                tail,
                new_tail,
                head
            );
            Ok(new_tail)
        })
    }

    /// Copy of the completion marks for `queue_id`.
    pub fn mask(&self, queue_id: u8) -> Option<SweepMask> {
        critical_section::with(|cs| {
            self.masks
                .borrow_ref(cs)
                .iter()
                .find(|m| m.queue_id == queue_id)
                .cloned()
        })
    }
}
