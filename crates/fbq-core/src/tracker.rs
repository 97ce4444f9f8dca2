//! Use-tracking for the heap backend's private pool.
//!
//! One bit per [`POOL_GRANULARITY`] bytes; a set bit is in use. The bitmask is
//! the only record of which regions are claimed.

use core::cell::RefCell;

use critical_section::Mutex;

use crate::bitset::{BitSet, RangeError};
use crate::config::{POOL_CAPACITY, POOL_GRANULARITY, POOL_MASK_WORDS};
use crate::error::{Error, Fault};

/// Requested state change for a pool region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Track {
    Allocate,
    Free,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolTracker {
    units: BitSet<POOL_MASK_WORDS>,
    pool_size: u32,
}

impl PoolTracker {
    pub fn new(pool_size: u32) -> Result<Self, Error> {
        if pool_size as usize > POOL_CAPACITY || pool_size % POOL_GRANULARITY != 0 {
            return Err(Error::InvalidArgument);
        }
        let Some(units) = BitSet::new((pool_size / POOL_GRANULARITY) as usize) else {
            return Err(Error::InvalidArgument);
        };
        Ok(Self { units, pool_size })
    }

    pub fn pool_size(&self) -> u32 {
        self.pool_size
    }

    /// Allocate or free `size` bytes at `start`.
    ///
    /// Every covered unit must currently be in the opposite state; otherwise
    /// nothing changes and the call fails with a double-allocation or
    /// double-free fault.
    pub fn track(&mut self, start: u32, size: u32, op: Track) -> Result<(), Error> {
        if start % POOL_GRANULARITY != 0 || start >= self.pool_size || size == 0 {
            return Err(Error::InvalidArgument);
        }
        match start.checked_add(size) {
            Some(end) if end <= self.pool_size => {}
            _ => return Err(Error::InvalidArgument),
        }

        let first = (start / POOL_GRANULARITY) as usize;
        let last = ((start + size - 1) / POOL_GRANULARITY) as usize;

        let result = match op {
            Track::Allocate => self.units.claim_range(first, last),
            Track::Free => self.units.release_range(first, last),
        };
        result.map_err(|e| match (e, op) {
            (RangeError::OutOfRange, _) => Error::InvalidArgument,
            (RangeError::Conflict, Track::Allocate) => Fault::DoubleAllocation.into(),
            (RangeError::Conflict, Track::Free) => Fault::DoubleFree.into(),
        })
    }

    /// Number of granularity units currently claimed.
    pub fn units_in_use(&self) -> usize {
        self.units.count_ones()
    }

    /// True if the unit containing `offset` is claimed.
    pub fn is_in_use(&self, offset: u32) -> bool {
        self.units
            .get((offset / POOL_GRANULARITY) as usize)
            .unwrap_or(false)
    }
}

/// [`PoolTracker`] shared between the consume loop and the response path.
pub struct SharedTracker {
    inner: Mutex<RefCell<PoolTracker>>,
}

impl SharedTracker {
    pub fn new(tracker: PoolTracker) -> Self {
        Self {
            inner: Mutex::new(RefCell::new(tracker)),
        }
    }

    /// [`PoolTracker::track`] inside a critical section.
    pub fn track(&self, start: u32, size: u32, op: Track) -> Result<(), Error> {
        critical_section::with(|cs| self.inner.borrow_ref_mut(cs).track(start, size, op))
    }

    /// Copy of the current bitmask.
    pub fn snapshot(&self) -> PoolTracker {
        critical_section::with(|cs| self.inner.borrow_ref(cs).clone())
    }
}
