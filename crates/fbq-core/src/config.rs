//! Queue geometry and compile-time capacities.

use crate::error::Error;
use crate::wire::{EnvelopeHeader, RpcHeader};

/// Inbound command rings served by the heap backend.
pub const HEAP_QUEUE_COUNT: usize = 2;

/// Largest ring any backend can track.
pub const MAX_RING_ELEMENTS: usize = 64;
pub(crate) const RING_MASK_WORDS: usize = MAX_RING_ELEMENTS / 32;

/// Size of the heap backend's private pool storage.
pub const POOL_CAPACITY: usize = 4096;
/// Allocation unit of the pool; every claim starts on and is rounded to this.
pub const POOL_GRANULARITY: u32 = 16;
pub(crate) const POOL_MASK_WORDS: usize = POOL_CAPACITY / POOL_GRANULARITY as usize / 32;

/// Burst alignment of the DMA engine.
pub const DMA_ALIGNMENT: usize = 16;
/// Largest transfer the engine performs as a single read.
pub const MAX_ATOMIC_READ: usize = 256;

/// Capacity of the outbound staging buffer; bounds the message element size.
pub const STAGING_CAPACITY: usize = 256;

/// Round `value` up to a multiple of `align` (a power of two).
pub const fn align_up(value: usize, align: usize) -> usize {
    (value + align - 1) & !(align - 1)
}

/// Location and shape of one ring in the shared region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RingGeometry {
    /// Byte offset of element 0.
    pub base: u32,
    pub num_elements: u32,
    /// Stride between elements in bytes.
    pub element_size: u32,
}

impl RingGeometry {
    pub const fn new(base: u32, num_elements: u32, element_size: u32) -> Self {
        Self {
            base,
            num_elements,
            element_size,
        }
    }

    pub fn contains(&self, position: u32) -> bool {
        position < self.num_elements
    }

    /// Byte offset of the element at `position`.
    pub fn slot_offset(&self, position: u32) -> u32 {
        self.base + position * self.element_size
    }

    /// Position after `position`, wrapping at the element count.
    pub fn next(&self, position: u32) -> u32 {
        let next = position + 1;
        if next >= self.num_elements {
            0
        } else {
            next
        }
    }

    /// Bytes covered by the whole ring.
    pub fn span(&self) -> u32 {
        self.num_elements * self.element_size
    }

    pub fn validate(&self) -> Result<(), Error> {
        if self.num_elements == 0 || self.num_elements as usize > MAX_RING_ELEMENTS {
            return Err(Error::InvalidArgument);
        }
        if self.element_size == 0 || self.element_size as usize % DMA_ALIGNMENT != 0 {
            return Err(Error::InvalidArgument);
        }
        if self.base as usize % DMA_ALIGNMENT != 0 {
            return Err(Error::InvalidArgument);
        }
        Ok(())
    }

    fn validate_message_ring(&self) -> Result<(), Error> {
        self.validate()?;
        let size = self.element_size as usize;
        if !(RpcHeader::SIZE..=STAGING_CAPACITY).contains(&size) {
            return Err(Error::InvalidArgument);
        }
        Ok(())
    }
}

/// Configuration of a [`HeapQueue`](crate::queue::heap::HeapQueue).
#[derive(Debug, Clone, Copy)]
pub struct HeapQueueConfig {
    pub cmd_queues: [RingGeometry; HEAP_QUEUE_COUNT],
    pub msg_queue: RingGeometry,
    /// Bytes of the private pool in use (at most [`POOL_CAPACITY`]).
    pub pool_size: u32,
    /// Routing unit whose requests keep the transport lock across dispatch.
    pub low_power_unit: u8,
}

impl HeapQueueConfig {
    pub fn validate(&self) -> Result<(), Error> {
        for ring in &self.cmd_queues {
            ring.validate()?;
            if (ring.element_size as usize) < EnvelopeHeader::SIZE + RpcHeader::SIZE {
                return Err(Error::InvalidArgument);
            }
        }
        self.msg_queue.validate_message_ring()?;
        if self.pool_size == 0
            || self.pool_size as usize > POOL_CAPACITY
            || self.pool_size % POOL_GRANULARITY != 0
        {
            return Err(Error::InvalidArgument);
        }
        Ok(())
    }
}

/// Sweep-skip policy that never defers a sweep.
pub fn never_skip(_header: &RpcHeader) -> bool {
    false
}

/// Configuration of a [`PtcbQueue`](crate::queue::ptcb::PtcbQueue).
#[derive(Debug, Clone, Copy)]
pub struct PtcbQueueConfig {
    /// Id of the single command ring this backend serves.
    pub queue_id: u8,
    pub cmd_queue: RingGeometry,
    pub msg_queue: RingGeometry,
    /// Routing unit whose requests keep the transport lock across dispatch.
    pub low_power_unit: u8,
    /// Requests for which the consumer defers the sweep to a later consumer.
    pub sweep_skip: fn(&RpcHeader) -> bool,
}

impl PtcbQueueConfig {
    pub fn validate(&self) -> Result<(), Error> {
        self.cmd_queue.validate()?;
        if (self.cmd_queue.element_size as usize) < RpcHeader::SIZE {
            return Err(Error::InvalidArgument);
        }
        self.msg_queue.validate_message_ring()
    }
}
