//! Queue backends and the pieces they share: the dispatch seam, the outbound
//! message descriptor and the transport channel.

pub mod heap;
pub mod ptcb;

use fbq_hal::{QueueRegisters, SharedMemory};

use crate::config::{align_up, RingGeometry, DMA_ALIGNMENT, STAGING_CAPACITY};
use crate::error::{DispatchStatus, Error};
use crate::wire::{self, RpcHeader};

/// How the payload of a dispatched command reaches its handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum EventType {
    /// Payload already copied into the private pool.
    HeapCommand,
    /// Payload still in the shared region; the handler copies it into its own buffer.
    PtcbCommand,
}

/// A decoded command handed to the dispatch collaborator.
#[derive(Debug)]
pub struct DispatchRecord<P> {
    pub event: EventType,
    pub unit_id: u8,
    pub function: u8,
    pub queue_id: u8,
    pub payload: P,
}

/// Routes a decoded command to the task that handles its unit.
///
/// Called from the consume loop. Must not block on the transport lock: for
/// the low-power unit the lock is still held while this runs.
pub trait Dispatcher<P> {
    fn dispatch(&mut self, record: DispatchRecord<P>) -> Result<(), DispatchStatus>;
}

/// Backend-specific writer of one message into the outbound ring.
pub trait DataPost {
    type Error: core::fmt::Debug;

    /// Write `size` bytes (header then body) into the slot at `*head`.
    /// `*head` advances only if the write succeeded.
    fn data_post(
        &self,
        head: &mut u32,
        header: &RpcHeader,
        body: &[u8],
        size: usize,
    ) -> Result<(), Error<Self::Error>>;
}

/// Bounds of the outbound message ring, set once when a backend is built.
///
/// Head and tail are accessed through [`QueueRegisters`]; the message itself
/// is written by the backend's [`DataPost`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueDescriptor {
    pub start: u32,
    pub end: u32,
}

impl QueueDescriptor {
    pub fn init(msg_queue: &RingGeometry) -> Self {
        Self {
            start: 0,
            end: msg_queue.num_elements,
        }
    }

    pub fn contains(&self, position: u32) -> bool {
        (self.start..self.end).contains(&position)
    }

    pub fn next(&self, position: u32) -> u32 {
        if position + 1 >= self.end {
            self.start
        } else {
            position + 1
        }
    }

    /// Check that the message ring has a free slot and return the hardware
    /// head to write it at. The slot stays free only while the caller holds
    /// off every other poster.
    pub fn reserve<R: QueueRegisters>(&self, regs: &R) -> Result<u32, Error> {
        let head = regs.msg_head();
        let tail = regs.msg_tail();
        if !self.contains(head) || !self.contains(tail) {
            return Err(Error::InvalidState);
        }
        if self.next(head) == tail {
            log::warn!("message queue full (head {}, tail {})", head, tail);
            return Err(Error::QueueFull);
        }
        Ok(head)
    }

    /// Post one message at the current hardware head and publish the new head.
    /// Returns the new head.
    pub fn post<R, P>(
        &self,
        regs: &R,
        poster: &P,
        header: &RpcHeader,
        body: &[u8],
        size: usize,
    ) -> Result<u32, Error<P::Error>>
    where
        R: QueueRegisters,
        P: DataPost,
    {
        let mut head = self.reserve(regs).map_err(|e| e.widen::<P::Error>())?;
        poster.data_post(&mut head, header, body, size)?;
        regs.set_msg_head(head);
        Ok(head)
    }
}

#[repr(C, align(16))]
pub(crate) struct Staging([u8; STAGING_CAPACITY]);

/// Everything guarded by the transport lock: the engine itself, the outbound
/// staging buffer and the outbound sequence counter.
pub(crate) struct Channel<T> {
    pub(crate) transport: T,
    staging: Staging,
    next_sequence: u32,
}

impl<T: SharedMemory> Channel<T> {
    pub(crate) fn new(transport: T) -> Self {
        Self {
            transport,
            staging: Staging([0; STAGING_CAPACITY]),
            next_sequence: 0,
        }
    }

    /// Stage, seal and write one message into `ring` at `*head`.
    pub(crate) fn post(
        &mut self,
        ring: &RingGeometry,
        head: &mut u32,
        header: &RpcHeader,
        body: &[u8],
        size: usize,
    ) -> Result<(), Error<T::Error>> {
        let max = (ring.element_size as usize).min(STAGING_CAPACITY);
        if !(RpcHeader::SIZE..=max).contains(&size) {
            log::warn!("post rejected: size {} outside {}..={}", size, RpcHeader::SIZE, max);
            return Err(Error::InvalidArgument);
        }
        let body_len = size - RpcHeader::SIZE;
        if body.len() < body_len || !ring.contains(*head) {
            return Err(Error::InvalidArgument);
        }

        let mut staged = *header;
        staged.size = size as u16;
        staged.sequence_number = self.next_sequence;
        staged.checksum = 0;

        let padded = align_up(size, DMA_ALIGNMENT);
        let buf = &mut self.staging.0[..padded];
        buf.fill(0);
        buf[..RpcHeader::SIZE].copy_from_slice(&staged.to_bytes());
        buf[RpcHeader::SIZE..size].copy_from_slice(&body[..body_len]);
        wire::seal(&mut buf[..size]);

        self.transport
            .write(buf, ring.slot_offset(*head))
            .map_err(Error::Transport)?;
        self.transport.flush().map_err(Error::Transport)?;

        log::debug!(
            "posted seq {} unit {} fn {} ({} bytes) at slot {}",
            staged.sequence_number,
            staged.unit_id,
            staged.function,
            size,
            *head
        );
        self.next_sequence = self.next_sequence.wrapping_add(1);
        *head = ring.next(*head);
        Ok(())
    }
}
