//! Heap-backed queue: each command is copied into a private pool before dispatch.
//!
//! Entry lifecycle: copy-in claims the pool region named by the element's
//! envelope and reads the element into it; the handler works on the pooled
//! copy; copy-out writes it back in place and releases the region; the sweep
//! then returns the ring slot to the producer.

use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicU32, Ordering};

use fbq_hal::{CrashLog, PrivilegeControl, QueueRegisters, SharedMemory};
use spin::Mutex;

use super::{Channel, DataPost, DispatchRecord, Dispatcher, EventType, QueueDescriptor};
use crate::config::{HeapQueueConfig, RingGeometry, HEAP_QUEUE_COUNT, POOL_CAPACITY};
use crate::error::{trap, Error};
use crate::sweep::{SweepEngine, SweepMask};
use crate::tracker::{PoolTracker, SharedTracker, Track};
use crate::wire::{EnvelopeHeader, RpcHeader, CMDMGMT_FN_HEAP_ACK, UNIT_CMDMGMT};

/// Body length of the acknowledgement sent after a heap entry is swept.
pub const HEAP_ACK_BODY_SIZE: usize = 8;

// Zero is never handed out, so a claim always names a live backend.
static NEXT_OWNER: AtomicU32 = AtomicU32::new(1);

/// Ownership of a claimed pool region holding one dequeued command.
///
/// Created by copy-in, consumed by copy-out. Not `Clone`: the holder is the
/// only code that may touch the region. A claim is only accepted by the
/// backend that issued it.
#[derive(Debug, PartialEq, Eq)]
pub struct PoolClaim {
    owner: u32,
    queue_id: u8,
    element_index: u16,
    offset: u32,
    size: u32,
}

impl PoolClaim {
    pub fn queue_id(&self) -> u8 {
        self.queue_id
    }

    pub fn element_index(&self) -> u16 {
        self.element_index
    }

    /// Pool offset of the region (envelope included).
    pub fn offset(&self) -> u32 {
        self.offset
    }

    /// Region length in bytes (envelope included).
    pub fn size(&self) -> u32 {
        self.size
    }
}

/// Failure of [`HeapQueue::respond`].
#[derive(Debug, PartialEq, Eq)]
pub struct RespondError<E> {
    pub error: Error<E>,
    /// The claim, handed back untouched when nothing was written: the message
    /// ring had no room for the acknowledgement or the claim is foreign.
    pub claim: Option<PoolClaim>,
}

impl<E> From<RespondError<E>> for Error<E> {
    fn from(err: RespondError<E>) -> Self {
        err.error
    }
}

#[repr(C, align(16))]
struct Pool(UnsafeCell<[u8; POOL_CAPACITY]>);

/// Heap-backed command queue serving [`HEAP_QUEUE_COUNT`] inbound rings.
pub struct HeapQueue<T, R, L> {
    owner: u32,
    config: HeapQueueConfig,
    channel: Mutex<Channel<T>>,
    regs: R,
    crash_log: L,
    pool: Pool,
    tracker: SharedTracker,
    sweeper: SweepEngine<HEAP_QUEUE_COUNT>,
    current: [AtomicU32; HEAP_QUEUE_COUNT],
    descriptor: QueueDescriptor,
}

// SAFETY: pool bytes are only reached through `PoolClaim`s stamped with this
// backend's owner id. A claim exists only after the tracker marked its units
// in use, so claims never overlap, and a claim is not `Clone`, so each region
// has a single owner. Everything else is behind the transport lock, a
// critical section or an atomic.
unsafe impl<T: Send, R: Sync, L: Sync> Sync for HeapQueue<T, R, L> {}

impl<T, R, L> HeapQueue<T, R, L>
where
    T: SharedMemory,
    R: QueueRegisters + PrivilegeControl,
    L: CrashLog,
{
    /// Build the backend. Consume cursors start at each ring's hardware tail.
    pub fn new(config: HeapQueueConfig, transport: T, regs: R, crash_log: L) -> Result<Self, Error<T::Error>> {
        config.validate().map_err(|e| e.widen::<T::Error>())?;

        let tracker = PoolTracker::new(config.pool_size).map_err(|e| e.widen::<T::Error>())?;
        let masks = config
            .cmd_queues
            .iter()
            .enumerate()
            .map(|(q, ring)| SweepMask::new(q as u8, ring.num_elements))
            .collect::<Result<heapless::Vec<SweepMask, HEAP_QUEUE_COUNT>, Error>>()
            .map_err(|e| e.widen::<T::Error>())?;
        let masks: [SweepMask; HEAP_QUEUE_COUNT] = masks
            .into_array()
            .map_err(|_| Error::<T::Error>::InvalidArgument)?;

        let mut tails = [0u32; HEAP_QUEUE_COUNT];
        for (q, ring) in config.cmd_queues.iter().enumerate() {
            let tail = regs.cmd_tail(q as u8);
            if !ring.contains(tail) {
                return Err(Error::InvalidState);
            }
            tails[q] = tail;
        }

        Ok(Self {
            owner: NEXT_OWNER.fetch_add(1, Ordering::Relaxed),
            descriptor: QueueDescriptor::init(&config.msg_queue),
            config,
            channel: Mutex::new(Channel::new(transport)),
            regs,
            crash_log,
            pool: Pool(UnsafeCell::new([0; POOL_CAPACITY])),
            tracker: SharedTracker::new(tracker),
            sweeper: SweepEngine::new(masks),
            current: core::array::from_fn(|q| AtomicU32::new(tails[q])),
        })
    }

    pub fn config(&self) -> &HeapQueueConfig {
        &self.config
    }

    pub fn registers(&self) -> &R {
        &self.regs
    }

    pub fn descriptor(&self) -> &QueueDescriptor {
        &self.descriptor
    }

    /// Next position the consume loop will read on `queue_id`.
    pub fn current(&self, queue_id: u8) -> Option<u32> {
        self.current
            .get(queue_id as usize)
            .map(|c| c.load(Ordering::Relaxed))
    }

    /// True while some caller holds the transport lock.
    pub fn is_transport_busy(&self) -> bool {
        self.channel.is_locked()
    }

    /// Copy of the pool bitmask.
    pub fn pool_usage(&self) -> PoolTracker {
        self.tracker.snapshot()
    }

    /// Copy of the completion marks of `queue_id`.
    pub fn sweep_mask(&self, queue_id: u8) -> Option<SweepMask> {
        self.sweeper.mask(queue_id)
    }

    /// Request bytes of a claimed entry: RPC header followed by its body.
    pub fn payload(&self, claim: &PoolClaim) -> Result<&[u8], Error<T::Error>> {
        self.check_owner(claim)?;
        // SAFETY: the claim was issued here, so the region is ours; see the `Sync` impl.
        let region = unsafe { self.region(claim.offset, claim.size) };
        Ok(&region[EnvelopeHeader::SIZE..])
    }

    /// Mutable view of a claimed entry, used by handlers to write the response.
    pub fn payload_mut<'a>(&'a self, claim: &'a mut PoolClaim) -> Result<&'a mut [u8], Error<T::Error>> {
        self.check_owner(claim)?;
        // SAFETY: `claim` was issued here and is borrowed mutably for the
        // lifetime of the slice.
        let region = unsafe { self.region_mut(claim.offset, claim.size) };
        Ok(&mut region[EnvelopeHeader::SIZE..])
    }

    /// Read the element at `position` of `queue_id` into the pool.
    pub fn copy_in(&self, queue_id: u8, position: u32) -> Result<(PoolClaim, RpcHeader), Error<T::Error>> {
        let mut channel = self.channel.lock();
        self.copy_in_locked(&mut channel, queue_id, position)
            .map_err(|e| trap(&self.crash_log, e))
    }

    /// Write a handled entry back to its ring slot and release its pool region.
    ///
    /// The region is released even when the write fails. A claim issued by
    /// another backend is rejected and dropped; its region stays claimed there.
    pub fn copy_out(&self, claim: PoolClaim) -> Result<(), Error<T::Error>> {
        self.check_owner(&claim)?;
        let mut channel = self.channel.lock();
        self.copy_out_locked(&mut channel, claim)
            .map_err(|e| trap(&self.crash_log, e))
    }

    /// Drain `queue_id`: dispatch every entry between the consume cursor and
    /// the hardware head. Stops at the first failure; entries already
    /// dispatched stay dispatched.
    ///
    /// A refused dispatch is fatal. The refused record's claim went to the
    /// dispatcher and is gone with it, so its pool region stays claimed and
    /// its slot is never swept.
    pub fn process_command_queue<D>(&self, queue_id: u8, dispatcher: &mut D) -> Result<(), Error<T::Error>>
    where
        D: Dispatcher<PoolClaim>,
    {
        let ring = *self.ring(queue_id)?;
        let cursor = &self.current[queue_id as usize];

        loop {
            let head = self.regs.cmd_head(queue_id);
            if !ring.contains(head) {
                return Err(Error::InvalidState);
            }
            let position = cursor.load(Ordering::Relaxed);
            if position == head {
                return Ok(());
            }

            let mut channel = self.channel.lock();
            let (claim, header) = self
                .copy_in_locked(&mut channel, queue_id, position)
                .map_err(|e| trap(&self.crash_log, e))?;
            cursor.store(ring.next(position), Ordering::Relaxed);

            log::trace!(
                "q{} slot {}: unit {} fn {} ({} bytes at pool {:#x})",
                queue_id,
                position,
                header.unit_id,
                header.function,
                claim.size,
                claim.offset
            );

            let record = DispatchRecord {
                event: EventType::HeapCommand,
                unit_id: header.unit_id,
                function: header.function,
                queue_id,
                payload: claim,
            };

            // The low-power unit keeps the transport until its dispatch returns.
            let held = if header.unit_id == self.config.low_power_unit {
                Some(channel)
            } else {
                drop(channel);
                None
            };
            let status = dispatcher.dispatch(record);
            drop(held);
            if let Err(status) = status {
                return Err(trap(&self.crash_log, Error::Dispatch(status)));
            }
        }
    }

    /// Copy a handled entry back, sweep its slot, then acknowledge it on the
    /// message queue.
    ///
    /// The acknowledgement slot is reserved first, under the transport lock
    /// held for the whole exchange. With no room on the message ring nothing
    /// is written and the claim comes back in the error for a later retry.
    pub fn respond(&self, claim: PoolClaim) -> Result<(), RespondError<T::Error>> {
        if let Err(error) = self.check_owner(&claim) {
            return Err(RespondError {
                error,
                claim: Some(claim),
            });
        }

        let mut channel = self.channel.lock();
        let head = match self.descriptor.reserve(&self.regs) {
            Ok(head) => head,
            Err(error) => {
                return Err(RespondError {
                    error: error.widen(),
                    claim: Some(claim),
                })
            }
        };
        self.respond_locked(&mut channel, claim, head)
            .map_err(|e| RespondError {
                error: trap(&self.crash_log, e),
                claim: None,
            })
    }

    /// Post a message at the hardware message head. Returns the new head.
    pub fn post_message(&self, header: &RpcHeader, body: &[u8], size: usize) -> Result<u32, Error<T::Error>> {
        let mut channel = self.channel.lock();
        let mut head = self.descriptor.reserve(&self.regs).map_err(|e| e.widen::<T::Error>())?;
        channel.post(&self.config.msg_queue, &mut head, header, body, size)?;
        self.regs.set_msg_head(head);
        Ok(head)
    }

    fn check_owner(&self, claim: &PoolClaim) -> Result<(), Error<T::Error>> {
        if claim.owner != self.owner {
            log::warn!(
                "q{} slot {}: pool claim issued by another queue",
                claim.queue_id,
                claim.element_index
            );
            return Err(Error::InvalidArgument);
        }
        Ok(())
    }

    fn respond_locked(
        &self,
        channel: &mut Channel<T>,
        claim: PoolClaim,
        mut head: u32,
    ) -> Result<(), Error<T::Error>> {
        let queue_id = claim.queue_id;
        let element_index = claim.element_index;

        self.copy_out_locked(channel, claim)?;
        self.sweeper
            .sweep(&self.regs, queue_id, element_index as u32)
            .map_err(|e| e.widen::<T::Error>())?;

        let ack = RpcHeader::new(UNIT_CMDMGMT, CMDMGMT_FN_HEAP_ACK);
        let mut body = [0u8; HEAP_ACK_BODY_SIZE];
        body[0] = queue_id;
        body[2..4].copy_from_slice(&element_index.to_le_bytes());
        channel.post(
            &self.config.msg_queue,
            &mut head,
            &ack,
            &body,
            RpcHeader::SIZE + HEAP_ACK_BODY_SIZE,
        )?;
        self.regs.set_msg_head(head);
        Ok(())
    }

    fn ring(&self, queue_id: u8) -> Result<&RingGeometry, Error<T::Error>> {
        self.config
            .cmd_queues
            .get(queue_id as usize)
            .ok_or(Error::InvalidArgument)
    }

    fn copy_in_locked(
        &self,
        channel: &mut Channel<T>,
        queue_id: u8,
        position: u32,
    ) -> Result<(PoolClaim, RpcHeader), Error<T::Error>> {
        let ring = *self.ring(queue_id)?;
        if !ring.contains(position) {
            return Err(Error::InvalidArgument);
        }
        let slot = ring.slot_offset(position);

        let mut raw = [0u8; EnvelopeHeader::SIZE];
        channel.transport.read(&mut raw, slot).map_err(Error::Transport)?;
        let envelope = EnvelopeHeader::from_bytes(&raw);

        let size = envelope.heap_size as u32;
        if (size as usize) < EnvelopeHeader::SIZE + RpcHeader::SIZE || size > ring.element_size {
            log::warn!("q{} slot {}: bad envelope size {}", queue_id, position, size);
            return Err(Error::InvalidArgument);
        }
        if envelope.element_index as u32 != position {
            return Err(Error::InvalidState);
        }

        let offset = envelope.heap_offset as u32;
        self.tracker
            .track(offset, size, Track::Allocate)
            .map_err(|e| e.widen::<T::Error>())?;

        // The region stays claimed if this read fails; transport failures are
        // fatal for the queue anyway.
        // SAFETY: the units covering `offset..offset + size` were just claimed.
        let region = unsafe { self.region_mut(offset, size) };
        channel.transport.read(region, slot).map_err(Error::Transport)?;

        let Some(header) = RpcHeader::parse(&region[EnvelopeHeader::SIZE..]) else {
            return Err(Error::InvalidArgument);
        };
        let claim = PoolClaim {
            owner: self.owner,
            queue_id,
            element_index: envelope.element_index,
            offset,
            size,
        };
        Ok((claim, header))
    }

    /// The caller has checked that `claim` was issued here.
    fn copy_out_locked(&self, channel: &mut Channel<T>, claim: PoolClaim) -> Result<(), Error<T::Error>> {
        // SAFETY: the claim proves the region is ours.
        let region = unsafe { self.region(claim.offset, claim.size) };
        let Some(envelope) = EnvelopeHeader::parse(region) else {
            return Err(Error::InvalidArgument);
        };

        let ring = *self.ring(claim.queue_id)?;
        if !ring.contains(claim.element_index as u32) {
            return Err(Error::InvalidArgument);
        }
        // Handlers only see the bytes after the envelope, so it must still
        // describe the claim.
        if (envelope.element_index, envelope.heap_offset as u32, envelope.heap_size as u32)
            != (claim.element_index, claim.offset, claim.size)
        {
            log::warn!(
                "q{} slot {}: envelope no longer matches its claim",
                claim.queue_id,
                claim.element_index
            );
            return Err(Error::InvalidState);
        }

        let slot = ring.slot_offset(claim.element_index as u32);
        let written = channel
            .transport
            .write(region, slot)
            .and_then(|()| channel.transport.flush());

        self.tracker
            .track(claim.offset, claim.size, Track::Free)
            .map_err(|e| e.widen::<T::Error>())?;
        written.map_err(Error::Transport)
    }

    /// # Safety
    ///
    /// The caller must own a claim covering `offset..offset + size`.
    unsafe fn region(&self, offset: u32, size: u32) -> &[u8] {
        let base = self.pool.0.get() as *const u8;
        core::slice::from_raw_parts(base.add(offset as usize), size as usize)
    }

    /// # Safety
    ///
    /// The caller must own a claim covering `offset..offset + size` and hold
    /// no other reference into it.
    #[allow(clippy::mut_from_ref)]
    unsafe fn region_mut(&self, offset: u32, size: u32) -> &mut [u8] {
        let base = self.pool.0.get() as *mut u8;
        core::slice::from_raw_parts_mut(base.add(offset as usize), size as usize)
    }
}

impl<T, R, L> DataPost for HeapQueue<T, R, L>
where
    T: SharedMemory,
    R: QueueRegisters + PrivilegeControl,
    L: CrashLog,
{
    type Error = T::Error;

    fn data_post(
        &self,
        head: &mut u32,
        header: &RpcHeader,
        body: &[u8],
        size: usize,
    ) -> Result<(), Error<T::Error>> {
        let mut channel = self.channel.lock();
        channel.post(&self.config.msg_queue, head, header, body, size)
    }
}
