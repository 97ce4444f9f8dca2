//! Per-task command buffer queue: commands are read straight into a buffer
//! owned by the consuming task, with no intermediate pool.
//!
//! The consume loop only reads each RPC header to route it. The handler later
//! pulls the whole RPC with [`PtcbQueue::rpc_copy_in`], which also sweeps the
//! slot unless the request was flagged for a deferred sweep.

use core::sync::atomic::{AtomicU32, Ordering};

use fbq_hal::{CrashLog, PrivilegeControl, QueueRegisters, SharedMemory};
use spin::Mutex;

use super::{Channel, DataPost, DispatchRecord, Dispatcher, EventType, QueueDescriptor};
use crate::bitset::BitSet;
use crate::config::{align_up, PtcbQueueConfig, DMA_ALIGNMENT};
use crate::error::{trap, Error, Fault};
use crate::sweep::{SweepEngine, SweepMask};
use crate::wire::{RpcHeader, FLAG_RESPONSE};

/// Routing pairs a [`RpcSizeTable`] can hold.
pub const RPC_SIZE_TABLE_CAPACITY: usize = 64;

const NO_UNITS_DISABLED: BitSet<8> = match BitSet::new(256) {
    Some(units) => units,
    None => panic!("unit mask too small"),
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct RpcSizeEntry {
    unit_id: u8,
    function: u8,
    size: u16,
}

/// Expected RPC size (header included) per `(unit, function)`.
#[derive(Debug, Clone)]
pub struct RpcSizeTable {
    entries: heapless::Vec<RpcSizeEntry, RPC_SIZE_TABLE_CAPACITY>,
    disabled_units: BitSet<8>,
}

impl Default for RpcSizeTable {
    fn default() -> Self {
        Self::new()
    }
}

impl RpcSizeTable {
    pub fn new() -> Self {
        Self {
            entries: heapless::Vec::new(),
            disabled_units: NO_UNITS_DISABLED,
        }
    }

    /// Register or replace the size of one routing pair.
    pub fn register(&mut self, unit_id: u8, function: u8, size: u16) -> Result<(), Error> {
        if (size as usize) < RpcHeader::SIZE {
            return Err(Error::InvalidArgument);
        }
        if let Some(entry) = self
            .entries
            .iter_mut()
            .find(|e| e.unit_id == unit_id && e.function == function)
        {
            entry.size = size;
            return Ok(());
        }
        self.entries
            .push(RpcSizeEntry {
                unit_id,
                function,
                size,
            })
            .map_err(|_| Error::InvalidArgument)
    }

    /// Refuse every RPC for `unit_id` until re-enabled.
    pub fn disable_unit(&mut self, unit_id: u8) {
        let _ = self.disabled_units.set(unit_id as usize);
    }

    pub fn enable_unit(&mut self, unit_id: u8) {
        let _ = self.disabled_units.clear(unit_id as usize);
    }

    /// Size of an RPC, or a fault if the pair is unknown or its unit disabled.
    pub fn lookup(&self, unit_id: u8, function: u8) -> Result<u16, Fault> {
        let unsupported = Fault::UnsupportedRpc { unit_id, function };
        if self.disabled_units.get(unit_id as usize).unwrap_or(true) {
            return Err(unsupported);
        }
        self.entries
            .iter()
            .find(|e| e.unit_id == unit_id && e.function == function)
            .map(|e| e.size)
            .ok_or(unsupported)
    }

    /// Size of an RPC, zero if it cannot be processed.
    pub fn size_of(&self, unit_id: u8, function: u8) -> u16 {
        self.lookup(unit_id, function).unwrap_or(0)
    }
}

/// What a PTCB handler needs to pull its request out of the ring.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PtcbPayload {
    pub element_index: u32,
    /// Bytes to copy, from the size table.
    pub element_size: u16,
    /// Leave the slot for a later consumer to sweep.
    pub sweep_skip: bool,
}

/// Per-task command buffer queue serving a single inbound ring.
pub struct PtcbQueue<T, R, L> {
    config: PtcbQueueConfig,
    sizes: RpcSizeTable,
    channel: Mutex<Channel<T>>,
    regs: R,
    crash_log: L,
    sweeper: SweepEngine<1>,
    current: AtomicU32,
    descriptor: QueueDescriptor,
}

impl<T, R, L> PtcbQueue<T, R, L>
where
    T: SharedMemory,
    R: QueueRegisters + PrivilegeControl,
    L: CrashLog,
{
    /// Build the backend. The consume cursor starts at the hardware tail.
    pub fn new(
        config: PtcbQueueConfig,
        sizes: RpcSizeTable,
        transport: T,
        regs: R,
        crash_log: L,
    ) -> Result<Self, Error<T::Error>> {
        config.validate().map_err(|e| e.widen::<T::Error>())?;
        let mask = SweepMask::new(config.queue_id, config.cmd_queue.num_elements)
            .map_err(|e| e.widen::<T::Error>())?;

        let tail = regs.cmd_tail(config.queue_id);
        if !config.cmd_queue.contains(tail) {
            return Err(Error::InvalidState);
        }

        Ok(Self {
            descriptor: QueueDescriptor::init(&config.msg_queue),
            config,
            sizes,
            channel: Mutex::new(Channel::new(transport)),
            regs,
            crash_log,
            sweeper: SweepEngine::new([mask]),
            current: AtomicU32::new(tail),
        })
    }

    pub fn config(&self) -> &PtcbQueueConfig {
        &self.config
    }

    pub fn registers(&self) -> &R {
        &self.regs
    }

    pub fn sizes(&self) -> &RpcSizeTable {
        &self.sizes
    }

    pub fn descriptor(&self) -> &QueueDescriptor {
        &self.descriptor
    }

    /// Next position the consume loop will read.
    pub fn current(&self) -> u32 {
        self.current.load(Ordering::Relaxed)
    }

    /// True while some caller holds the transport lock.
    pub fn is_transport_busy(&self) -> bool {
        self.channel.is_locked()
    }

    pub fn sweep_mask(&self) -> Option<SweepMask> {
        self.sweeper.mask(self.config.queue_id)
    }

    /// Read the RPC header of the element at `position`.
    pub fn copy_in_header(&self, position: u32) -> Result<RpcHeader, Error<T::Error>> {
        let mut channel = self.channel.lock();
        self.copy_in_header_locked(&mut channel, position)
    }

    /// Drain the ring: route every entry between the consume cursor and the
    /// hardware head. Payloads are copied later by the handlers.
    ///
    /// A refused dispatch is fatal; the refused slot is never swept.
    pub fn process_command_queue<D>(&self, queue_id: u8, dispatcher: &mut D) -> Result<(), Error<T::Error>>
    where
        D: Dispatcher<PtcbPayload>,
    {
        if queue_id != self.config.queue_id {
            log::warn!("ptcb queue {} asked to drain queue {}", self.config.queue_id, queue_id);
            return Err(Error::InvalidState);
        }
        let ring = self.config.cmd_queue;

        loop {
            let head = self.regs.cmd_head(queue_id);
            if !ring.contains(head) {
                return Err(Error::InvalidState);
            }
            let position = self.current.load(Ordering::Relaxed);
            if position == head {
                return Ok(());
            }

            let mut channel = self.channel.lock();
            let header = self.copy_in_header_locked(&mut channel, position)?;

            let element_size = match self.sizes.lookup(header.unit_id, header.function) {
                Ok(size) => size,
                Err(fault) => return Err(trap(&self.crash_log, Error::Fatal(fault))),
            };
            let sweep_skip = (self.config.sweep_skip)(&header);
            self.current.store(ring.next(position), Ordering::Relaxed);

            log::trace!(
                "q{} slot {}: unit {} fn {} ({} bytes{})",
                queue_id,
                position,
                header.unit_id,
                header.function,
                element_size,
                if sweep_skip { ", sweep deferred" } else { "" }
            );

            let record = DispatchRecord {
                event: EventType::PtcbCommand,
                unit_id: header.unit_id,
                function: header.function,
                queue_id,
                payload: PtcbPayload {
                    element_index: position,
                    element_size,
                    sweep_skip,
                },
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

    /// Copy the RPC at `position` into `buf`, called by the handling task.
    ///
    /// Reads `element_size` rounded up to the DMA burst, so `buf` must hold the
    /// rounded size and be burst-aligned. The returned header carries
    /// `rpc_size` for the response. The slot is swept here unless
    /// `sweep_skip` is set.
    pub fn rpc_copy_in(
        &self,
        buf: &mut [u8],
        position: u32,
        element_size: u16,
        sweep_skip: bool,
    ) -> Result<RpcHeader, Error<T::Error>> {
        let ring = self.config.cmd_queue;
        let size = element_size as usize;
        let read_len = align_up(size, DMA_ALIGNMENT);

        if !ring.contains(position)
            || size < RpcHeader::SIZE
            || size > buf.len()
            || read_len > buf.len()
            || read_len > ring.element_size as usize
        {
            log::warn!("rpc copy-in rejected: slot {}, size {}, buffer {}", position, size, buf.len());
            return Err(Error::InvalidArgument);
        }
        if buf.as_ptr() as usize % DMA_ALIGNMENT != 0 {
            return Err(Error::InvalidArgument);
        }

        {
            let mut channel = self.channel.lock();
            channel
                .transport
                .read(&mut buf[..read_len], ring.slot_offset(position))
                .map_err(Error::Transport)?;
        }

        let Some(mut header) = RpcHeader::parse(buf) else {
            return Err(Error::InvalidArgument);
        };
        header.rpc_size = element_size;

        if !sweep_skip {
            self.sweep(position)?;
        }
        Ok(header)
    }

    /// Mark `position` finished and move the hardware tail. Used directly by a
    /// consumer that took over a deferred sweep.
    pub fn sweep(&self, position: u32) -> Result<u32, Error<T::Error>> {
        self.sweeper
            .sweep(&self.regs, self.config.queue_id, position)
            .map_err(|e| trap(&self.crash_log, e.widen::<T::Error>()))
    }

    /// Send the response held in `buf` (header slot first) for a request
    /// previously read with [`rpc_copy_in`](Self::rpc_copy_in).
    pub fn respond(&self, header: &RpcHeader, buf: &[u8]) -> Result<u32, Error<T::Error>> {
        let mut response = *header;
        response.flags |= FLAG_RESPONSE;
        let body = buf.get(RpcHeader::SIZE..).unwrap_or(&[]);
        self.post_message(&response, body, response.rpc_size as usize)
    }

    /// Post a message at the hardware message head. Returns the new head.
    pub fn post_message(&self, header: &RpcHeader, body: &[u8], size: usize) -> Result<u32, Error<T::Error>> {
        self.descriptor.post(&self.regs, self, header, body, size)
    }

    fn copy_in_header_locked(&self, channel: &mut Channel<T>, position: u32) -> Result<RpcHeader, Error<T::Error>> {
        let ring = self.config.cmd_queue;
        if !ring.contains(position) {
            return Err(Error::InvalidArgument);
        }
        let mut raw = [0u8; RpcHeader::SIZE];
        channel
            .transport
            .read(&mut raw, ring.slot_offset(position))
            .map_err(Error::Transport)?;
        Ok(RpcHeader::from_bytes(&raw))
    }
}

impl<T, R, L> DataPost for PtcbQueue<T, R, L>
where
    T: SharedMemory,
    R: QueueRegisters + PrivilegeControl,
    L: CrashLog,
{
    type Error = T::Error;

    /// Responses are sized by the `rpc_size` stamped on copy-in; requests use
    /// the caller's `size`.
    fn data_post(
        &self,
        head: &mut u32,
        header: &RpcHeader,
        body: &[u8],
        size: usize,
    ) -> Result<(), Error<T::Error>> {
        let size = if header.is_response() {
            header.rpc_size as usize
        } else {
            size
        };
        let mut channel = self.channel.lock();
        channel.post(&self.config.msg_queue, head, header, body, size)
    }
}
