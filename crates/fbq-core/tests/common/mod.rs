//! Mock collaborators shared by the integration tests.
//!
//! Every mock is a cheap `Clone` over `Rc` state so a test can hand one copy
//! to the queue and keep another to inspect or play the remote side.

#![allow(dead_code)]

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use fbq_core::config::{align_up, RingGeometry, DMA_ALIGNMENT};
use fbq_core::wire::{EnvelopeHeader, RpcHeader};
use fbq_core::{DispatchRecord, DispatchStatus, Dispatcher};
use fbq_hal::{CrashLog, PrivilegeControl, PrivilegeLevel, QueueRegisters, SharedMemory};

/// Routing unit that keeps the transport lock across dispatch in the test configs.
pub const LPWR_UNIT: u8 = 0x20;
pub const UNIT_A: u8 = 0x10;
pub const UNIT_B: u8 = 0x11;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MockError;

/// Shared framebuffer region with failure injection.
#[derive(Clone)]
pub struct MockMemory {
    bytes: Rc<RefCell<Vec<u8>>>,
    /// Reads left before the next read fails.
    reads_until_failure: Rc<Cell<Option<usize>>>,
    fail_writes: Rc<Cell<bool>>,
    flushes: Rc<Cell<usize>>,
}

impl MockMemory {
    pub fn new(size: usize) -> Self {
        Self {
            bytes: Rc::new(RefCell::new(vec![0; size])),
            reads_until_failure: Rc::new(Cell::new(None)),
            fail_writes: Rc::new(Cell::new(false)),
            flushes: Rc::new(Cell::new(0)),
        }
    }

    /// Remote-side write, bypassing failure injection.
    pub fn poke(&self, offset: u32, data: &[u8]) {
        let start = offset as usize;
        self.bytes.borrow_mut()[start..start + data.len()].copy_from_slice(data);
    }

    /// Remote-side read.
    pub fn peek(&self, offset: u32, len: usize) -> Vec<u8> {
        let start = offset as usize;
        self.bytes.borrow()[start..start + len].to_vec()
    }

    /// Let `ok` more reads succeed, then fail the next one.
    pub fn fail_read_after(&self, ok: usize) {
        self.reads_until_failure.set(Some(ok));
    }

    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.set(fail);
    }

    pub fn flushes(&self) -> usize {
        self.flushes.get()
    }
}

impl SharedMemory for MockMemory {
    type Error = MockError;

    fn read(&mut self, dst: &mut [u8], offset: u32) -> Result<(), Self::Error> {
        if let Some(left) = self.reads_until_failure.get() {
            if left == 0 {
                self.reads_until_failure.set(None);
                return Err(MockError);
            }
            self.reads_until_failure.set(Some(left - 1));
        }
        let start = offset as usize;
        let bytes = self.bytes.borrow();
        let src = bytes.get(start..start + dst.len()).ok_or(MockError)?;
        dst.copy_from_slice(src);
        Ok(())
    }

    fn write(&mut self, src: &[u8], offset: u32) -> Result<(), Self::Error> {
        if self.fail_writes.get() {
            return Err(MockError);
        }
        let start = offset as usize;
        let mut bytes = self.bytes.borrow_mut();
        let dst = bytes.get_mut(start..start + src.len()).ok_or(MockError)?;
        dst.copy_from_slice(src);
        Ok(())
    }

    fn flush(&mut self) -> Result<(), Self::Error> {
        self.flushes.set(self.flushes.get() + 1);
        Ok(())
    }
}

/// Captured tail write: (queue id, value, privilege level at the time).
pub type TailWrite = (u8, u32, u8);

pub const USER_LEVEL: u8 = 0;
pub const ELEVATED_LEVEL: u8 = 2;

#[derive(Default)]
struct RegisterFile {
    cmd_head: [Cell<u32>; 4],
    cmd_tail: [Cell<u32>; 4],
    msg_head: Cell<u32>,
    msg_tail: Cell<u32>,
    privilege: Cell<u8>,
    tail_writes: RefCell<Vec<TailWrite>>,
}

#[derive(Clone, Default)]
pub struct MockRegisters {
    file: Rc<RegisterFile>,
}

impl MockRegisters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_cmd_tail_raw(&self, queue_id: u8, value: u32) {
        self.file.cmd_tail[queue_id as usize].set(value);
    }

    pub fn privilege(&self) -> u8 {
        self.file.privilege.get()
    }

    pub fn tail_writes(&self) -> Vec<TailWrite> {
        self.file.tail_writes.borrow().clone()
    }
}

impl QueueRegisters for MockRegisters {
    fn cmd_head(&self, queue_id: u8) -> u32 {
        self.file.cmd_head[queue_id as usize].get()
    }

    fn set_cmd_head(&self, queue_id: u8, position: u32) {
        self.file.cmd_head[queue_id as usize].set(position);
    }

    fn cmd_tail(&self, queue_id: u8) -> u32 {
        self.file.cmd_tail[queue_id as usize].get()
    }

    fn set_cmd_tail(&self, queue_id: u8, position: u32) {
        self.file
            .tail_writes
            .borrow_mut()
            .push((queue_id, position, self.file.privilege.get()));
        self.file.cmd_tail[queue_id as usize].set(position);
    }

    fn msg_head(&self) -> u32 {
        self.file.msg_head.get()
    }

    fn set_msg_head(&self, position: u32) {
        self.file.msg_head.set(position);
    }

    fn msg_tail(&self) -> u32 {
        self.file.msg_tail.get()
    }

    fn set_msg_tail(&self, position: u32) {
        self.file.msg_tail.set(position);
    }
}

impl PrivilegeControl for MockRegisters {
    fn elevate(&self) -> PrivilegeLevel {
        let previous = self.file.privilege.replace(ELEVATED_LEVEL);
        PrivilegeLevel(previous)
    }

    fn restore(&self, previous: PrivilegeLevel) {
        self.file.privilege.set(previous.0);
    }
}

#[derive(Clone, Default)]
pub struct MockCrashLog {
    buffer: Rc<RefCell<Vec<u8>>>,
    asserts: Rc<Cell<usize>>,
}

impl MockCrashLog {
    pub fn buffer(&self) -> Vec<u8> {
        self.buffer.borrow().clone()
    }

    pub fn asserts(&self) -> usize {
        self.asserts.get()
    }
}

impl CrashLog for MockCrashLog {
    fn set(&self, data: &[u8]) {
        let mut buffer = self.buffer.borrow_mut();
        buffer.clear();
        buffer.extend_from_slice(&data[..data.len().min(32)]);
    }

    fn log(&self, _data: &[u8], is_assert: bool) {
        if is_assert {
            self.asserts.set(self.asserts.get() + 1);
        }
    }
}

/// Dispatcher that keeps every record and can refuse a unit.
pub struct RecordingDispatcher<P> {
    pub records: Vec<DispatchRecord<P>>,
    pub reject_unit: Option<u8>,
}

impl<P> RecordingDispatcher<P> {
    pub fn new() -> Self {
        Self {
            records: Vec::new(),
            reject_unit: None,
        }
    }
}

impl<P> Dispatcher<P> for RecordingDispatcher<P> {
    fn dispatch(&mut self, record: DispatchRecord<P>) -> Result<(), DispatchStatus> {
        if self.reject_unit == Some(record.unit_id) {
            return Err(DispatchStatus(0x7F));
        }
        self.records.push(record);
        Ok(())
    }
}

/// Remote producer for a heap-backed ring: writes one element and bumps head.
/// Returns the slot used.
pub fn push_heap_command(
    mem: &MockMemory,
    regs: &MockRegisters,
    ring: &RingGeometry,
    queue_id: u8,
    header: RpcHeader,
    body: &[u8],
    heap_offset: u16,
) -> u32 {
    let position = regs.cmd_head(queue_id);
    let rpc_len = RpcHeader::SIZE + body.len();
    let heap_size = align_up(EnvelopeHeader::SIZE + rpc_len, DMA_ALIGNMENT) as u16;

    let envelope = EnvelopeHeader {
        element_index: position as u16,
        heap_offset,
        heap_size,
    };
    let mut rpc = header;
    rpc.size = rpc_len as u16;

    let slot = ring.slot_offset(position);
    mem.poke(slot, &envelope.to_bytes());
    mem.poke(slot + EnvelopeHeader::SIZE as u32, &rpc.to_bytes());
    mem.poke(slot + (EnvelopeHeader::SIZE + RpcHeader::SIZE) as u32, body);
    regs.set_cmd_head(queue_id, ring.next(position));
    position
}

/// Remote producer for a PTCB ring. Returns the slot used.
pub fn push_ptcb_command(
    mem: &MockMemory,
    regs: &MockRegisters,
    ring: &RingGeometry,
    queue_id: u8,
    header: RpcHeader,
    body: &[u8],
) -> u32 {
    let position = regs.cmd_head(queue_id);
    let mut rpc = header;
    rpc.size = (RpcHeader::SIZE + body.len()) as u16;

    let slot = ring.slot_offset(position);
    mem.poke(slot, &rpc.to_bytes());
    mem.poke(slot + RpcHeader::SIZE as u32, body);
    regs.set_cmd_head(queue_id, ring.next(position));
    position
}

/// Remote consumer view of one outbound slot: decoded header and the
/// `size` bytes it covers.
pub fn read_message(mem: &MockMemory, ring: &RingGeometry, position: u32) -> (RpcHeader, Vec<u8>) {
    let slot = ring.slot_offset(position);
    let raw = mem.peek(slot, RpcHeader::SIZE);
    let header = RpcHeader::parse(&raw).expect("slot holds a header");
    let whole = mem.peek(slot, header.size as usize);
    (header, whole)
}

/// Burst-aligned scratch buffer for PTCB copy-in.
#[repr(C, align(16))]
pub struct AlignedBuf(pub [u8; 128]);

impl AlignedBuf {
    pub fn new() -> Self {
        Self([0; 128])
    }
}
