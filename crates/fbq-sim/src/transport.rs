//! In-memory stand-ins for the shared framebuffer region, the queue register
//! block and the crash-log buffer.
//!
//! Each is a cheap `Clone` over shared state so the queue under test and the
//! simulated remote module can hold their own handles.

use std::cell::{Cell, RefCell};
use std::ops::Range;
use std::rc::Rc;

use fbq_hal::{CrashLog, PrivilegeControl, PrivilegeLevel, QueueRegisters, SharedMemory};

/// Command rings the register block exposes.
pub const CMD_QUEUE_REGISTERS: usize = 2;

/// Resident crash buffer size; longer records are truncated.
pub const CRASH_BUFFER_SIZE: usize = 32;

const USER: u8 = 0;
const SUPERVISOR: u8 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("access {offset:#x}+{len} outside {size}-byte region")]
pub struct RegionError {
    pub offset: u32,
    pub len: usize,
    pub size: usize,
}

/// Byte-addressed shared region.
#[derive(Clone)]
pub struct SharedRegion {
    bytes: Rc<RefCell<Vec<u8>>>,
    flushes: Rc<Cell<u64>>,
}

impl SharedRegion {
    pub fn new(size: usize) -> Self {
        Self {
            bytes: Rc::new(RefCell::new(vec![0; size])),
            flushes: Rc::new(Cell::new(0)),
        }
    }

    pub fn size(&self) -> usize {
        self.bytes.borrow().len()
    }

    /// Remote-side write.
    pub fn store(&self, offset: u32, data: &[u8]) -> Result<(), RegionError> {
        let range = self.range(offset, data.len())?;
        self.bytes.borrow_mut()[range].copy_from_slice(data);
        Ok(())
    }

    /// Remote-side read.
    pub fn load(&self, offset: u32, len: usize) -> Result<Vec<u8>, RegionError> {
        let range = self.range(offset, len)?;
        Ok(self.bytes.borrow()[range].to_vec())
    }

    pub fn flushes(&self) -> u64 {
        self.flushes.get()
    }

    fn range(&self, offset: u32, len: usize) -> Result<Range<usize>, RegionError> {
        let size = self.size();
        let start = offset as usize;
        match start.checked_add(len) {
            Some(end) if end <= size => Ok(start..end),
            _ => Err(RegionError { offset, len, size }),
        }
    }
}

impl SharedMemory for SharedRegion {
    type Error = RegionError;

    fn read(&mut self, dst: &mut [u8], offset: u32) -> Result<(), Self::Error> {
        let range = self.range(offset, dst.len())?;
        dst.copy_from_slice(&self.bytes.borrow()[range]);
        Ok(())
    }

    fn write(&mut self, src: &[u8], offset: u32) -> Result<(), Self::Error> {
        self.store(offset, src)
    }

    fn flush(&mut self) -> Result<(), Self::Error> {
        self.flushes.set(self.flushes.get() + 1);
        Ok(())
    }
}

#[derive(Default)]
struct RegisterFile {
    cmd_head: [Cell<u32>; CMD_QUEUE_REGISTERS],
    cmd_tail: [Cell<u32>; CMD_QUEUE_REGISTERS],
    msg_head: Cell<u32>,
    msg_tail: Cell<u32>,
    privilege: Cell<u8>,
    rejected_writes: Cell<u32>,
}

/// Queue register block. Command tails are write-protected: a write made
/// without elevated privilege is dropped and counted.
#[derive(Clone, Default)]
pub struct Registers {
    file: Rc<RegisterFile>,
}

impl Registers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Protected writes dropped because the caller was not elevated.
    pub fn rejected_writes(&self) -> u32 {
        self.file.rejected_writes.get()
    }
}

impl QueueRegisters for Registers {
    // Unknown queues read as an out-of-range pointer.
    fn cmd_head(&self, queue_id: u8) -> u32 {
        self.file
            .cmd_head
            .get(queue_id as usize)
            .map_or(u32::MAX, Cell::get)
    }

    fn set_cmd_head(&self, queue_id: u8, position: u32) {
        if let Some(reg) = self.file.cmd_head.get(queue_id as usize) {
            reg.set(position);
        }
    }

    fn cmd_tail(&self, queue_id: u8) -> u32 {
        self.file
            .cmd_tail
            .get(queue_id as usize)
            .map_or(u32::MAX, Cell::get)
    }

    fn set_cmd_tail(&self, queue_id: u8, position: u32) {
        if self.file.privilege.get() == USER {
            log::warn!("unprivileged write to q{} tail dropped", queue_id);
            self.file.rejected_writes.set(self.file.rejected_writes.get() + 1);
            return;
        }
        if let Some(reg) = self.file.cmd_tail.get(queue_id as usize) {
            reg.set(position);
        }
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

impl PrivilegeControl for Registers {
    fn elevate(&self) -> PrivilegeLevel {
        PrivilegeLevel(self.file.privilege.replace(SUPERVISOR))
    }

    fn restore(&self, previous: PrivilegeLevel) {
        self.file.privilege.set(previous.0);
    }
}

/// Crash-log buffer that also reports every record through `log`.
#[derive(Clone, Default)]
pub struct CrashBuffer {
    last: Rc<RefCell<Vec<u8>>>,
    asserts: Rc<Cell<u32>>,
}

impl CrashBuffer {
    pub fn last(&self) -> Vec<u8> {
        self.last.borrow().clone()
    }

    pub fn asserts(&self) -> u32 {
        self.asserts.get()
    }
}

impl CrashLog for CrashBuffer {
    fn set(&self, data: &[u8]) {
        let mut last = self.last.borrow_mut();
        last.clear();
        last.extend_from_slice(&data[..data.len().min(CRASH_BUFFER_SIZE)]);
    }

    fn log(&self, data: &[u8], is_assert: bool) {
        if is_assert {
            self.asserts.set(self.asserts.get() + 1);
        }
        log::error!("crash log{}: {:02x?}", if is_assert { " (assert)" } else { "" }, data);
    }
}
