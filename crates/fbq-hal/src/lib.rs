#![no_std]

/// Moves bytes between local memory and the shared framebuffer region.
///
/// Offsets are byte offsets into the shared region. Implementations are
/// synchronous: when a call returns `Ok`, the transfer has completed.
pub trait SharedMemory {
    type Error: core::fmt::Debug;

    /// Copy `dst.len()` bytes from the shared region at `offset` into `dst`.
    fn read(&mut self, dst: &mut [u8], offset: u32) -> Result<(), Self::Error>;

    /// Copy `src` into the shared region at `offset`.
    fn write(&mut self, src: &[u8], offset: u32) -> Result<(), Self::Error>;

    /// Make all previous writes visible to the remote side.
    fn flush(&mut self) -> Result<(), Self::Error>;
}

/// Head/tail registers of the inbound command rings and the outbound message ring.
///
/// Values are element positions, not byte offsets. The remote producer owns
/// command heads; the local side owns command tails and the message head.
pub trait QueueRegisters {
    fn cmd_head(&self, queue_id: u8) -> u32;
    fn set_cmd_head(&self, queue_id: u8, position: u32);
    fn cmd_tail(&self, queue_id: u8) -> u32;

    /// Write a command tail. Callers must hold an elevated privilege level;
    /// see [`PrivilegeControl`].
    fn set_cmd_tail(&self, queue_id: u8, position: u32);

    fn msg_head(&self) -> u32;
    fn set_msg_head(&self, position: u32);
    fn msg_tail(&self) -> u32;
    fn set_msg_tail(&self, position: u32);
}

/// Privilege level token returned by [`PrivilegeControl::elevate`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PrivilegeLevel(pub u8);

/// Temporary privilege elevation for write-protected registers.
pub trait PrivilegeControl {
    /// Raise the execution privilege, returning the level to restore.
    fn elevate(&self) -> PrivilegeLevel;

    /// Drop back to a level previously returned by `elevate`.
    fn restore(&self, previous: PrivilegeLevel);
}

/// Resident crash-context buffer read by the host after a fatal fault.
pub trait CrashLog {
    /// Replace the buffer contents. Data longer than the buffer is truncated.
    fn set(&self, data: &[u8]);

    /// Best-effort, non-blocking notification to the host.
    fn log(&self, data: &[u8], is_assert: bool);
}
