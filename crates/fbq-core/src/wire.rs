//! Wire layout of the envelope and RPC headers in the shared region.
//!
//! All multi-byte fields are little-endian.

use crate::checksum::{checksum16, checksum_complement};
use crate::config::MAX_ATOMIC_READ;

/// Routing unit of the queue management layer itself.
pub const UNIT_CMDMGMT: u8 = 0x01;
/// Acknowledgement that a heap-queue entry has been copied back and swept.
pub const CMDMGMT_FN_HEAP_ACK: u8 = 0x01;

/// `RpcHeader::flags` bit marking a response (clear for a request).
pub const FLAG_RESPONSE: u8 = 1 << 0;

/// Byte offset of the checksum field inside an encoded `RpcHeader`.
pub const CHECKSUM_OFFSET: usize = 6;

const _: () = assert!(EnvelopeHeader::SIZE.is_power_of_two() && EnvelopeHeader::SIZE <= MAX_ATOMIC_READ);
const _: () = assert!(RpcHeader::SIZE.is_power_of_two() && RpcHeader::SIZE <= MAX_ATOMIC_READ);

/// Heap-backend element prefix describing where the payload lives in the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EnvelopeHeader {
    /// Index of this entry within its ring.
    pub element_index: u16,
    /// Pool offset, aligned to the pool granularity.
    pub heap_offset: u16,
    /// Bytes to copy, envelope included, rounded to the pool granularity.
    pub heap_size: u16,
}

impl EnvelopeHeader {
    pub const SIZE: usize = 8;

    pub fn from_bytes(b: &[u8; Self::SIZE]) -> Self {
        Self {
            element_index: u16::from_le_bytes([b[0], b[1]]),
            heap_offset: u16::from_le_bytes([b[2], b[3]]),
            heap_size: u16::from_le_bytes([b[4], b[5]]),
        }
    }

    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut b = [0u8; Self::SIZE];
        b[0..2].copy_from_slice(&self.element_index.to_le_bytes());
        b[2..4].copy_from_slice(&self.heap_offset.to_le_bytes());
        b[4..6].copy_from_slice(&self.heap_size.to_le_bytes());
        b
    }

    /// Decode from the front of `buf`. Returns `None` if `buf` is too short.
    pub fn parse(buf: &[u8]) -> Option<Self> {
        let bytes: &[u8; Self::SIZE] = buf.get(..Self::SIZE)?.try_into().ok()?;
        Some(Self::from_bytes(bytes))
    }
}

/// Header at the front of every RPC, inbound and outbound.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RpcHeader {
    pub unit_id: u8,
    pub function: u8,
    /// Request/response marker (PTCB); see [`FLAG_RESPONSE`].
    pub flags: u8,
    /// Total message length in bytes, header included.
    pub size: u16,
    pub checksum: u16,
    pub sequence_number: u32,
    /// Payload length learned from the size table on PTCB copy-in. Not on the wire.
    pub rpc_size: u16,
}

impl RpcHeader {
    pub const SIZE: usize = 16;

    pub fn new(unit_id: u8, function: u8) -> Self {
        Self {
            unit_id,
            function,
            ..Self::default()
        }
    }

    pub fn is_response(&self) -> bool {
        self.flags & FLAG_RESPONSE != 0
    }

    pub fn from_bytes(b: &[u8; Self::SIZE]) -> Self {
        Self {
            unit_id: b[0],
            function: b[1],
            flags: b[2],
            size: u16::from_le_bytes([b[4], b[5]]),
            checksum: u16::from_le_bytes([b[6], b[7]]),
            sequence_number: u32::from_le_bytes([b[8], b[9], b[10], b[11]]),
            rpc_size: 0,
        }
    }

    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut b = [0u8; Self::SIZE];
        b[0] = self.unit_id;
        b[1] = self.function;
        b[2] = self.flags;
        b[4..6].copy_from_slice(&self.size.to_le_bytes());
        b[6..8].copy_from_slice(&self.checksum.to_le_bytes());
        b[8..12].copy_from_slice(&self.sequence_number.to_le_bytes());
        b
    }

    /// Decode from the front of `buf`. Returns `None` if `buf` is too short.
    pub fn parse(buf: &[u8]) -> Option<Self> {
        let bytes: &[u8; Self::SIZE] = buf.get(..Self::SIZE)?.try_into().ok()?;
        Some(Self::from_bytes(bytes))
    }
}

/// Zero the checksum field of an encoded message, then store the value that
/// makes the whole message sum to zero. Returns the stored checksum.
///
/// `msg` must start with an encoded `RpcHeader`.
pub fn seal(msg: &mut [u8]) -> u16 {
    msg[CHECKSUM_OFFSET..CHECKSUM_OFFSET + 2].fill(0);
    let checksum = checksum_complement(msg);
    msg[CHECKSUM_OFFSET..CHECKSUM_OFFSET + 2].copy_from_slice(&checksum.to_le_bytes());
    checksum
}

/// True if a sealed message still sums to zero.
pub fn verify(msg: &[u8]) -> bool {
    checksum16(msg) == 0
}
