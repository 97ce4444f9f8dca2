use crate::transport::RegionError;

/// Errors that can stop a simulation run.
#[derive(Debug, thiserror::Error)]
pub enum SimError {
    /// Settings the queues cannot be built with.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// A queue operation failed.
    #[error("queue error: {0}")]
    Queue(#[from] fbq_core::Error<RegionError>),

    /// The remote side touched memory outside the shared region.
    #[error("region access error: {0}")]
    Region(#[from] RegionError),

    /// A message header whose size does not fit the message ring.
    #[error("message slot {slot}: malformed header (size {size})")]
    Malformed { slot: u32, size: u16 },

    #[error("message slot {slot}: checksum mismatch")]
    BadChecksum { slot: u32 },

    #[error("message slot {slot}: expected sequence {expected}, got {got}")]
    SequenceGap { slot: u32, expected: u32, got: u32 },

    #[error("unexpected message: unit {unit_id:#04x} fn {function:#04x}")]
    UnexpectedMessage { unit_id: u8, function: u8 },

    /// A response or written-back entry that does not match its request.
    #[error("request {tag}: response does not match")]
    ResponseMismatch { tag: u32 },
}
