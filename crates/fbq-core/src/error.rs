//! Error taxonomy shared by every queue operation.

use core::convert::Infallible;

use fbq_hal::CrashLog;

/// Status code returned by a [`Dispatcher`](crate::queue::Dispatcher) that refused a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct DispatchStatus(pub u8);

/// Invariant violations. Any of these means the queue state can no longer be trusted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Fault {
    /// Pool units were already in use.
    DoubleAllocation,
    /// Pool units were already free.
    DoubleFree,
    /// A ring entry was marked complete twice.
    AlreadySwept { queue_id: u8, index: u32 },
    /// Hardware head or tail points outside the ring.
    RingPointerOutOfRange { queue_id: u8, head: u32, tail: u32 },
    /// No payload size is known for this routing pair, or the unit is disabled.
    UnsupportedRpc { unit_id: u8, function: u8 },
}

impl Fault {
    /// Fixed-size record written to the crash log before the fault is surfaced.
    pub fn record(&self) -> [u8; 8] {
        let mut rec = [0u8; 8];
        match *self {
            Fault::DoubleAllocation => rec[0] = 1,
            Fault::DoubleFree => rec[0] = 2,
            Fault::AlreadySwept { queue_id, index } => {
                rec[0] = 3;
                rec[1] = queue_id;
                rec[4..8].copy_from_slice(&index.to_le_bytes());
            }
            Fault::RingPointerOutOfRange { queue_id, head, tail } => {
                rec[0] = 4;
                rec[1] = queue_id;
                rec[2..5].copy_from_slice(&head.to_le_bytes()[..3]);
                rec[5..8].copy_from_slice(&tail.to_le_bytes()[..3]);
            }
            Fault::UnsupportedRpc { unit_id, function } => {
                rec[0] = 5;
                rec[1] = unit_id;
                rec[2] = function;
            }
        }
        rec
    }
}

/// Error type for queue operations, generic over the shared-memory transport error.
///
/// Operations that never touch the transport return `Error<Infallible>` and are
/// converted with [`Error::widen`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Error<E = Infallible> {
    /// Bad index, size or alignment supplied by the caller.
    InvalidArgument,
    /// Ring position inconsistent with the hardware registers or the wire data.
    InvalidState,
    /// The outbound ring has no free slot.
    QueueFull,
    /// Shared-memory transport failure.
    Transport(E),
    /// The dispatch collaborator rejected a record.
    Dispatch(DispatchStatus),
    /// Unrecoverable invariant violation.
    Fatal(Fault),
}

impl<E> Error<E> {
    /// True for errors that leave the queue in an untrusted state.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::Fatal(_) | Error::InvalidState | Error::Dispatch(_))
    }

    /// Crash-log record for errors that are trapped, `None` for the rest.
    pub fn crash_record(&self) -> Option<[u8; 8]> {
        match self {
            Error::Fatal(fault) => Some(fault.record()),
            Error::Dispatch(status) => {
                let mut rec = [0u8; 8];
                rec[0] = 6;
                rec[1] = status.0;
                Some(rec)
            }
            _ => None,
        }
    }
}

impl Error<Infallible> {
    /// Convert a transport-free error into any transport's error type.
    pub fn widen<E>(self) -> Error<E> {
        match self {
            Error::InvalidArgument => Error::InvalidArgument,
            Error::InvalidState => Error::InvalidState,
            Error::QueueFull => Error::QueueFull,
            Error::Transport(never) => match never {},
            Error::Dispatch(status) => Error::Dispatch(status),
            Error::Fatal(fault) => Error::Fatal(fault),
        }
    }
}

impl<E> From<Fault> for Error<E> {
    fn from(fault: Fault) -> Self {
        Error::Fatal(fault)
    }
}

impl<E: core::fmt::Debug> core::fmt::Display for Error<E> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Error::InvalidArgument => write!(f, "invalid argument"),
            Error::InvalidState => write!(f, "ring state inconsistent with hardware"),
            Error::QueueFull => write!(f, "message queue full"),
            Error::Transport(e) => write!(f, "transport error: {e:?}"),
            Error::Dispatch(status) => write!(f, "dispatch rejected with status {}", status.0),
            Error::Fatal(fault) => write!(f, "fatal fault: {fault:?}"),
        }
    }
}

impl<E: core::fmt::Debug> core::error::Error for Error<E> {}

/// Record a fault or a refused dispatch in the crash log before handing it
/// back to the caller.
pub(crate) fn trap<L: CrashLog, E>(crash_log: &L, err: Error<E>) -> Error<E> {
    if let Some(record) = err.crash_record() {
        match &err {
            Error::Dispatch(status) => log::error!("queue trap: dispatch refused with status {}", status.0),
            Error::Fatal(fault) => log::error!("queue trap: {:?}", fault),
            _ => {}
        }
        crash_log.set(&record);
        crash_log.log(&record, true);
    }
    err
}
