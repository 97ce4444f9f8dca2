//! Framebuffer-resident RPC queues between a host controller and a microcontroller.
//!
//! Platform-agnostic: all hardware access goes through the traits in `fbq-hal`.
//! Two backends share the wire format, the sweep engine and the outbound
//! message descriptor:
//!
//! - [`queue::heap::HeapQueue`] copies each command into a private pool.
//! - [`queue::ptcb::PtcbQueue`] copies each command straight into a buffer
//!   owned by the consuming task.

#![no_std]

pub mod bitset;
pub mod checksum;
pub mod config;
pub mod error;
pub mod queue;
pub mod sweep;
pub mod tracker;
pub mod wire;

pub use checksum::checksum16;
pub use config::{HeapQueueConfig, PtcbQueueConfig, RingGeometry};
pub use error::{DispatchStatus, Error, Fault};
pub use queue::heap::{HeapQueue, PoolClaim, RespondError};
pub use queue::ptcb::{PtcbPayload, PtcbQueue, RpcSizeTable};
pub use queue::{DataPost, DispatchRecord, Dispatcher, EventType, QueueDescriptor};
pub use wire::{EnvelopeHeader, RpcHeader};
