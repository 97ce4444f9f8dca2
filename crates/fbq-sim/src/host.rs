//! The remote module's side of the queues: a producer filling the command
//! rings and a consumer draining the message ring.

use std::collections::HashMap;

use fbq_core::config::{align_up, RingGeometry, DMA_ALIGNMENT};
use fbq_core::wire::{self, EnvelopeHeader, RpcHeader};
use fbq_hal::QueueRegisters;
use rand::Rng;

use crate::error::SimError;
use crate::transport::{Registers, SharedRegion};

/// Leading body bytes naming the request. Handlers leave them untouched.
pub const TAG_SIZE: usize = 4;

/// Turn a request body into its response: everything after the tag is inverted.
pub fn transform(body: &mut [u8]) {
    for b in body.iter_mut().skip(TAG_SIZE) {
        *b = !*b;
    }
}

fn tag_of(body: &[u8]) -> Option<u32> {
    let tag: [u8; TAG_SIZE] = body.get(..TAG_SIZE)?.try_into().ok()?;
    Some(u32::from_le_bytes(tag))
}

/// Ring placement in the shared region: command rings back to back, then the
/// message ring.
#[derive(Debug, Clone)]
pub struct Layout {
    pub cmd: Vec<RingGeometry>,
    pub msg: RingGeometry,
}

impl Layout {
    pub fn new(cmd_rings: usize, num_elements: u32, element_size: u32) -> Self {
        let mut base = 0;
        let cmd = (0..cmd_rings)
            .map(|_| {
                let ring = RingGeometry::new(base, num_elements, element_size);
                base += ring.span();
                ring
            })
            .collect();
        Self {
            cmd,
            msg: RingGeometry::new(base, num_elements, element_size),
        }
    }

    pub fn region_size(&self) -> usize {
        (self.msg.base + self.msg.span()) as usize
    }

    /// Pool bytes needed to give every command slot its own region.
    pub fn pool_size(&self) -> u32 {
        self.cmd.iter().map(RingGeometry::span).sum()
    }
}

/// Remote producer. Keeps every request body until its response is checked.
pub struct Producer {
    region: SharedRegion,
    regs: Registers,
    rings: Vec<RingGeometry>,
    next_tag: u32,
    outstanding: HashMap<u32, Vec<u8>>,
}

impl Producer {
    pub fn new(region: SharedRegion, regs: Registers, rings: Vec<RingGeometry>) -> Self {
        Self {
            region,
            regs,
            rings,
            next_tag: 0,
            outstanding: HashMap::new(),
        }
    }

    /// Requests sent and not yet answered.
    pub fn outstanding(&self) -> usize {
        self.outstanding.len()
    }

    /// Write a heap-backend element (envelope, header, `body_len` body bytes).
    /// Returns `false` if the ring is full.
    pub fn push_heap<G: Rng>(
        &mut self,
        queue_id: u8,
        header: RpcHeader,
        body_len: usize,
        rng: &mut G,
    ) -> Result<bool, SimError> {
        let Some((ring, position)) = self.free_slot(queue_id) else {
            return Ok(false);
        };
        let body = self.request_body(body_len, rng);
        let rpc_len = RpcHeader::SIZE + body.len();

        // Each slot of each ring owns one element-sized pool region.
        let heap_offset = (queue_id as u32 * ring.num_elements + position) * ring.element_size;
        let envelope = EnvelopeHeader {
            element_index: position as u16,
            heap_offset: heap_offset as u16,
            heap_size: align_up(EnvelopeHeader::SIZE + rpc_len, DMA_ALIGNMENT) as u16,
        };
        let mut rpc = header;
        rpc.size = rpc_len as u16;

        let slot = ring.slot_offset(position);
        self.region.store(slot, &envelope.to_bytes())?;
        self.region.store(slot + EnvelopeHeader::SIZE as u32, &rpc.to_bytes())?;
        self.region
            .store(slot + (EnvelopeHeader::SIZE + RpcHeader::SIZE) as u32, &body)?;
        self.publish(queue_id, &ring, position, body);
        Ok(true)
    }

    /// Write a PTCB element (header then `body_len` body bytes).
    /// Returns `false` if the ring is full.
    pub fn push_ptcb<G: Rng>(
        &mut self,
        queue_id: u8,
        header: RpcHeader,
        body_len: usize,
        rng: &mut G,
    ) -> Result<bool, SimError> {
        let Some((ring, position)) = self.free_slot(queue_id) else {
            return Ok(false);
        };
        let body = self.request_body(body_len, rng);
        let mut rpc = header;
        rpc.size = (RpcHeader::SIZE + body.len()) as u16;

        let slot = ring.slot_offset(position);
        self.region.store(slot, &rpc.to_bytes())?;
        self.region.store(slot + RpcHeader::SIZE as u32, &body)?;
        self.publish(queue_id, &ring, position, body);
        Ok(true)
    }

    /// Check the entry a heap acknowledgement names was written back with
    /// its response.
    pub fn check_written_back(&mut self, queue_id: u8, element_index: u16) -> Result<(), SimError> {
        let Some(ring) = self.rings.get(queue_id as usize) else {
            return Err(SimError::Config(format!("acknowledgement for unknown queue {queue_id}")));
        };
        let slot = ring.slot_offset(element_index as u32) + EnvelopeHeader::SIZE as u32;
        let raw = self.region.load(slot, RpcHeader::SIZE)?;
        let size = RpcHeader::parse(&raw).map_or(0, |h| h.size as usize);
        let body = self
            .region
            .load(slot + RpcHeader::SIZE as u32, size.saturating_sub(RpcHeader::SIZE))?;
        self.check_response(&body)
    }

    /// Check a response body against the request it answers.
    pub fn check_response(&mut self, body: &[u8]) -> Result<(), SimError> {
        let Some(tag) = tag_of(body) else {
            return Err(SimError::ResponseMismatch { tag: u32::MAX });
        };
        let Some(mut expected) = self.outstanding.remove(&tag) else {
            return Err(SimError::ResponseMismatch { tag });
        };
        transform(&mut expected);
        if expected != body {
            return Err(SimError::ResponseMismatch { tag });
        }
        Ok(())
    }

    fn free_slot(&self, queue_id: u8) -> Option<(RingGeometry, u32)> {
        let ring = *self.rings.get(queue_id as usize)?;
        let head = self.regs.cmd_head(queue_id);
        if ring.next(head) == self.regs.cmd_tail(queue_id) {
            return None;
        }
        Some((ring, head))
    }

    fn request_body<G: Rng>(&mut self, len: usize, rng: &mut G) -> Vec<u8> {
        let tag = self.next_tag;
        self.next_tag = self.next_tag.wrapping_add(1);

        let mut body = vec![0u8; len.max(TAG_SIZE)];
        body[..TAG_SIZE].copy_from_slice(&tag.to_le_bytes());
        rng.fill(&mut body[TAG_SIZE..]);
        body
    }

    fn publish(&mut self, queue_id: u8, ring: &RingGeometry, position: u32, body: Vec<u8>) {
        if let Some(tag) = tag_of(&body) {
            log::trace!("remote: request {} in q{} slot {}", tag, queue_id, position);
            self.outstanding.insert(tag, body);
        }
        self.regs.set_cmd_head(queue_id, ring.next(position));
    }
}

/// Remote consumer of the message ring.
pub struct Consumer {
    region: SharedRegion,
    regs: Registers,
    ring: RingGeometry,
    next_sequence: u32,
}

impl Consumer {
    pub fn new(region: SharedRegion, regs: Registers, ring: RingGeometry) -> Self {
        Self {
            region,
            regs,
            ring,
            next_sequence: 0,
        }
    }

    /// Read every message between tail and head, checking checksum and
    /// sequence, and hand the slots back. Returns each header with the full
    /// message bytes.
    pub fn drain(&mut self) -> Result<Vec<(RpcHeader, Vec<u8>)>, SimError> {
        let head = self.regs.msg_head();
        let mut tail = self.regs.msg_tail();
        let mut messages = Vec::new();

        while tail != head {
            let slot = self.ring.slot_offset(tail);
            let raw = self.region.load(slot, RpcHeader::SIZE)?;
            let header = RpcHeader::parse(&raw).ok_or(SimError::Malformed { slot: tail, size: 0 })?;

            let size = header.size as usize;
            if size < RpcHeader::SIZE || size > self.ring.element_size as usize {
                return Err(SimError::Malformed {
                    slot: tail,
                    size: header.size,
                });
            }
            let whole = self.region.load(slot, size)?;
            if !wire::verify(&whole) {
                return Err(SimError::BadChecksum { slot: tail });
            }
            if header.sequence_number != self.next_sequence {
                return Err(SimError::SequenceGap {
                    slot: tail,
                    expected: self.next_sequence,
                    got: header.sequence_number,
                });
            }
            self.next_sequence = self.next_sequence.wrapping_add(1);
            messages.push((header, whole));

            tail = self.ring.next(tail);
            self.regs.set_msg_tail(tail);
        }
        Ok(messages)
    }
}
