//! One simulation run: build a backend over the in-memory transport, then let
//! the remote producer, the consume loop, the handler task and the remote
//! consumer take turns until every request is answered.

use fbq_core::config::{
    HeapQueueConfig, PtcbQueueConfig, DMA_ALIGNMENT, HEAP_QUEUE_COUNT, MAX_RING_ELEMENTS, POOL_CAPACITY,
    STAGING_CAPACITY,
};
use fbq_core::queue::heap::HEAP_ACK_BODY_SIZE;
use fbq_core::wire::{EnvelopeHeader, RpcHeader, CMDMGMT_FN_HEAP_ACK, UNIT_CMDMGMT};
use fbq_core::{HeapQueue, PoolClaim, PtcbPayload, PtcbQueue, RpcSizeTable};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::error::SimError;
use crate::handler::HandlerTask;
use crate::host::{transform, Consumer, Layout, Producer, TAG_SIZE};
use crate::transport::{CrashBuffer, RegionError, Registers, SharedRegion};

pub const UNIT_ECHO: u8 = 0x10;
/// Low-power unit: keeps the transport lock across dispatch and is serviced
/// ahead of everything else.
pub const UNIT_LPWR: u8 = 0x20;
/// PTCB requests whose sweep is left to a later consumer.
pub const UNIT_DEFER: u8 = 0x30;

const HEAP_UNITS: [u8; 3] = [UNIT_ECHO, UNIT_ECHO, UNIT_LPWR];
const PTCB_UNITS: [u8; 3] = [UNIT_ECHO, UNIT_LPWR, UNIT_DEFER];
const PTCB_FUNCTIONS: u8 = 4;

/// Smallest element that fits a header plus a tagged body on both backends.
const MIN_ELEMENT_SIZE: u32 = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum Backend {
    Heap,
    Ptcb,
}

#[derive(Debug, Clone)]
pub struct Settings {
    pub backend: Backend,
    pub requests: usize,
    pub elements: u32,
    pub element_size: u32,
    pub seed: u64,
}

impl Settings {
    fn validate(&self) -> Result<(), SimError> {
        if !(2..=MAX_RING_ELEMENTS as u32).contains(&self.elements) {
            return Err(SimError::Config(format!(
                "elements must be 2..={MAX_RING_ELEMENTS}, got {}",
                self.elements
            )));
        }
        if self.element_size % DMA_ALIGNMENT as u32 != 0
            || !(MIN_ELEMENT_SIZE..=STAGING_CAPACITY as u32).contains(&self.element_size)
        {
            return Err(SimError::Config(format!(
                "element size must be a multiple of {DMA_ALIGNMENT} in {MIN_ELEMENT_SIZE}..={STAGING_CAPACITY}, got {}",
                self.element_size
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Summary {
    pub rounds: usize,
    pub sent: usize,
    pub completed: usize,
    /// Heap acknowledgements received and checked against the written-back entry.
    pub acks: usize,
    /// PTCB responses received and checked against their request.
    pub responses: usize,
    pub deferred_sweeps: usize,
    /// Requests still waiting for an answer when the run ended.
    pub outstanding: usize,
    pub pool_units_in_use: usize,
    pub rejected_tail_writes: u32,
    pub flushes: u64,
    pub crash_asserts: u32,
    pub crash_record: Vec<u8>,
}

pub fn run(settings: &Settings) -> Result<Summary, SimError> {
    settings.validate()?;
    let mut rng = StdRng::seed_from_u64(settings.seed);
    log::info!(
        "{:?} backend: {} requests, {} x {}-byte elements, seed {}",
        settings.backend,
        settings.requests,
        settings.elements,
        settings.element_size,
        settings.seed
    );
    match settings.backend {
        Backend::Heap => run_heap(settings, &mut rng),
        Backend::Ptcb => run_ptcb(settings, &mut rng),
    }
}

/// Let the producer send a burst of up to one ring's worth of requests.
fn produce<F>(summary: &mut Summary, settings: &Settings, rng: &mut StdRng, mut push: F) -> Result<(), SimError>
where
    F: FnMut(&mut StdRng) -> Result<bool, SimError>,
{
    let burst = rng.gen_range(1..settings.elements as usize);
    for _ in 0..burst {
        if summary.sent == settings.requests || !push(rng)? {
            break;
        }
        summary.sent += 1;
    }
    Ok(())
}

fn pick(units: &[u8], rng: &mut StdRng) -> u8 {
    units[rng.gen_range(0..units.len())]
}

fn run_heap(settings: &Settings, rng: &mut StdRng) -> Result<Summary, SimError> {
    let layout = Layout::new(HEAP_QUEUE_COUNT, settings.elements, settings.element_size);
    let pool_size = layout.pool_size();
    if pool_size as usize > POOL_CAPACITY {
        return Err(SimError::Config(format!(
            "heap backend needs a {pool_size}-byte pool, capacity is {POOL_CAPACITY}"
        )));
    }
    let config = HeapQueueConfig {
        cmd_queues: [layout.cmd[0], layout.cmd[1]],
        msg_queue: layout.msg,
        pool_size,
        low_power_unit: UNIT_LPWR,
    };

    let region = SharedRegion::new(layout.region_size());
    let regs = Registers::new();
    let crash = CrashBuffer::default();
    let queue = HeapQueue::new(config, region.clone(), regs.clone(), crash.clone())?;

    let mut producer = Producer::new(region.clone(), regs.clone(), layout.cmd.clone());
    let mut consumer = Consumer::new(region.clone(), regs.clone(), layout.msg);
    let mut handler: HandlerTask<PoolClaim> = HandlerTask::new(UNIT_LPWR);
    let mut summary = Summary::default();
    let max_body = settings.element_size as usize - EnvelopeHeader::SIZE - RpcHeader::SIZE;

    while summary.completed < settings.requests {
        summary.rounds += 1;
        produce(&mut summary, settings, rng, |rng| {
            let queue_id = rng.gen_range(0..HEAP_QUEUE_COUNT) as u8;
            let unit = pick(&HEAP_UNITS, rng);
            let len = rng.gen_range(TAG_SIZE..=max_body);
            producer.push_heap(queue_id, RpcHeader::new(unit, 0), len, rng)
        })?;

        for queue_id in 0..HEAP_QUEUE_COUNT as u8 {
            queue.process_command_queue(queue_id, &mut handler)?;
        }
        log::debug!(
            "round {}: {} dispatched so far, {} pending",
            summary.rounds,
            handler.dispatched(),
            handler.pending()
        );

        while let Some(record) = handler.take() {
            let mut claim = record.payload;
            let payload = queue.payload_mut(&mut claim)?;
            let size = RpcHeader::parse(payload)
                .map_or(RpcHeader::SIZE, |h| h.size as usize)
                .clamp(RpcHeader::SIZE, payload.len());
            transform(&mut payload[RpcHeader::SIZE..size]);

            queue.respond(claim).map_err(|e| e.error)?;
            summary.completed += 1;

            for (header, whole) in consumer.drain()? {
                if (header.unit_id, header.function) != (UNIT_CMDMGMT, CMDMGMT_FN_HEAP_ACK)
                    || whole.len() < RpcHeader::SIZE + HEAP_ACK_BODY_SIZE
                {
                    return Err(SimError::UnexpectedMessage {
                        unit_id: header.unit_id,
                        function: header.function,
                    });
                }
                let body = &whole[RpcHeader::SIZE..];
                producer.check_written_back(body[0], u16::from_le_bytes([body[2], body[3]]))?;
                summary.acks += 1;
            }
        }
    }

    summary.outstanding = producer.outstanding();
    summary.pool_units_in_use = queue.pool_usage().units_in_use();
    summary.rejected_tail_writes = regs.rejected_writes();
    summary.flushes = region.flushes();
    summary.crash_asserts = crash.asserts();
    summary.crash_record = crash.last();
    Ok(summary)
}

fn defer_sweep(header: &RpcHeader) -> bool {
    header.unit_id == UNIT_DEFER
}

/// Size-table entry for `function`: header plus 16..64 body bytes, capped by the element.
fn ptcb_size(function: u8, element_size: u32) -> u16 {
    (MIN_ELEMENT_SIZE + 16 * function as u32).min(element_size) as u16
}

#[repr(C, align(16))]
struct RpcBuffer([u8; STAGING_CAPACITY]);

fn run_ptcb(settings: &Settings, rng: &mut StdRng) -> Result<Summary, SimError> {
    let layout = Layout::new(1, settings.elements, settings.element_size);

    let mut sizes = RpcSizeTable::new();
    for unit in PTCB_UNITS {
        for function in 0..PTCB_FUNCTIONS {
            sizes
                .register(unit, function, ptcb_size(function, settings.element_size))
                .map_err(|e| e.widen::<RegionError>())?;
        }
    }
    let config = PtcbQueueConfig {
        queue_id: 0,
        cmd_queue: layout.cmd[0],
        msg_queue: layout.msg,
        low_power_unit: UNIT_LPWR,
        sweep_skip: defer_sweep,
    };

    let region = SharedRegion::new(layout.region_size());
    let regs = Registers::new();
    let crash = CrashBuffer::default();
    let queue = PtcbQueue::new(config, sizes, region.clone(), regs.clone(), crash.clone())?;

    let mut producer = Producer::new(region.clone(), regs.clone(), layout.cmd.clone());
    let mut consumer = Consumer::new(region.clone(), regs.clone(), layout.msg);
    let mut handler: HandlerTask<PtcbPayload> = HandlerTask::new(UNIT_LPWR);
    let mut summary = Summary::default();
    let mut buf = RpcBuffer([0; STAGING_CAPACITY]);
    let mut deferred = Vec::new();

    while summary.completed < settings.requests {
        summary.rounds += 1;
        produce(&mut summary, settings, rng, |rng| {
            let unit = pick(&PTCB_UNITS, rng);
            let function = rng.gen_range(0..PTCB_FUNCTIONS);
            let len = (queue.sizes().size_of(unit, function) as usize).saturating_sub(RpcHeader::SIZE);
            producer.push_ptcb(0, RpcHeader::new(unit, function), len, rng)
        })?;

        queue.process_command_queue(0, &mut handler)?;
        log::debug!(
            "round {}: {} dispatched so far, {} pending",
            summary.rounds,
            handler.dispatched(),
            handler.pending()
        );

        while let Some(record) = handler.take() {
            let p = record.payload;
            let header = queue.rpc_copy_in(&mut buf.0, p.element_index, p.element_size, p.sweep_skip)?;
            if p.sweep_skip {
                deferred.push(p.element_index);
            }
            transform(&mut buf.0[RpcHeader::SIZE..header.rpc_size as usize]);

            queue.respond(&header, &buf.0)?;
            summary.completed += 1;

            for (header, whole) in consumer.drain()? {
                if !header.is_response() {
                    return Err(SimError::UnexpectedMessage {
                        unit_id: header.unit_id,
                        function: header.function,
                    });
                }
                producer.check_response(&whole[RpcHeader::SIZE..])?;
                summary.responses += 1;
            }
        }

        // The skipped entries are swept once their handlers are all done.
        for position in deferred.drain(..) {
            queue.sweep(position)?;
            summary.deferred_sweeps += 1;
        }
    }

    summary.outstanding = producer.outstanding();
    summary.rejected_tail_writes = regs.rejected_writes();
    summary.flushes = region.flushes();
    summary.crash_asserts = crash.asserts();
    summary.crash_record = crash.last();
    Ok(summary)
}
