//! PTCB backend: header-only routing, handler-driven copy-in, deferred sweeps
//! and size-table driven responses.

mod common;

use common::*;
use fbq_core::config::{never_skip, PtcbQueueConfig, RingGeometry};
use fbq_core::wire::{self, RpcHeader, FLAG_RESPONSE};
use fbq_core::{
    DispatchRecord, DispatchStatus, Dispatcher, Error, EventType, Fault, PtcbPayload, PtcbQueue, RpcSizeTable,
};
use fbq_hal::QueueRegisters;

type TestPtcb = PtcbQueue<MockMemory, MockRegisters, MockCrashLog>;

const CMD: RingGeometry = RingGeometry::new(0x000, 4, 64);
const MSG: RingGeometry = RingGeometry::new(0x200, 4, 64);
const DEFER_UNIT: u8 = 0x30;

fn defer_unit(header: &RpcHeader) -> bool {
    header.unit_id == DEFER_UNIT
}

fn config() -> PtcbQueueConfig {
    PtcbQueueConfig {
        queue_id: 0,
        cmd_queue: CMD,
        msg_queue: MSG,
        low_power_unit: LPWR_UNIT,
        sweep_skip: never_skip,
    }
}

fn sizes() -> RpcSizeTable {
    let mut sizes = RpcSizeTable::new();
    sizes.register(UNIT_A, 1, 24).unwrap();
    sizes.register(UNIT_B, 2, 40).unwrap();
    sizes.register(LPWR_UNIT, 1, 16).unwrap();
    sizes.register(DEFER_UNIT, 1, 16).unwrap();
    sizes
}

struct Fixture {
    mem: MockMemory,
    regs: MockRegisters,
    crash_log: MockCrashLog,
    queue: TestPtcb,
}

fn setup_with(config: PtcbQueueConfig, sizes: RpcSizeTable) -> Fixture {
    let mem = MockMemory::new(0x400);
    let regs = MockRegisters::new();
    let crash_log = MockCrashLog::default();
    let queue = PtcbQueue::new(config, sizes, mem.clone(), regs.clone(), crash_log.clone())
        .unwrap_or_else(|e| panic!("queue setup failed: {e}"));
    Fixture {
        mem,
        regs,
        crash_log,
        queue,
    }
}

fn setup() -> Fixture {
    setup_with(config(), sizes())
}

impl Fixture {
    fn push(&self, unit_id: u8, function: u8, body: &[u8]) -> u32 {
        push_ptcb_command(&self.mem, &self.regs, &CMD, 0, RpcHeader::new(unit_id, function), body)
    }

    fn drain(&self) -> Vec<DispatchRecord<PtcbPayload>> {
        let mut dispatcher = RecordingDispatcher::new();
        self.queue
            .process_command_queue(0, &mut dispatcher)
            .unwrap_or_else(|e| panic!("drain failed: {e}"));
        dispatcher.records
    }
}

// ---------------------------------------------------------------------------
// Size table
// ---------------------------------------------------------------------------

#[test]
fn size_table_lookup() {
    let table = sizes();
    assert_eq!(table.lookup(UNIT_B, 2), Ok(40));
    assert_eq!(table.size_of(UNIT_A, 1), 24);
    assert_eq!(
        table.lookup(UNIT_A, 9),
        Err(Fault::UnsupportedRpc {
            unit_id: UNIT_A,
            function: 9
        })
    );
    assert_eq!(table.size_of(UNIT_A, 9), 0);
}

#[test]
fn size_table_register_replaces_existing_pair() {
    let mut table = sizes();
    table.register(UNIT_A, 1, 48).unwrap();
    assert_eq!(table.lookup(UNIT_A, 1), Ok(48));
}

#[test]
fn size_table_rejects_size_below_header() {
    let mut table = RpcSizeTable::new();
    assert_eq!(table.register(UNIT_A, 1, 15), Err(Error::InvalidArgument));
}

#[test]
fn size_table_capacity_is_bounded() {
    let mut table = RpcSizeTable::new();
    for function in 0..64u8 {
        table.register(UNIT_A, function, 16).unwrap();
    }
    assert_eq!(table.register(UNIT_B, 0, 16), Err(Error::InvalidArgument));
    // Replacing still works when full.
    table.register(UNIT_A, 0, 32).unwrap();
}

#[test]
fn disabled_unit_reports_zero_size() {
    let mut table = sizes();
    table.disable_unit(UNIT_B);
    assert_eq!(table.size_of(UNIT_B, 2), 0);
    assert!(table.lookup(UNIT_B, 2).is_err());

    table.enable_unit(UNIT_B);
    assert_eq!(table.size_of(UNIT_B, 2), 40);
}

// ---------------------------------------------------------------------------
// Consume loop
// ---------------------------------------------------------------------------

#[test]
fn routes_headers_without_touching_the_tail() {
    let f = setup();
    f.push(UNIT_A, 1, &[0; 8]);
    f.push(UNIT_B, 2, &[0; 24]);

    let records = f.drain();
    assert_eq!(records.len(), 2);
    assert_eq!(records[0].event, EventType::PtcbCommand);
    assert_eq!((records[0].unit_id, records[0].function), (UNIT_A, 1));
    assert_eq!(
        records[0].payload,
        PtcbPayload {
            element_index: 0,
            element_size: 24,
            sweep_skip: false
        }
    );
    assert_eq!(records[1].payload.element_index, 1);
    assert_eq!(records[1].payload.element_size, 40);

    assert_eq!(f.queue.current(), 2);
    assert_eq!(f.regs.cmd_tail(0), 0);
    assert!(f.regs.tail_writes().is_empty());
}

#[test]
fn queue_id_mismatch_is_invalid_state() {
    let f = setup();
    let mut dispatcher = RecordingDispatcher::new();
    assert_eq!(
        f.queue.process_command_queue(1, &mut dispatcher),
        Err(Error::InvalidState)
    );
}

#[test]
fn disabled_unit_aborts_the_loop() {
    let mut table = sizes();
    table.disable_unit(UNIT_B);
    let f = setup_with(config(), table);
    f.push(UNIT_A, 1, &[0; 8]);
    f.push(UNIT_B, 2, &[0; 24]);
    f.push(UNIT_A, 1, &[0; 8]);

    let mut dispatcher = RecordingDispatcher::new();
    let err = f.queue.process_command_queue(0, &mut dispatcher).unwrap_err();

    assert_eq!(
        err,
        Error::Fatal(Fault::UnsupportedRpc {
            unit_id: UNIT_B,
            function: 2
        })
    );
    assert_eq!(dispatcher.records.len(), 1);
    assert_eq!(f.queue.current(), 1);
    assert_eq!(f.queue.sizes().size_of(UNIT_B, 2), 0);

    assert_eq!(f.crash_log.asserts(), 1);
    let record = f.crash_log.buffer();
    assert_eq!((record[0], record[1], record[2]), (5, UNIT_B, 2));
}

#[test]
fn low_power_unit_keeps_transport_lock_during_dispatch() {
    struct LockProbe<'a> {
        queue: &'a TestPtcb,
        seen: Vec<(u8, bool)>,
    }

    impl Dispatcher<PtcbPayload> for LockProbe<'_> {
        fn dispatch(&mut self, record: DispatchRecord<PtcbPayload>) -> Result<(), DispatchStatus> {
            self.seen.push((record.unit_id, self.queue.is_transport_busy()));
            Ok(())
        }
    }

    let f = setup();
    f.push(LPWR_UNIT, 1, &[]);
    f.push(UNIT_A, 1, &[0; 8]);

    let mut probe = LockProbe {
        queue: &f.queue,
        seen: Vec::new(),
    };
    f.queue.process_command_queue(0, &mut probe).unwrap();

    assert_eq!(probe.seen, vec![(LPWR_UNIT, true), (UNIT_A, false)]);
    assert!(!f.queue.is_transport_busy());
}

#[test]
fn dispatch_rejection_stops_the_loop() {
    let f = setup();
    f.push(UNIT_B, 2, &[0; 24]);
    f.push(UNIT_A, 1, &[0; 8]);

    let mut dispatcher = RecordingDispatcher::new();
    dispatcher.reject_unit = Some(UNIT_B);
    let err = f.queue.process_command_queue(0, &mut dispatcher).unwrap_err();
    assert_eq!(err, Error::Dispatch(DispatchStatus(0x7F)));
    assert!(err.is_fatal());
    assert_eq!(f.crash_log.asserts(), 1);
    assert_eq!(&f.crash_log.buffer()[..2], &[6, 0x7F]);
    assert!(dispatcher.records.is_empty());
    assert_eq!(f.queue.current(), 1);
}

// ---------------------------------------------------------------------------
// Handler copy-in and sweep
// ---------------------------------------------------------------------------

#[test]
fn rpc_copy_in_reads_and_sweeps() {
    let f = setup();
    let body = [9, 8, 7, 6, 5, 4, 3, 2];
    f.push(UNIT_A, 1, &body);
    let payload = f.drain().remove(0).payload;

    let mut buf = AlignedBuf::new();
    let header = f
        .queue
        .rpc_copy_in(&mut buf.0, payload.element_index, payload.element_size, payload.sweep_skip)
        .unwrap();

    assert_eq!(header.unit_id, UNIT_A);
    assert_eq!(header.rpc_size, 24);
    assert_eq!(&buf.0[16..24], &body);

    assert_eq!(f.regs.cmd_tail(0), 1);
    assert_eq!(f.regs.tail_writes(), vec![(0, 1, ELEVATED_LEVEL)]);
    assert_eq!(f.regs.privilege(), USER_LEVEL);
}

#[test]
fn rpc_copy_in_rejects_misaligned_buffer() {
    let f = setup();
    f.push(UNIT_A, 1, &[0; 8]);
    let mut buf = AlignedBuf::new();
    assert_eq!(
        f.queue.rpc_copy_in(&mut buf.0[1..], 0, 24, false),
        Err(Error::InvalidArgument)
    );
    assert_eq!(f.regs.cmd_tail(0), 0);
}

#[test]
fn rpc_copy_in_needs_room_for_the_rounded_read() {
    let f = setup();
    f.push(UNIT_A, 1, &[0; 8]);
    let mut buf = AlignedBuf::new();
    // 24 bytes round up to a 32-byte read.
    assert_eq!(
        f.queue.rpc_copy_in(&mut buf.0[..24], 0, 24, false),
        Err(Error::InvalidArgument)
    );
    assert!(f.queue.rpc_copy_in(&mut buf.0[..32], 0, 24, false).is_ok());
}

#[test]
fn rpc_copy_in_bounds_checks() {
    let f = setup();
    let mut buf = AlignedBuf::new();
    // Past the ring element.
    assert_eq!(f.queue.rpc_copy_in(&mut buf.0, 0, 80, false), Err(Error::InvalidArgument));
    // Shorter than a header.
    assert_eq!(f.queue.rpc_copy_in(&mut buf.0, 0, 8, false), Err(Error::InvalidArgument));
    // Outside the ring.
    assert_eq!(f.queue.rpc_copy_in(&mut buf.0, 4, 24, false), Err(Error::InvalidArgument));
}

#[test]
fn deferred_sweep_is_taken_over_by_later_consumer() {
    let mut cfg = config();
    cfg.sweep_skip = defer_unit;
    let f = setup_with(cfg, sizes());
    f.push(DEFER_UNIT, 1, &[]);
    f.push(UNIT_A, 1, &[0; 8]);

    let records = f.drain();
    assert!(records[0].payload.sweep_skip);
    assert!(!records[1].payload.sweep_skip);

    let mut buf = AlignedBuf::new();
    for r in &records {
        let p = r.payload;
        f.queue
            .rpc_copy_in(&mut buf.0, p.element_index, p.element_size, p.sweep_skip)
            .unwrap();
    }
    // Slot 1 is done but slot 0 still holds the tail.
    assert_eq!(f.regs.cmd_tail(0), 0);
    assert!(f.queue.sweep_mask().unwrap().is_complete(1));

    assert_eq!(f.queue.sweep(0), Ok(2));
    assert!(f.queue.sweep_mask().unwrap().is_clear());
}

#[test]
fn sweeping_twice_traps() {
    let f = setup();
    f.push(UNIT_A, 1, &[0; 8]);
    f.push(UNIT_A, 1, &[0; 8]);
    let mut buf = AlignedBuf::new();
    // Slot 1 finishes first, so its mark waits for slot 0.
    f.queue.rpc_copy_in(&mut buf.0, 1, 24, false).unwrap();
    assert_eq!(f.regs.cmd_tail(0), 0);

    assert_eq!(
        f.queue.sweep(1),
        Err(Error::Fatal(Fault::AlreadySwept { queue_id: 0, index: 1 }))
    );
    assert_eq!(f.crash_log.asserts(), 1);
    assert_eq!(f.crash_log.buffer()[0], 3);
}

#[test]
fn sweep_with_head_outside_ring_traps() {
    let f = setup();
    f.regs.set_cmd_head(0, 9);
    assert!(matches!(
        f.queue.sweep(0),
        Err(Error::Fatal(Fault::RingPointerOutOfRange { head: 9, .. }))
    ));
    assert_eq!(f.crash_log.asserts(), 1);
}

// ---------------------------------------------------------------------------
// Outbound messages
// ---------------------------------------------------------------------------

#[test]
fn response_is_sized_from_the_request() {
    let f = setup();
    f.push(UNIT_B, 2, &[0; 24]);
    let payload = f.drain().remove(0).payload;

    let mut buf = AlignedBuf::new();
    let header = f
        .queue
        .rpc_copy_in(&mut buf.0, payload.element_index, payload.element_size, false)
        .unwrap();
    buf.0[16..40].fill(0x5A);

    // The buffer is larger than the RPC; only `rpc_size` bytes go out.
    assert_eq!(f.queue.respond(&header, &buf.0), Ok(1));

    let (posted, whole) = read_message(&f.mem, &MSG, 0);
    assert_eq!(posted.size, 40);
    assert_eq!(posted.flags & FLAG_RESPONSE, FLAG_RESPONSE);
    assert_eq!((posted.unit_id, posted.function), (UNIT_B, 2));
    assert!(wire::verify(&whole));
    assert!(whole[16..40].iter().all(|&b| b == 0x5A));
}

#[test]
fn request_uses_caller_size() {
    let f = setup();
    let header = RpcHeader::new(UNIT_A, 9);
    assert_eq!(f.queue.post_message(&header, &[1, 2, 3, 4], 20), Ok(1));

    let (posted, whole) = read_message(&f.mem, &MSG, 0);
    assert_eq!(posted.size, 20);
    assert!(!posted.is_response());
    assert_eq!(&whole[16..20], &[1, 2, 3, 4]);
}

#[test]
fn sequence_numbers_increase_per_post() {
    let f = setup();
    let header = RpcHeader::new(UNIT_A, 9);
    for _ in 0..3 {
        f.queue.post_message(&header, &[], 16).unwrap();
    }
    let seqs: Vec<u32> = (0..3).map(|slot| read_message(&f.mem, &MSG, slot).0.sequence_number).collect();
    assert_eq!(seqs, vec![0, 1, 2]);
}
