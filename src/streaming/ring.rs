//! Per-session transmit rings and the enqueue/scheduler hand-off.
//!
//! Each session owns one single-producer single-consumer ring: the
//! enqueue thread pushes packets in sequence-number order, the scheduler
//! thread drains them in order. The shared "extra" ring carries
//! non-media traffic (PTP delay requests, control frames) and is the
//! only multi-producer ring in the device.

use ringbuf::traits::{Consumer, Observer, Producer, Split};
use ringbuf::{HeapCons, HeapProd, HeapRb};

use crate::streaming::nic::TxPacket;
use crate::streaming::sync::{SpinBarrier, SyncFlag};
use std::sync::Mutex;

/// Capacity of one session ring.
pub const SESSION_RING_SIZE: usize = 1 << 10;
/// Capacity of the shared extra ring.
pub const SHARED_RING_SIZE: usize = 1 << 12;

/// Producer half of a session ring (enqueue thread).
pub struct TxRingProd(HeapProd<TxPacket>);

/// Consumer half of a session ring (scheduler thread).
pub struct TxRingCons(HeapCons<TxPacket>);

/// Create one session ring.
pub fn tx_ring(capacity: usize) -> (TxRingProd, TxRingCons) {
    let (prod, cons) = HeapRb::new(capacity).split();
    (TxRingProd(prod), TxRingCons(cons))
}

impl TxRingProd {
    /// Push one packet; gives it back when the ring is full.
    pub fn push(&mut self, pkt: TxPacket) -> Result<(), TxPacket> {
        self.0.try_push(pkt)
    }

    pub fn free_len(&self) -> usize {
        self.0.vacant_len()
    }
}

impl TxRingCons {
    pub fn pop(&mut self) -> Option<TxPacket> {
        self.0.try_pop()
    }

    /// Bulk path: dequeue exactly four packets or none at all.
    pub fn pop_bulk4(&mut self) -> Option<[TxPacket; 4]> {
        if self.0.occupied_len() < 4 {
            return None;
        }
        Some([
            self.0.try_pop().unwrap(),
            self.0.try_pop().unwrap(),
            self.0.try_pop().unwrap(),
            self.0.try_pop().unwrap(),
        ])
    }

    pub fn len(&self) -> usize {
        self.0.occupied_len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// The shared extra ring: multiple producers behind a mutex (it is far
/// off the media hot path), single consumer in scheduler thread 0.
pub struct SharedRing {
    prod: Mutex<HeapProd<TxPacket>>,
    cons: Mutex<HeapCons<TxPacket>>,
}

impl SharedRing {
    pub fn new(capacity: usize) -> SharedRing {
        let (prod, cons) = HeapRb::new(capacity).split();
        SharedRing {
            prod: Mutex::new(prod),
            cons: Mutex::new(cons),
        }
    }

    pub fn push(&self, pkt: TxPacket) -> Result<(), TxPacket> {
        self.prod.lock().unwrap().try_push(pkt)
    }

    pub fn pop(&self) -> Option<TxPacket> {
        self.cons.lock().unwrap().try_pop()
    }
}

/// Synchronisation between the enqueue threads and the scheduler
/// threads: schedulers signal readiness on `ring_start` once; enqueue
/// threads rendezvous on the two barriers each batch and hand the batch
/// over via `sched_start`, which scheduler thread 0 clears at the end
/// of every period.
pub struct SchedSync {
    pub ring_start: SyncFlag,
    pub sched_start: SyncFlag,
    pub barrier1: SpinBarrier,
    pub barrier2: SpinBarrier,
}

impl SchedSync {
    pub fn new(enq_threads: u32) -> SchedSync {
        SchedSync {
            ring_start: SyncFlag::new(),
            sched_start: SyncFlag::new(),
            barrier1: SpinBarrier::new(enq_threads),
            barrier2: SpinBarrier::new(enq_threads),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
