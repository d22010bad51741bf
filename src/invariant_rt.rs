//! RT-safe invariant signaling for real-time paths.
//!
//! This module provides a two-tier invariant system:
//! - **Tier 1 (RT-safe)**: Lock-free signaling of invariant IDs from the RT
//!   thread (registry swaps, unit construction, block processing)
//! - **Tier 2 (Non-RT)**: Logging, verification and contract testing on the
//!   NRT side
//!
//! # Design Philosophy
//!
//! RT code **signals facts**. Non-RT code **judges correctness** and does
//! the talking.
//!
//! The RT side never formats a message, never logs and never blocks. A unit
//! that fails to bind pushes one byte; whoever drains the queue turns it into
//! a log line.
//!
//! # Example
//!
//! ```ignore
//! // RT thread
//! signal_invariant(&mut signal_tx, INV_UNIT_UNKNOWN_PROGRAM);
//!
//! // NRT thread
//! let signals = drain_invariant_signals(&mut signal_rx);
//! log_signals(&signals);
//! ```

use rtrb::{Consumer, Producer, RingBuffer};
use tracing::{debug, error, trace, warn};

// ============================================================================
// RT-Safe Invariant IDs (Tier 1)
// ============================================================================

/// Stage 2 published a program into the registry.
pub const INV_PROGRAM_PUBLISHED: u8 = 1;

/// Stage 2 found no free registry slot.
pub const INV_PUBLISH_FAILED: u8 = 2;

/// Stage 2 had nothing to publish because stage 1 failed.
pub const INV_SWAP_SKIPPED: u8 = 3;

/// A unit acquired a registry entry.
pub const INV_ENTRY_ACQUIRED: u8 = 4;

/// A unit released a registry entry that stays alive.
pub const INV_ENTRY_RELEASED: u8 = 5;

/// A registry entry was deleted and its program retired.
pub const INV_ENTRY_DELETED: u8 = 6;

/// A delete request hit a referenced entry and was deferred.
pub const INV_DELETE_DEFERRED: u8 = 7;

/// A unit bound to its program and is ready.
pub const INV_UNIT_BOUND: u8 = 8;

/// A unit referenced a key with no published program.
pub const INV_UNIT_UNKNOWN_PROGRAM: u8 = 9;

/// A unit asked for a different output count than the program has.
pub const INV_UNIT_CHANNEL_MISMATCH: u8 = 10;

/// A unit supplied fewer audio inputs than the program reads.
pub const INV_UNIT_INPUT_MISMATCH: u8 = 11;

/// A unit found no spare slot in its program.
pub const INV_UNIT_OUT_OF_MEMORY: u8 = 12;

/// A unit's factory could not create an instance.
pub const INV_UNIT_NO_INSTANCE: u8 = 13;

/// A block was rendered by a program instance.
pub const INV_BLOCK_COMPUTED: u8 = 14;

/// A block was written as silence by an inert unit.
pub const INV_BLOCK_SILENCED: u8 = 15;

/// Stage 4 finished a job.
pub const INV_JOB_FINISHED: u8 = 16;

/// A block panicked and was silenced.
pub const INV_BLOCK_PANICKED: u8 = 19;

/// A stage handoff queue was full; the job is parked for the next poll.
pub const INV_STAGE_QUEUE_FULL: u8 = 20;

// ============================================================================
// Invariant Signal Queue
// ============================================================================

/// Capacity for invariant signal queue.
/// Should be large enough to hold signals from multiple blocks between
/// NRT drains.
pub const INVARIANT_QUEUE_CAPACITY: usize = 256;

/// Creates a new invariant signal queue pair.
///
/// Returns (producer for RT, consumer for NRT).
pub fn new_invariant_queue() -> (Producer<u8>, Consumer<u8>) {
    RingBuffer::new(INVARIANT_QUEUE_CAPACITY)
}

/// Signals a fact from the RT path.
///
/// # RT Safety
/// - No allocation
/// - No locking
/// - No panics
/// - If queue is full, signal is dropped (preferable to blocking)
#[inline]
pub fn signal_invariant(tx: &mut Producer<u8>, id: u8) {
    let _ = tx.push(id);
}

// ============================================================================
// Non-RT Verification (Tier 2)
// ============================================================================

/// Drains all pending invariant signals from the queue.
pub fn drain_invariant_signals(rx: &mut Consumer<u8>) -> Vec<u8> {
    let mut signals = Vec::with_capacity(rx.slots());
    while let Ok(id) = rx.pop() {
        signals.push(id);
    }
    signals
}

/// Counts occurrences of each invariant ID in a signal list.
pub fn count_invariant_signals(signals: &[u8]) -> [usize; 256] {
    let mut counts = [0usize; 256];
    for &id in signals {
        counts[id as usize] += 1;
    }
    counts
}

/// Turns drained signals into log events.
pub fn log_signals(signals: &[u8]) {
    for &id in signals {
        let name = invariant_name(id);
        match id {
            INV_PUBLISH_FAILED | INV_UNIT_OUT_OF_MEMORY | INV_UNIT_NO_INSTANCE
            | INV_BLOCK_PANICKED => error!(signal = name, "rt failure"),
            INV_UNIT_UNKNOWN_PROGRAM | INV_UNIT_CHANNEL_MISMATCH | INV_UNIT_INPUT_MISMATCH => {
                error!(signal = name, "unit is inert")
            }
            INV_SWAP_SKIPPED | INV_STAGE_QUEUE_FULL => {
                warn!(signal = name, "rt notice")
            }
            INV_BLOCK_COMPUTED | INV_BLOCK_SILENCED => trace!(signal = name, "block"),
            _ => debug!(signal = name, "rt event"),
        }
    }
}

/// Contract verification: asserts that required invariants were signaled.
///
/// # Panics
/// Panics if any required invariant was not signaled at least once.
#[cfg(any(test, feature = "ppt"))]
pub fn contract_test_rt(contract_name: &str, signals: &[u8], required: &[u8]) {
    let counts = count_invariant_signals(signals);
    let mut missing = Vec::new();

    for &id in required {
        if counts[id as usize] == 0 {
            missing.push(invariant_name(id));
        }
    }

    if !missing.is_empty() {
        let present: Vec<&str> = signals
            .iter()
            .map(|&id| invariant_name(id))
            .collect::<std::collections::BTreeSet<_>>()
            .into_iter()
            .collect();

        panic!(
            "RT Contract '{}' missing invariants: {:?}. Present: {:?}",
            contract_name, missing, present
        );
    }
}

/// Maps invariant ID to human-readable name (for diagnostics only).
pub const fn invariant_name(id: u8) -> &'static str {
    match id {
        INV_PROGRAM_PUBLISHED => "PROGRAM_PUBLISHED",
        INV_PUBLISH_FAILED => "PUBLISH_FAILED",
        INV_SWAP_SKIPPED => "SWAP_SKIPPED",
        INV_ENTRY_ACQUIRED => "ENTRY_ACQUIRED",
        INV_ENTRY_RELEASED => "ENTRY_RELEASED",
        INV_ENTRY_DELETED => "ENTRY_DELETED",
        INV_DELETE_DEFERRED => "DELETE_DEFERRED",
        INV_UNIT_BOUND => "UNIT_BOUND",
        INV_UNIT_UNKNOWN_PROGRAM => "UNIT_UNKNOWN_PROGRAM",
        INV_UNIT_CHANNEL_MISMATCH => "UNIT_CHANNEL_MISMATCH",
        INV_UNIT_INPUT_MISMATCH => "UNIT_INPUT_MISMATCH",
        INV_UNIT_OUT_OF_MEMORY => "UNIT_OUT_OF_MEMORY",
        INV_UNIT_NO_INSTANCE => "UNIT_NO_INSTANCE",
        INV_BLOCK_COMPUTED => "BLOCK_COMPUTED",
        INV_BLOCK_SILENCED => "BLOCK_SILENCED",
        INV_JOB_FINISHED => "JOB_FINISHED",
        INV_BLOCK_PANICKED => "BLOCK_PANICKED",
        INV_STAGE_QUEUE_FULL => "STAGE_QUEUE_FULL",
        _ => "UNKNOWN",
    }
}

// ============================================================================
// Tests
// ============================================================================
