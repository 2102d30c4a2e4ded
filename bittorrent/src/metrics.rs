// Global, monotonic, per-reason counters for parse/framing-level errors. Diagnostics
// affordance only: the engine never branches on these, an operator-facing collector
// reads and resets them. Per-task state belongs in `stats.rs`, not here.

use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct ErrorCounters {
    pub stream_error: AtomicU64,
    pub buffer_overflow: AtomicU64,
    pub bad_handshake: AtomicU64,
    pub protocol_error: AtomicU64,
    pub hash_mismatch: AtomicU64,
    pub timeout: AtomicU64,
}

impl ErrorCounters {
    pub const fn new() -> Self {
        Self {
            stream_error: AtomicU64::new(0),
            buffer_overflow: AtomicU64::new(0),
            bad_handshake: AtomicU64::new(0),
            protocol_error: AtomicU64::new(0),
            hash_mismatch: AtomicU64::new(0),
            timeout: AtomicU64::new(0),
        }
    }

    pub fn snapshot(&self) -> ErrorCountersSnapshot {
        ErrorCountersSnapshot {
            stream_error: self.stream_error.load(Ordering::Relaxed),
            buffer_overflow: self.buffer_overflow.load(Ordering::Relaxed),
            bad_handshake: self.bad_handshake.load(Ordering::Relaxed),
            protocol_error: self.protocol_error.load(Ordering::Relaxed),
            hash_mismatch: self.hash_mismatch.load(Ordering::Relaxed),
            timeout: self.timeout.load(Ordering::Relaxed),
        }
    }

    // Reset-by-operator: not called by the engine itself.
    pub fn reset(&self) {
        self.stream_error.store(0, Ordering::Relaxed);
        self.buffer_overflow.store(0, Ordering::Relaxed);
        self.bad_handshake.store(0, Ordering::Relaxed);
        self.protocol_error.store(0, Ordering::Relaxed);
        self.hash_mismatch.store(0, Ordering::Relaxed);
        self.timeout.store(0, Ordering::Relaxed);
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ErrorCountersSnapshot {
    pub stream_error: u64,
    pub buffer_overflow: u64,
    pub bad_handshake: u64,
    pub protocol_error: u64,
    pub hash_mismatch: u64,
    pub timeout: u64,
}

pub static ERRORS: ErrorCounters = ErrorCounters::new();

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::Ordering;

    #[test]
    fn snapshot_reflects_increments() {
        let c = ErrorCounters::new();
        c.bad_handshake.fetch_add(3, Ordering::Relaxed);
        assert_eq!(c.snapshot().bad_handshake, 3);
        c.reset();
        assert_eq!(c.snapshot().bad_handshake, 0);
    }
}
