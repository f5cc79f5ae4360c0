//! Bounded exception log.
//!
//! A lock-free ring so the dispatcher can append while the kernel state lock
//! is held, including from a nested trap. When full, the oldest record is
//! dropped.

use alloc::vec::Vec;
use crossbeam_queue::ArrayQueue;

/// One logged exception.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExceptionRecord {
    /// Exception vector.
    pub vector: u8,
    /// CPU error code.
    pub error_code: u64,
    /// CR2 for page faults, otherwise 0.
    pub fault_addr: u64,
    /// Instruction pointer at the time of the exception.
    pub rip: u64,
    /// Timer tick when it happened.
    pub tick: u64,
    /// Set for protection violations.
    pub security: bool,
}

/// Ring buffer of [`ExceptionRecord`]s.
pub struct ExceptionLog {
    records: ArrayQueue<ExceptionRecord>,
}

impl ExceptionLog {
    /// Creates a log holding up to `capacity` records (at least one).
    pub fn new(capacity: usize) -> Self {
        Self {
            records: ArrayQueue::new(capacity.max(1)),
        }
    }

    /// Appends a record, evicting the oldest one when full.
    pub fn record(&self, record: ExceptionRecord) {
        let _ = self.records.force_push(record);
    }

    /// Removes and returns every record, oldest first.
    pub fn drain(&self) -> Vec<ExceptionRecord> {
        core::iter::from_fn(|| self.records.pop()).collect()
    }

    /// Number of records held.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Returns true if no records are held.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Maximum number of records kept.
    pub fn capacity(&self) -> usize {
        self.records.capacity()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rec(vector: u8) -> ExceptionRecord {
        ExceptionRecord {
            vector,
            error_code: 0,
            fault_addr: 0,
            rip: 0,
            tick: 0,
            security: false,
        }
    }

    #[test]
    fn oldest_records_are_overwritten() {
        let log = ExceptionLog::new(3);
        for v in 0..5 {
            log.record(rec(v));
        }
        assert_eq!(log.len(), 3);
        let vectors: Vec<u8> = log.drain().iter().map(|r| r.vector).collect();
        assert_eq!(vectors, [2, 3, 4]);
        assert!(log.is_empty());
    }

    #[test]
    fn zero_capacity_still_keeps_the_latest() {
        let log = ExceptionLog::new(0);
        log.record(rec(1));
        log.record(rec(2));
        assert_eq!(log.capacity(), 1);
        assert_eq!(log.drain(), [rec(2)]);
    }
}
