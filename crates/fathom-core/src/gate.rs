//! Read/write concurrency gate
//!
//! Bounded counting semaphores per index, one for reads and one for writes.
//! Every operation above this layer acquires a permit through the gate and
//! releases it on every exit path via RAII.
//!
//! Defaults are unbounded reads and a single writer: the underlying writer
//! is not safely shareable across concurrent mutation sequences because
//! commit and merge-policy changes must be serialized, even though the
//! engine itself is thread-safe for individual calls.
//!
//! Read permits and write permits are acquired independently and never
//! nested, so the gate cannot deadlock.

use crate::{Error, Result};
use dashmap::DashMap;
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::time::{Duration, Instant};
use uuid::Uuid;

/// Permit limits for one index
#[derive(Debug, Clone, Copy)]
pub struct GateLimits {
    /// Maximum concurrent read permits; `None` means unbounded
    pub max_reads: Option<u32>,
    /// Maximum concurrent write permits
    pub max_writes: u32,
}

impl Default for GateLimits {
    fn default() -> Self {
        Self {
            max_reads: None,
            max_writes: 1,
        }
    }
}

/// Bounded counting semaphore
#[derive(Debug)]
struct Counter {
    capacity: u32,
    in_use: Mutex<u32>,
    released: Condvar,
}

impl Counter {
    fn new(capacity: u32) -> Self {
        Self {
            capacity,
            in_use: Mutex::new(0),
            released: Condvar::new(),
        }
    }

    /// Acquire one slot; `None` blocks until available, `Some(timeout)`
    /// bounds the wait. Returns false on timeout.
    fn acquire(&self, timeout: Option<Duration>) -> bool {
        let mut in_use = self.in_use.lock();
        match timeout {
            None => {
                while *in_use >= self.capacity {
                    self.released.wait(&mut in_use);
                }
            }
            Some(timeout) => {
                let deadline = Instant::now() + timeout;
                while *in_use >= self.capacity {
                    if Instant::now() >= deadline {
                        return false;
                    }
                    if self.released.wait_until(&mut in_use, deadline).timed_out()
                        && *in_use >= self.capacity
                    {
                        return false;
                    }
                }
            }
        }
        *in_use += 1;
        true
    }

    fn release(&self) {
        let mut in_use = self.in_use.lock();
        *in_use = in_use.saturating_sub(1);
        self.released.notify_one();
    }

    fn in_use(&self) -> u32 {
        *self.in_use.lock()
    }
}

#[derive(Debug)]
struct GateState {
    reads: Option<Counter>,
    writes: Counter,
}

/// Kind of permit held
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PermitKind {
    Read,
    Write,
}

/// RAII permit; releasing happens exactly once, on drop
#[derive(Debug)]
pub struct Permit {
    state: Arc<GateState>,
    kind: PermitKind,
}

impl Drop for Permit {
    fn drop(&mut self) {
        match self.kind {
            PermitKind::Read => {
                if let Some(reads) = &self.state.reads {
                    reads.release();
                }
            }
            PermitKind::Write => self.state.writes.release(),
        }
    }
}

/// Per-index read/write permit registry
#[derive(Debug, Default)]
pub struct ReadWriteGate {
    gates: DashMap<Uuid, Arc<GateState>>,
}

impl ReadWriteGate {
    /// Empty gate
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an index with its limits; replaces any previous entry
    pub fn register(&self, index: Uuid, limits: GateLimits) {
        let state = GateState {
            reads: limits.max_reads.map(Counter::new),
            writes: Counter::new(limits.max_writes.max(1)),
        };
        self.gates.insert(index, Arc::new(state));
    }

    /// Remove an index; outstanding permits stay valid until dropped
    pub fn unregister(&self, index: Uuid) {
        self.gates.remove(&index);
    }

    fn state(&self, index: Uuid) -> Result<Arc<GateState>> {
        self.gates
            .get(&index)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| Error::not_found(format!("no gate registered for index {index}")))
    }

    /// Acquire a read permit; blocks only when reads are bounded and
    /// exhausted
    pub fn acquire_read(&self, index: Uuid) -> Result<Permit> {
        let state = self.state(index)?;
        if let Some(reads) = &state.reads {
            reads.acquire(None);
        }
        Ok(Permit {
            state,
            kind: PermitKind::Read,
        })
    }

    /// Acquire a write permit with a bounded wait.
    ///
    /// A zero timeout returns [`Error::ConcurrencyUnavailable`] immediately
    /// when the writer slot is taken.
    pub fn acquire_write(&self, index: Uuid, timeout: Duration) -> Result<Permit> {
        let state = self.state(index)?;
        if !state.writes.acquire(Some(timeout)) {
            return Err(Error::unavailable(format!(
                "write permit for index {index} not available within {timeout:?}"
            )));
        }
        Ok(Permit {
            state,
            kind: PermitKind::Write,
        })
    }

    /// Current write permits in use, for status reporting
    pub fn writes_in_use(&self, index: Uuid) -> u32 {
        self.gates
            .get(&index)
            .map(|entry| entry.writes.in_use())
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn gate_with(limits: GateLimits) -> (ReadWriteGate, Uuid) {
        let gate = ReadWriteGate::new();
        let index = Uuid::new_v4();
        gate.register(index, limits);
        (gate, index)
    }

    #[test]
    fn test_zero_timeout_fails_immediately() {
        let (gate, index) = gate_with(GateLimits::default());
        let _held = gate.acquire_write(index, Duration::from_secs(5)).unwrap();

        let started = Instant::now();
        let result = gate.acquire_write(index, Duration::ZERO);
        assert!(matches!(result, Err(Error::ConcurrencyUnavailable(_))));
        assert!(started.elapsed() < Duration::from_millis(100));
    }

    #[test]
    fn test_write_permit_released_on_drop() {
        let (gate, index) = gate_with(GateLimits::default());
        {
            let _held = gate.acquire_write(index, Duration::ZERO).unwrap();
            assert_eq!(gate.writes_in_use(index), 1);
        }
        assert_eq!(gate.writes_in_use(index), 0);
        assert!(gate.acquire_write(index, Duration::ZERO).is_ok());
    }

    #[test]
    fn test_unbounded_reads_never_block() {
        let (gate, index) = gate_with(GateLimits::default());
        let permits: Vec<_> = (0..64)
            .map(|_| gate.acquire_read(index).unwrap())
            .collect();
        assert_eq!(permits.len(), 64);
    }

    #[test]
    fn test_bounded_wait_succeeds_after_release() {
        let (gate, index) = gate_with(GateLimits::default());
        let gate = Arc::new(gate);
        let held = gate.acquire_write(index, Duration::ZERO).unwrap();

        let contender = {
            let gate = gate.clone();
            thread::spawn(move || gate.acquire_write(index, Duration::from_secs(5)))
        };

        thread::sleep(Duration::from_millis(50));
        drop(held);
        assert!(contender.join().unwrap().is_ok());
    }

    #[test]
    fn test_reads_do_not_consume_write_slots() {
        let (gate, index) = gate_with(GateLimits::default());
        let _readers: Vec<_> = (0..8).map(|_| gate.acquire_read(index).unwrap()).collect();
        assert!(gate.acquire_write(index, Duration::ZERO).is_ok());
    }

    #[test]
    fn test_unknown_index_rejected() {
        let gate = ReadWriteGate::new();
        assert!(matches!(
            gate.acquire_read(Uuid::new_v4()),
            Err(Error::NotFound(_))
        ));
    }

    #[test]
    fn test_bounded_reads_block_at_capacity() {
        let (gate, index) = gate_with(GateLimits {
            max_reads: Some(2),
            max_writes: 1,
        });
        let gate = Arc::new(gate);
        let first = gate.acquire_read(index).unwrap();
        let _second = gate.acquire_read(index).unwrap();

        let third = {
            let gate = gate.clone();
            thread::spawn(move || gate.acquire_read(index).map(|_| ()))
        };

        thread::sleep(Duration::from_millis(50));
        drop(first);
        assert!(third.join().unwrap().is_ok());
    }
}
