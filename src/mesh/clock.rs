//! Lamport logical clock.

use std::sync::atomic::{AtomicU64, Ordering};

/// Per-node monotonic logical counter.
///
/// `tick` stamps local events; `witness` merges a remote timestamp so that
/// causally-later events always carry larger values. The counter never goes
/// backwards.
#[derive(Debug)]
pub struct LamportClock {
    counter: AtomicU64,
}

impl LamportClock {
    pub fn new(initial: u64) -> Self {
        Self { counter: AtomicU64::new(initial) }
    }

    /// Advance for a local event and return the new timestamp.
    pub fn tick(&self) -> u64 {
        self.counter.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Merge a remote timestamp: counter becomes `max(local, remote) + 1`.
    /// Returns the new local value.
    pub fn witness(&self, remote: u64) -> u64 {
        let mut current = self.counter.load(Ordering::SeqCst);
        loop {
            let next = current.max(remote) + 1;
            match self.counter.compare_exchange(current, next, Ordering::SeqCst, Ordering::SeqCst) {
                Ok(_) => return next,
                Err(observed) => current = observed,
            }
        }
    }

    /// Current value without advancing.
    pub fn current(&self) -> u64 {
        self.counter.load(Ordering::SeqCst)
    }
}

impl Default for LamportClock {
    fn default() -> Self {
        Self::new(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tick_is_monotonic() {
        let clock = LamportClock::new(0);
        assert_eq!(clock.tick(), 1);
        assert_eq!(clock.tick(), 2);
        assert_eq!(clock.current(), 2);
    }

    #[test]
    fn witness_jumps_past_remote() {
        let clock = LamportClock::new(3);
        assert_eq!(clock.witness(10), 11);
        // A remote value behind us still advances by one.
        assert_eq!(clock.witness(2), 12);
    }

    #[test]
    fn restored_clock_continues() {
        let clock = LamportClock::new(41);
        assert_eq!(clock.tick(), 42);
    }

    #[test]
    fn concurrent_ticks_never_collide() {
        let clock = std::sync::Arc::new(LamportClock::new(0));
        let mut handles = Vec::new();
        for _ in 0..8 {
            let c = clock.clone();
            handles.push(std::thread::spawn(move || {
                (0..1000).map(|_| c.tick()).collect::<Vec<_>>()
            }));
        }
        let mut all: Vec<u64> = handles.into_iter().flat_map(|h| h.join().unwrap()).collect();
        all.sort_unstable();
        all.dedup();
        assert_eq!(all.len(), 8000);
    }
}
