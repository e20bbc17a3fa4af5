//! In-flight request accounting.
//!
//! The count starts at one: a guard held by the profiler itself and
//! released by `finalize`, so the done signal cannot fire before the
//! application has had a chance to submit anything. Release builds keep a
//! single atomic. Builds with debug assertions keep one count per request
//! kind under a lock and check every decrement against its kind.

#[cfg(not(debug_assertions))]
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::{Condvar, Mutex};

use crate::measurement::ProfilingKind;

/// One-shot signal fired when the last outstanding request completes.
#[derive(Debug, Default)]
pub struct DoneEvent {
    triggered: Mutex<bool>,
    cond: Condvar,
}

impl DoneEvent {
    pub fn trigger(&self) {
        let mut triggered = self.triggered.lock();
        assert!(!*triggered, "profiling done event triggered twice");
        *triggered = true;
        self.cond.notify_all();
    }

    pub fn has_triggered(&self) -> bool {
        *self.triggered.lock()
    }

    pub fn wait(&self) {
        let mut triggered = self.triggered.lock();
        while !*triggered {
            self.cond.wait(&mut triggered);
        }
    }
}

#[cfg(not(debug_assertions))]
#[derive(Debug)]
pub struct OutstandingRequests {
    total: AtomicUsize,
    done: DoneEvent,
}

#[cfg(not(debug_assertions))]
impl OutstandingRequests {
    pub fn new() -> Self {
        OutstandingRequests {
            total: AtomicUsize::new(1),
            done: DoneEvent::default(),
        }
    }

    pub fn increment(&self, _kind: ProfilingKind, count: usize) {
        self.total.fetch_add(count, Ordering::AcqRel);
    }

    /// Returns true for the one call that brought the count to zero.
    pub fn decrement(&self, _kind: ProfilingKind, count: usize) -> bool {
        let previous = self.total.fetch_sub(count, Ordering::AcqRel);
        if previous == count {
            self.done.trigger();
            true
        } else {
            false
        }
    }

    pub fn outstanding(&self) -> usize {
        self.total.load(Ordering::Acquire)
    }

    pub fn done(&self) -> &DoneEvent {
        &self.done
    }
}

#[cfg(debug_assertions)]
#[derive(Debug)]
pub struct OutstandingRequests {
    per_kind: Mutex<[usize; ProfilingKind::COUNT]>,
    done: DoneEvent,
}

#[cfg(debug_assertions)]
impl OutstandingRequests {
    pub fn new() -> Self {
        let mut per_kind = [0; ProfilingKind::COUNT];
        // the guard
        per_kind[ProfilingKind::Meta.index()] = 1;
        OutstandingRequests {
            per_kind: Mutex::new(per_kind),
            done: DoneEvent::default(),
        }
    }

    pub fn increment(&self, kind: ProfilingKind, count: usize) {
        self.per_kind.lock()[kind.index()] += count;
    }

    /// Returns true for the one call that brought the count to zero.
    pub fn decrement(&self, kind: ProfilingKind, count: usize) -> bool {
        let mut per_kind = self.per_kind.lock();
        let slot = &mut per_kind[kind.index()];
        assert!(
            *slot >= count,
            "{:?} requests decremented below zero ({} - {})",
            kind,
            slot,
            count
        );
        *slot -= count;
        if per_kind.iter().any(|&outstanding| outstanding > 0) {
            return false;
        }
        self.done.trigger();
        true
    }

    pub fn outstanding(&self) -> usize {
        self.per_kind.lock().iter().sum()
    }

    pub fn done(&self) -> &DoneEvent {
        &self.done
    }
}

impl Default for OutstandingRequests {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    #[test]
    fn test_guard_only() {
        let requests = OutstandingRequests::new();
        assert_eq!(requests.outstanding(), 1);
        assert!(!requests.done().has_triggered());
        assert!(requests.decrement(ProfilingKind::Meta, 1));
        assert!(requests.done().has_triggered());
        assert_eq!(requests.outstanding(), 0);
    }

    #[test]
    fn test_zero_exactly_once() {
        const N: usize = 64;
        let requests = Arc::new(OutstandingRequests::new());
        let observed = Arc::new(AtomicUsize::new(0));

        let waiter = {
            let requests = requests.clone();
            let observed = observed.clone();
            thread::spawn(move || {
                requests.done().wait();
                observed.fetch_add(1, Ordering::SeqCst);
            })
        };

        for _ in 0..N {
            requests.increment(ProfilingKind::Task, 1);
        }
        let fired: usize = thread::scope(|s| {
            let handles: Vec<_> = (0..N)
                .map(|_| s.spawn(|| requests.decrement(ProfilingKind::Task, 1) as usize))
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).sum()
        });
        assert_eq!(fired, 0);
        assert!(!requests.done().has_triggered());

        assert!(requests.decrement(ProfilingKind::Meta, 1));
        waiter.join().unwrap();
        assert_eq!(observed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_batched_counts() {
        let requests = OutstandingRequests::new();
        requests.increment(ProfilingKind::Copy, 3);
        assert_eq!(requests.outstanding(), 4);
        assert!(!requests.decrement(ProfilingKind::Copy, 2));
        assert!(!requests.decrement(ProfilingKind::Meta, 1));
        assert!(requests.decrement(ProfilingKind::Copy, 1));
    }

    #[test]
    #[should_panic]
    fn test_double_trigger_panics() {
        let done = DoneEvent::default();
        done.trigger();
        done.trigger();
    }
}
