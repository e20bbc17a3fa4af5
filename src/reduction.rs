//! Barrier arrival reduction.
//!
//! Every arrival on a Realm barrier carries an [`ArrivalInfo`]; the barrier
//! reduces them so that, once it triggers, the profiler can tell which
//! arrival was the last one to become ready. The reduction keeps the
//! contribution with the largest `trigger_time`.
//!
//! Realm applies reductions either with exclusive access to the accumulator
//! or concurrently with other producers. The shared path never locks: a
//! writer claims the accumulator by swapping `trigger_time` to [`SENTINEL`],
//! copies the payload, and publishes the new trigger time with release
//! ordering. Readers go through [`ArrivalInfo::snapshot`] which never
//! returns a half-written payload.

use std::hint;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering, fence};

use nonmax::NonMaxI64;

use crate::state::EventID;

/// Marks an accumulator whose payload is being rewritten.
pub const SENTINEL: i64 = i64::MAX;

#[derive(Debug)]
pub struct ArrivalInfo {
    arrival_time: AtomicI64,
    trigger_time: AtomicI64,
    precondition: AtomicU64,
    fevent: AtomicU64,
}

/// A settled view of an [`ArrivalInfo`].
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Arrival {
    pub arrival_time: i64,
    pub trigger_time: NonMaxI64,
    pub precondition: EventID,
    pub fevent: EventID,
}

impl ArrivalInfo {
    pub const fn identity() -> Self {
        ArrivalInfo {
            arrival_time: AtomicI64::new(0),
            trigger_time: AtomicI64::new(i64::MIN),
            precondition: AtomicU64::new(0),
            fevent: AtomicU64::new(0),
        }
    }

    pub fn new(
        arrival_time: i64,
        trigger_time: NonMaxI64,
        precondition: EventID,
        fevent: EventID,
    ) -> Self {
        ArrivalInfo {
            arrival_time: AtomicI64::new(arrival_time),
            trigger_time: AtomicI64::new(trigger_time.get()),
            precondition: AtomicU64::new(precondition.0),
            fevent: AtomicU64::new(fevent.0),
        }
    }

    /// Reads a consistent copy of the accumulator, waiting out any writer
    /// that is in the middle of an update.
    pub fn snapshot(&self) -> Arrival {
        loop {
            let before = self.trigger_time.load(Ordering::Acquire);
            if before == SENTINEL {
                hint::spin_loop();
                continue;
            }
            let arrival_time = self.arrival_time.load(Ordering::Relaxed);
            let precondition = self.precondition.load(Ordering::Relaxed);
            let fevent = self.fevent.load(Ordering::Relaxed);
            fence(Ordering::Acquire);
            // Trigger times only ever grow, so an unchanged value means no
            // writer touched the payload while we were reading it.
            if self.trigger_time.load(Ordering::Relaxed) != before {
                continue;
            }
            let Some(trigger_time) = NonMaxI64::new(before) else {
                continue;
            };
            return Arrival {
                arrival_time,
                trigger_time,
                precondition: EventID(precondition),
                fevent: EventID(fevent),
            };
        }
    }

    pub fn trigger_time(&self) -> NonMaxI64 {
        self.snapshot().trigger_time
    }

    fn store_payload(&self, rhs: &Arrival) {
        self.arrival_time.store(rhs.arrival_time, Ordering::Relaxed);
        self.precondition.store(rhs.precondition.0, Ordering::Relaxed);
        self.fevent.store(rhs.fevent.0, Ordering::Relaxed);
    }

    fn reduce_exclusive(&mut self, rhs: &Arrival) {
        let trigger_time = self.trigger_time.get_mut();
        if *trigger_time < rhs.trigger_time.get() {
            *self.arrival_time.get_mut() = rhs.arrival_time;
            *self.precondition.get_mut() = rhs.precondition.0;
            *self.fevent.get_mut() = rhs.fevent.0;
            *self.trigger_time.get_mut() = rhs.trigger_time.get();
        }
    }

    fn reduce_shared(&self, rhs: &Arrival) {
        let trigger_time = rhs.trigger_time.get();
        let mut previous = self.trigger_time.load(Ordering::Acquire);
        loop {
            if previous == SENTINEL {
                hint::spin_loop();
                previous = self.trigger_time.load(Ordering::Acquire);
                continue;
            }
            if trigger_time <= previous {
                return;
            }
            match self.trigger_time.compare_exchange_weak(
                previous,
                SENTINEL,
                Ordering::Acquire,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(actual) => previous = actual,
            }
        }
        // Orders the sentinel before the payload stores.
        fence(Ordering::Release);
        self.store_payload(rhs);
        self.trigger_time.store(trigger_time, Ordering::Release);
    }
}

impl Default for ArrivalInfo {
    fn default() -> Self {
        ArrivalInfo::identity()
    }
}

impl Clone for ArrivalInfo {
    fn clone(&self) -> Self {
        ArrivalInfo::from(self.snapshot())
    }
}

impl From<Arrival> for ArrivalInfo {
    fn from(arrival: Arrival) -> Self {
        ArrivalInfo::new(
            arrival.arrival_time,
            arrival.trigger_time,
            arrival.precondition,
            arrival.fevent,
        )
    }
}

/// The shape Realm expects from a reduction operator: `apply` folds a
/// right-hand side into the accumulator, `fold` combines two right-hand
/// sides. `EXCLUSIVE` says whether the caller has sole access to the target.
pub trait ReductionOp {
    type LHS;
    type RHS;

    fn identity() -> Self::RHS;
    fn apply<const EXCLUSIVE: bool>(lhs: &Self::LHS, rhs: &Self::RHS);
    fn fold<const EXCLUSIVE: bool>(rhs1: &Self::RHS, rhs2: &Self::RHS);
}

pub struct BarrierArrivalReduction;

impl BarrierArrivalReduction {
    pub const REDOP_ID: u32 = 1;

    /// Exclusive fold for callers that can prove sole ownership of the target.
    pub fn apply_exclusive(lhs: &mut ArrivalInfo, rhs: &ArrivalInfo) {
        let rhs = rhs.snapshot();
        lhs.reduce_exclusive(&rhs);
    }

    pub fn apply_shared(lhs: &ArrivalInfo, rhs: &ArrivalInfo) {
        let rhs = rhs.snapshot();
        lhs.reduce_shared(&rhs);
    }
}

impl ReductionOp for BarrierArrivalReduction {
    type LHS = ArrivalInfo;
    type RHS = ArrivalInfo;

    fn identity() -> ArrivalInfo {
        ArrivalInfo::identity()
    }

    fn apply<const EXCLUSIVE: bool>(lhs: &ArrivalInfo, rhs: &ArrivalInfo) {
        let rhs = rhs.snapshot();
        if EXCLUSIVE {
            // Nobody else writes the target. Readers may still be
            // snapshotting it, so the payload is bracketed by the sentinel.
            if lhs.trigger_time.load(Ordering::Relaxed) < rhs.trigger_time.get() {
                lhs.trigger_time.store(SENTINEL, Ordering::Relaxed);
                fence(Ordering::Release);
                lhs.store_payload(&rhs);
                lhs.trigger_time
                    .store(rhs.trigger_time.get(), Ordering::Release);
            }
        } else {
            lhs.reduce_shared(&rhs);
        }
    }

    fn fold<const EXCLUSIVE: bool>(rhs1: &ArrivalInfo, rhs2: &ArrivalInfo) {
        Self::apply::<EXCLUSIVE>(rhs1, rhs2)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::Arc;
    use std::sync::atomic::AtomicBool;
    use std::thread;

    use rayon::prelude::*;

    fn arrival(trigger: i64) -> ArrivalInfo {
        // Payload is derived from the trigger time so torn reads are visible.
        ArrivalInfo::new(
            trigger - 7,
            NonMaxI64::new(trigger).unwrap(),
            EventID(trigger as u64 + 1),
            EventID(trigger as u64 + 2),
        )
    }

    fn assert_consistent(a: &Arrival) {
        let t = a.trigger_time.get();
        if t == i64::MIN {
            return;
        }
        assert_eq!(a.arrival_time, t - 7);
        assert_eq!(a.precondition, EventID(t as u64 + 1));
        assert_eq!(a.fevent, EventID(t as u64 + 2));
    }

    #[test]
    fn test_identity() {
        let id = BarrierArrivalReduction::identity().snapshot();
        assert_eq!(id.trigger_time.get(), i64::MIN);
        assert_eq!(id.arrival_time, 0);
        assert!(!id.precondition.exists());
    }

    #[test]
    fn test_exclusive_max_wins() {
        let mut lhs = ArrivalInfo::identity();
        for t in [5, 30, 10, 30, 2] {
            BarrierArrivalReduction::apply_exclusive(&mut lhs, &arrival(t));
        }
        let s = lhs.snapshot();
        assert_eq!(s.trigger_time.get(), 30);
        assert_consistent(&s);
    }

    #[test]
    fn test_tie_keeps_first() {
        let lhs = ArrivalInfo::identity();
        let first = ArrivalInfo::new(1, NonMaxI64::new(10).unwrap(), EventID(1), EventID(1));
        let second = ArrivalInfo::new(2, NonMaxI64::new(10).unwrap(), EventID(2), EventID(2));
        BarrierArrivalReduction::apply::<false>(&lhs, &first);
        BarrierArrivalReduction::apply::<false>(&lhs, &second);
        assert_eq!(lhs.snapshot().arrival_time, 1);
    }

    #[test]
    fn test_fold_tree() {
        let left = arrival(4);
        let right = arrival(9);
        BarrierArrivalReduction::fold::<true>(&left, &arrival(1));
        BarrierArrivalReduction::fold::<false>(&right, &arrival(3));
        let root = ArrivalInfo::identity();
        BarrierArrivalReduction::apply::<false>(&root, &left);
        BarrierArrivalReduction::apply::<false>(&root, &right);
        assert_eq!(root.trigger_time().get(), 9);
        assert_consistent(&root.snapshot());
    }

    #[test]
    fn test_shared_threads_max_wins() {
        for _ in 0..8 {
            let mut triggers: Vec<i64> = (1..=4000).collect();
            fastrand::shuffle(&mut triggers);
            let lhs = Arc::new(ArrivalInfo::identity());
            let done = Arc::new(AtomicBool::new(false));

            let reader = {
                let lhs = lhs.clone();
                let done = done.clone();
                thread::spawn(move || {
                    while !done.load(Ordering::Acquire) {
                        assert_consistent(&lhs.snapshot());
                    }
                })
            };

            thread::scope(|s| {
                for chunk in triggers.chunks(500) {
                    let lhs = &lhs;
                    s.spawn(move || {
                        for t in chunk {
                            BarrierArrivalReduction::apply::<false>(lhs, &arrival(*t));
                        }
                    });
                }
            });
            done.store(true, Ordering::Release);
            reader.join().unwrap();

            let s = lhs.snapshot();
            assert_eq!(s.trigger_time.get(), 4000);
            assert_consistent(&s);
        }
    }

    #[test]
    fn test_exclusive_writer_with_concurrent_readers() {
        let lhs = ArrivalInfo::identity();
        let done = AtomicBool::new(false);
        thread::scope(|s| {
            for _ in 0..4 {
                s.spawn(|| {
                    let mut last = i64::MIN;
                    while !done.load(Ordering::Acquire) {
                        let a = lhs.snapshot();
                        assert_consistent(&a);
                        assert!(a.trigger_time.get() >= last);
                        last = a.trigger_time.get();
                    }
                });
            }
            s.spawn(|| {
                for t in 1..=20_000 {
                    BarrierArrivalReduction::apply::<true>(&lhs, &arrival(t));
                }
                done.store(true, Ordering::Release);
            });
        });
        let s = lhs.snapshot();
        assert_eq!(s.trigger_time.get(), 20_000);
        assert_consistent(&s);
    }

    #[test]
    fn test_shared_rayon_max_wins() {
        let mut triggers: Vec<i64> = (0..10_000).map(|_| fastrand::i64(0..1_000_000)).collect();
        let expected = *triggers.iter().max().unwrap();
        fastrand::shuffle(&mut triggers);
        let lhs = ArrivalInfo::identity();
        triggers
            .par_iter()
            .for_each(|t| BarrierArrivalReduction::apply::<false>(&lhs, &arrival(*t)));
        let s = lhs.snapshot();
        assert_eq!(s.trigger_time.get(), expected);
        assert_consistent(&s);
    }
}
