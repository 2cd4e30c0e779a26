//! Virtual-only time driver for Embassy.
//!
//! This module implements a global `embassy_time_driver::Driver` whose clock
//! has no relationship to wall-clock time at all: `now()` returns a tick
//! counter that only moves when the scheduler thread explicitly jumps it to
//! the next queued deadline. There is no sleeping, no scaling, no real-time
//! origin — this is a pure discrete-event clock, matching the event-loop
//! design called for in the simulation's concurrency model (an explicit
//! priority queue keyed by (time, tiebreak-seq), advanced only on demand).
//!
//! FIFO-at-equal-time is a byproduct of the data structure: wakers scheduled
//! for the same tick are pushed onto the same `Vec` in call order, and
//! `schedule_wake` is only ever invoked from the single cooperative executor
//! thread, so push order already equals dispatch order. No explicit sequence
//! counter is needed.
//!
//! ## Lock ordering
//!
//! Only one lock (`SCHED`) exists; there is no separate clock lock to order
//! against.

use core::task::Waker;
use embassy_time_driver::{Driver, time_driver_impl};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Condvar, Mutex, OnceLock};

#[derive(Default)]
struct SchedulerState {
    queue: BTreeMap<u64, Vec<Waker>>,
}

static NOW: AtomicU64 = AtomicU64::new(0);
static SCHED: OnceLock<Mutex<SchedulerState>> = OnceLock::new();
static CV: OnceLock<Condvar> = OnceLock::new();
static ADVANCER_STARTED: OnceLock<()> = OnceLock::new();

fn sched() -> &'static Mutex<SchedulerState> {
    SCHED.get_or_init(|| Mutex::new(SchedulerState::default()))
}

fn cv() -> &'static Condvar {
    CV.get_or_init(Condvar::new)
}

/// Current virtual tick count. Advances only via `schedule_wake`-driven jumps.
pub fn now_ticks() -> u64 {
    NOW.load(Ordering::Acquire)
}

fn ensure_advancer_thread() {
    ADVANCER_STARTED.get_or_init(|| {
        std::thread::Builder::new()
            .name("virtual-clock-advancer".into())
            .spawn(advancer_thread)
            .expect("failed to start virtual clock advancer thread");
    });
}

/// Continuously jumps the virtual clock to the next queued deadline and
/// wakes the tasks due at that instant. No real time ever elapses here:
/// the next event is dispatched as soon as the executor has parked all
/// currently-runnable tasks.
fn advancer_thread() {
    loop {
        let mut guard = sched().lock().unwrap();
        loop {
            if let Some((&next_at, _)) = guard.queue.iter().next() {
                if next_at <= NOW.load(Ordering::Acquire) {
                    break;
                }
                NOW.store(next_at, Ordering::Release);
                break;
            }
            guard = cv().wait(guard).unwrap();
        }
        let next_at = NOW.load(Ordering::Acquire);
        let ready = guard.queue.remove(&next_at).unwrap_or_default();
        drop(guard);
        for w in ready {
            w.wake();
        }
    }
}

struct VirtualDriver;

impl Driver for VirtualDriver {
    fn now(&self) -> u64 {
        now_ticks()
    }

    fn schedule_wake(&self, at: u64, waker: &Waker) {
        ensure_advancer_thread();
        let mut guard = sched().lock().unwrap();
        if at <= now_ticks() {
            drop(guard);
            waker.wake_by_ref();
            return;
        }
        guard.queue.entry(at).or_default().push(waker.clone());
        drop(guard);
        cv().notify_all();
    }
}

time_driver_impl!(static DRIVER: VirtualDriver = VirtualDriver);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn now_ticks_is_monotonic_nondecreasing() {
        let a = now_ticks();
        let b = now_ticks();
        assert!(b >= a);
    }
}
