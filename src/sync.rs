//! Shared concurrency primitives used throughout the core (spec.md §5, §9).
//!
//! The kernel-module source this spec distills uses a spinlock for short,
//! non-sleeping critical sections, a sleeping mutex for long operations, and
//! an in-kernel `completion` object (level-triggered, sticky-until-reset,
//! interruptible, with an optional timeout) to let client threads wait for
//! device events. None of those map onto a single std type, so they are
//! modeled explicitly here rather than hand-waved with a bare `Mutex`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

/// The device's short lock: protects the cached register banks, the device
/// state word, and the cancel flag. Held only for brief, non-sleeping
/// sections and never across a blocking wait or a coherent-memory free.
pub type ShortLock<T> = Mutex<T>;

/// The device's long lock: serializes mode changes, arming, JTAG access,
/// and buffered-transfer lifecycles. Coarser than `ShortLock`; may be held
/// while waiting on I/O that does not itself block on a `CompletionEvent`.
pub type LongLock<T> = Mutex<T>;

/// A level-triggered, interruptible completion event.
///
/// `signal` is sticky: once set it stays set until `reset`. This matches
/// spec.md §4.5's ordering guarantee that the "samples complete" flag (and,
/// more generally, any arm/wait pairing) cannot be missed by a client that
/// arms and then immediately waits, even if the interrupt already fired.
#[derive(Debug, Default)]
pub struct CompletionEvent {
    signaled: AtomicBool,
    gate: Mutex<bool>,
    cv: Condvar,
}

/// Why a wait on a `CompletionEvent` returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    Signaled,
    TimedOut,
    Interrupted,
}

impl CompletionEvent {
    pub fn new() -> Self {
        CompletionEvent {
            signaled: AtomicBool::new(false),
            gate: Mutex::new(false),
            cv: Condvar::new(),
        }
    }

    /// Set the event. Safe to call from an interrupt/bottom-half context:
    /// does not allocate and the `Condvar::notify_all` call does not block.
    pub fn signal(&self) {
        self.signaled.store(true, Ordering::SeqCst);
        let mut gate = self.gate.lock();
        *gate = true;
        self.cv.notify_all();
    }

    /// Clear the sticky signal, e.g. when (re)arming an acquisition.
    pub fn reset(&self) {
        self.signaled.store(false, Ordering::SeqCst);
        *self.gate.lock() = false;
    }

    pub fn is_signaled(&self) -> bool {
        self.signaled.load(Ordering::SeqCst)
    }

    /// Block until signaled or until `interrupt` reports true. Returns
    /// immediately if already signaled (the sticky-set invariant).
    pub fn wait_interruptible(&self, interrupt: &AtomicBool) -> WaitOutcome {
        let mut gate = self.gate.lock();
        while !*gate {
            if interrupt.load(Ordering::SeqCst) {
                return WaitOutcome::Interrupted;
            }
            let timed_out = self
                .cv
                .wait_for(&mut gate, Duration::from_millis(50))
                .timed_out();
            if !timed_out {
                break;
            }
        }
        if *gate {
            WaitOutcome::Signaled
        } else {
            WaitOutcome::Interrupted
        }
    }

    /// Block until signaled, `timeout` elapses, or `interrupt` reports true.
    pub fn wait_timeout(&self, timeout: Duration, interrupt: &AtomicBool) -> WaitOutcome {
        let deadline = Instant::now() + timeout;
        let mut gate = self.gate.lock();
        while !*gate {
            if interrupt.load(Ordering::SeqCst) {
                return WaitOutcome::Interrupted;
            }
            let now = Instant::now();
            if now >= deadline {
                return WaitOutcome::TimedOut;
            }
            let slice = (deadline - now).min(Duration::from_millis(50));
            self.cv.wait_for(&mut gate, slice);
        }
        WaitOutcome::Signaled
    }
}

/// A classic counting semaphore, cancellable by forcing its count upward
/// and setting a shared stop flag that waiters re-check on every wakeup.
///
/// Used by the chained recording engine (spec.md §4.10) to hand buffer
/// slots between a producer and consumer thread.
#[derive(Debug)]
pub struct Semaphore {
    state: Mutex<usize>,
    cv: Condvar,
}

impl Semaphore {
    pub fn new(initial: usize) -> Self {
        Semaphore {
            state: Mutex::new(initial),
            cv: Condvar::new(),
        }
    }

    /// Block until a permit is available or `stop` becomes true. Returns
    /// `false` if it woke due to `stop` rather than acquiring a permit.
    pub fn acquire(&self, stop: &AtomicBool) -> bool {
        let mut count = self.state.lock();
        loop {
            if *count > 0 {
                *count -= 1;
                return true;
            }
            if stop.load(Ordering::SeqCst) {
                return false;
            }
            self.cv.wait_for(&mut count, Duration::from_millis(50));
        }
    }

    pub fn release(&self) {
        let mut count = self.state.lock();
        *count += 1;
        self.cv.notify_all();
    }

    /// Wake every waiter without granting a permit; used to break a
    /// producer or consumer out of `acquire` once `stop` has been set.
    pub fn wake_all(&self) {
        self.cv.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn completion_event_wait_after_signal_returns_immediately() {
        let ev = CompletionEvent::new();
        ev.signal();
        let interrupt = AtomicBool::new(false);
        assert_eq!(
            ev.wait_timeout(Duration::from_millis(10), &interrupt),
            WaitOutcome::Signaled
        );
    }

    #[test]
    fn completion_event_signaled_from_other_thread_is_observed() {
        let ev = Arc::new(CompletionEvent::new());
        let ev2 = ev.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            ev2.signal();
        });
        let interrupt = AtomicBool::new(false);
        let outcome = ev.wait_timeout(Duration::from_secs(2), &interrupt);
        handle.join().unwrap();
        assert_eq!(outcome, WaitOutcome::Signaled);
    }

    #[test]
    fn completion_event_timeout_without_signal() {
        let ev = CompletionEvent::new();
        let interrupt = AtomicBool::new(false);
        assert_eq!(
            ev.wait_timeout(Duration::from_millis(20), &interrupt),
            WaitOutcome::TimedOut
        );
    }

    #[test]
    fn semaphore_blocks_until_release() {
        let sem = Arc::new(Semaphore::new(0));
        let sem2 = sem.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            sem2.release();
        });
        let stop = AtomicBool::new(false);
        assert!(sem.acquire(&stop));
        handle.join().unwrap();
    }

    #[test]
    fn semaphore_acquire_aborts_on_stop() {
        let sem = Arc::new(Semaphore::new(0));
        let stop = Arc::new(AtomicBool::new(false));
        let sem2 = sem.clone();
        let stop2 = stop.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            stop2.store(true, Ordering::SeqCst);
            sem2.wake_all();
        });
        assert!(!sem.acquire(&stop));
        handle.join().unwrap();
    }
}
