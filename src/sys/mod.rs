//! Narrow abstraction over the host's scheduling primitives.
//!
//! The stack touches the operating system only through this module: spin
//! locks for short real-time critical sections, sleeping mutexes for
//! configuration paths, counted semaphores and events for wake-ups, and
//! named tasks. Everything above it is plain, portable code.

use std::sync::{Condvar, Mutex};
use std::thread;

use crate::time::{Duration, Instant};

/// Spinlock guarding a short real-time critical section. Never held across
/// a driver call or a wake-up.
pub type RtLock<T> = spin::Mutex<T>;

/// Sleeping mutex for non-real-time configuration paths.
pub type NrtLock<T> = Mutex<T>;

/// Outcome of a blocking wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    Signaled,
    TimedOut,
    /// The primitive was torn down while waiting.
    Closed,
}

/// Counted semaphore mirroring a queue length.
///
/// Every `signal` is retained, so a bounded consumer racing an unbounded
/// producer misses packets at the pool, never wake-ups.
#[derive(Debug)]
pub struct RtSem {
    state: Mutex<SemState>,
    cond: Condvar,
}

#[derive(Debug)]
struct SemState {
    count: u32,
    closed: bool,
}

impl RtSem {
    pub fn new(initial: u32) -> RtSem {
        RtSem {
            state: Mutex::new(SemState {
                count: initial,
                closed: false,
            }),
            cond: Condvar::new(),
        }
    }

    pub fn signal(&self) {
        let mut state = self.state.lock().unwrap();
        state.count += 1;
        drop(state);
        self.cond.notify_one();
    }

    /// Consume one count without blocking.
    pub fn try_wait(&self) -> WaitOutcome {
        let mut state = self.state.lock().unwrap();
        if state.closed {
            WaitOutcome::Closed
        } else if state.count > 0 {
            state.count -= 1;
            WaitOutcome::Signaled
        } else {
            WaitOutcome::TimedOut
        }
    }

    /// Block until a count is available, `timeout` expires, or the
    /// semaphore is closed. `None` blocks forever.
    pub fn wait(&self, timeout: Option<Duration>) -> WaitOutcome {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut state = self.state.lock().unwrap();
        loop {
            if state.closed {
                return WaitOutcome::Closed;
            }
            if state.count > 0 {
                state.count -= 1;
                return WaitOutcome::Signaled;
            }
            match deadline {
                None => state = self.cond.wait(state).unwrap(),
                Some(deadline) => {
                    let left = Instant::now().nanos_until(deadline);
                    if left == Duration::ZERO {
                        return WaitOutcome::TimedOut;
                    }
                    let (next, _) = self
                        .cond
                        .wait_timeout(state, left.into())
                        .unwrap();
                    state = next;
                }
            }
        }
    }

    /// Wake every waiter with [`WaitOutcome::Closed`]. Further waits fail
    /// immediately.
    pub fn close(&self) {
        self.state.lock().unwrap().closed = true;
        self.cond.notify_all();
    }
}

/// Auto-reset wake-up event, the signal a driver raises towards the stack
/// manager and the TDMA worker's trigger.
#[derive(Debug)]
pub struct RtEvent {
    state: Mutex<EventState>,
    cond: Condvar,
}

#[derive(Debug)]
struct EventState {
    pending: bool,
    closed: bool,
}

impl RtEvent {
    pub fn new() -> RtEvent {
        RtEvent {
            state: Mutex::new(EventState {
                pending: false,
                closed: false,
            }),
            cond: Condvar::new(),
        }
    }

    pub fn signal(&self) {
        self.state.lock().unwrap().pending = true;
        self.cond.notify_one();
    }

    pub fn wait(&self, timeout: Option<Duration>) -> WaitOutcome {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut state = self.state.lock().unwrap();
        loop {
            if state.closed {
                return WaitOutcome::Closed;
            }
            if state.pending {
                state.pending = false;
                return WaitOutcome::Signaled;
            }
            match deadline {
                None => state = self.cond.wait(state).unwrap(),
                Some(deadline) => {
                    let left = Instant::now().nanos_until(deadline);
                    if left == Duration::ZERO {
                        return WaitOutcome::TimedOut;
                    }
                    let (next, _) = self
                        .cond
                        .wait_timeout(state, left.into())
                        .unwrap();
                    state = next;
                }
            }
        }
    }

    pub fn close(&self) {
        self.state.lock().unwrap().closed = true;
        self.cond.notify_all();
    }
}

impl Default for RtEvent {
    fn default() -> Self {
        RtEvent::new()
    }
}

/// Broadcast event: every `pulse` wakes all current waiters at once.
///
/// Waiters observe a generation counter, so a pulse between two waits is
/// never lost and one pulse never satisfies two successive waits.
#[derive(Debug)]
pub struct PulseEvent {
    state: Mutex<PulseState>,
    cond: Condvar,
}

#[derive(Debug)]
struct PulseState {
    generation: u64,
    closed: bool,
}

impl PulseEvent {
    pub fn new() -> PulseEvent {
        PulseEvent {
            state: Mutex::new(PulseState {
                generation: 0,
                closed: false,
            }),
            cond: Condvar::new(),
        }
    }

    pub fn pulse(&self) {
        self.state.lock().unwrap().generation += 1;
        self.cond.notify_all();
    }

    /// Current pulse generation, for [`Self::wait_since`].
    pub fn generation(&self) -> u64 {
        self.state.lock().unwrap().generation
    }

    /// Wait until the generation moves past `seen`. Returns the outcome
    /// and the generation observed, so a consumer polling in a loop
    /// never loses a pulse that fired while it was busy.
    pub fn wait_since(&self, seen: u64, timeout: Option<Duration>) -> (WaitOutcome, u64) {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut state = self.state.lock().unwrap();
        loop {
            if state.closed {
                return (WaitOutcome::Closed, state.generation);
            }
            if state.generation != seen {
                return (WaitOutcome::Signaled, state.generation);
            }
            match deadline {
                None => state = self.cond.wait(state).unwrap(),
                Some(deadline) => {
                    let left = Instant::now().nanos_until(deadline);
                    if left == Duration::ZERO {
                        return (WaitOutcome::TimedOut, state.generation);
                    }
                    let (next, _) = self
                        .cond
                        .wait_timeout(state, left.into())
                        .unwrap();
                    state = next;
                }
            }
        }
    }

    /// Wait for the next pulse after the call.
    pub fn wait_next(&self, timeout: Option<Duration>) -> WaitOutcome {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut state = self.state.lock().unwrap();
        let seen = state.generation;
        loop {
            if state.closed {
                return WaitOutcome::Closed;
            }
            if state.generation != seen {
                return WaitOutcome::Signaled;
            }
            match deadline {
                None => state = self.cond.wait(state).unwrap(),
                Some(deadline) => {
                    let left = Instant::now().nanos_until(deadline);
                    if left == Duration::ZERO {
                        return WaitOutcome::TimedOut;
                    }
                    let (next, _) = self
                        .cond
                        .wait_timeout(state, left.into())
                        .unwrap();
                    state = next;
                }
            }
        }
    }

    pub fn close(&self) {
        self.state.lock().unwrap().closed = true;
        self.cond.notify_all();
    }
}

impl Default for PulseEvent {
    fn default() -> Self {
        PulseEvent::new()
    }
}

/// Spawn a named stack task.
pub fn spawn_task<F>(name: &str, body: F) -> thread::JoinHandle<()>
where
    F: FnOnce() + Send + 'static,
{
    thread::Builder::new()
        .name(name.to_owned())
        .spawn(body)
        .expect("task spawn")
}

/// Sleep until the given absolute time. Returns immediately if it already
/// passed.
pub fn sleep_until(deadline: Instant) {
    let left = Instant::now().nanos_until(deadline);
    if left != Duration::ZERO {
        thread::sleep(left.into());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn sem_counts_signals() {
        let sem = RtSem::new(0);
        sem.signal();
        sem.signal();
        assert_eq!(sem.wait(None), WaitOutcome::Signaled);
        assert_eq!(sem.try_wait(), WaitOutcome::Signaled);
        assert_eq!(sem.try_wait(), WaitOutcome::TimedOut);
    }

    #[test]
    fn sem_times_out() {
        let sem = RtSem::new(0);
        assert_eq!(
            sem.wait(Some(Duration::from_millis(5))),
            WaitOutcome::TimedOut
        );
    }

    #[test]
    fn sem_close_wakes_waiter() {
        let sem = Arc::new(RtSem::new(0));
        let waiter = {
            let sem = sem.clone();
            spawn_task("sem-close", move || {
                assert_eq!(sem.wait(None), WaitOutcome::Closed);
            })
        };
        std::thread::sleep(std::time::Duration::from_millis(10));
        sem.close();
        waiter.join().unwrap();
    }

    #[test]
    fn pulse_wakes_all_waiters() {
        let event = Arc::new(PulseEvent::new());
        let waiters: Vec<_> = (0..3)
            .map(|i| {
                let event = event.clone();
                spawn_task(&format!("pulse-{i}"), move || {
                    assert_eq!(event.wait_next(None), WaitOutcome::Signaled);
                })
            })
            .collect();
        std::thread::sleep(std::time::Duration::from_millis(10));
        event.pulse();
        for w in waiters {
            w.join().unwrap();
        }
    }

    #[test]
    fn event_is_auto_reset() {
        let event = RtEvent::new();
        event.signal();
        assert_eq!(event.wait(None), WaitOutcome::Signaled);
        assert_eq!(
            event.wait(Some(Duration::from_millis(1))),
            WaitOutcome::TimedOut
        );
    }
}
