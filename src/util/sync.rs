//! Manual-reset events and a combined wait.
//!
//! Every blocking operation in this crate parks on [`wait_any`]: a wait for
//! the first of several [`Event`]s to become set, bounded by an optional
//! deadline. Cancellation (worker termination, signal delivery) is just
//! another event in the set, so a single primitive covers "wait for data",
//! "wait for data or signal", and "wait for data, signal, or timeout".

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Instant;

/// A manual-reset event. Cheap to clone; all clones observe the same state.
///
/// Setting an event wakes every thread currently parked on it through
/// [`wait_any`]. The flag stays set until [`reset`](Self::reset) is called,
/// so a waiter that arrives after the set still completes immediately.
#[derive(Clone)]
pub struct Event {
    inner: Arc<EventInner>,
}

struct EventInner {
    set: AtomicBool,
    // Cells of threads currently parked on this event. Notified on set().
    waiters: Mutex<Vec<Arc<WaitCell>>>,
}

// One parked thread. The generation counter is bumped under the lock by
// every notifier, which closes the window between a waiter's flag check and
// its park: a set() that lands in between must acquire the cell lock first,
// and the waiter re-checks after every wakeup.
struct WaitCell {
    generation: Mutex<u64>,
    cond: Condvar,
}

impl Event {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(EventInner {
                set: AtomicBool::new(false),
                waiters: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn set(&self) {
        self.inner.set.store(true, Ordering::SeqCst);
        let waiters = self.inner.waiters.lock().unwrap();
        for cell in waiters.iter() {
            let mut generation = cell.generation.lock().unwrap();
            *generation += 1;
            cell.cond.notify_all();
        }
    }

    pub fn reset(&self) {
        self.inner.set.store(false, Ordering::SeqCst);
    }

    pub fn is_set(&self) -> bool {
        self.inner.set.load(Ordering::SeqCst)
    }

    fn register(&self, cell: &Arc<WaitCell>) {
        self.inner.waiters.lock().unwrap().push(Arc::clone(cell));
    }

    fn unregister(&self, cell: &Arc<WaitCell>) {
        self.inner
            .waiters
            .lock()
            .unwrap()
            .retain(|c| !Arc::ptr_eq(c, cell));
    }
}

impl Default for Event {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Event {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Event").field("set", &self.is_set()).finish()
    }
}

/// Outcome of a combined wait.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum WaitVerdict {
    /// The event at this index in the wait set was set first.
    Event(usize),
    /// The deadline passed before any event was set.
    TimedOut,
}

/// Wait until one of `events` is set or `deadline` passes.
///
/// Returns the index of the first set event found, scanning in order, so
/// earlier entries win ties. `deadline: None` waits forever.
pub fn wait_any(events: &[&Event], deadline: Option<Instant>) -> WaitVerdict {
    let cell = Arc::new(WaitCell {
        generation: Mutex::new(0),
        cond: Condvar::new(),
    });
    for event in events {
        event.register(&cell);
    }

    let verdict = wait_on_cell(&cell, events, deadline);

    for event in events {
        event.unregister(&cell);
    }
    verdict
}

fn wait_on_cell(cell: &Arc<WaitCell>, events: &[&Event], deadline: Option<Instant>) -> WaitVerdict {
    let mut generation = cell.generation.lock().unwrap();
    loop {
        if let Some(idx) = events.iter().position(|e| e.is_set()) {
            return WaitVerdict::Event(idx);
        }
        match deadline {
            None => {
                generation = cell.cond.wait(generation).unwrap();
            }
            Some(deadline) => {
                let Some(remaining) = deadline.checked_duration_since(Instant::now()) else {
                    return WaitVerdict::TimedOut;
                };
                let (guard, timeout) = cell.cond.wait_timeout(generation, remaining).unwrap();
                generation = guard;
                if timeout.timed_out() && events.iter().all(|e| !e.is_set()) {
                    return WaitVerdict::TimedOut;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn set_before_wait_completes_immediately() {
        let event = Event::new();
        event.set();
        assert_eq!(wait_any(&[&event], None), WaitVerdict::Event(0));
    }

    #[test]
    fn earlier_event_wins_ties() {
        let a = Event::new();
        let b = Event::new();
        a.set();
        b.set();
        assert_eq!(wait_any(&[&a, &b], None), WaitVerdict::Event(0));
        assert_eq!(wait_any(&[&b, &a], None), WaitVerdict::Event(0));
    }

    #[test]
    fn deadline_expires_without_set() {
        let event = Event::new();
        let deadline = Instant::now() + Duration::from_millis(20);
        assert_eq!(wait_any(&[&event], Some(deadline)), WaitVerdict::TimedOut);
    }

    #[test]
    fn set_from_other_thread_wakes_waiter() {
        let event = Event::new();
        let setter = {
            let event = event.clone();
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(20));
                event.set();
            })
        };
        let deadline = Instant::now() + Duration::from_secs(5);
        assert_eq!(wait_any(&[&event], Some(deadline)), WaitVerdict::Event(0));
        setter.join().unwrap();
    }

    #[test]
    fn reset_clears_the_flag() {
        let event = Event::new();
        event.set();
        assert!(event.is_set());
        event.reset();
        assert!(!event.is_set());
        let deadline = Instant::now() + Duration::from_millis(20);
        assert_eq!(wait_any(&[&event], Some(deadline)), WaitVerdict::TimedOut);
    }
}
