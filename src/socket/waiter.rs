//! The background connect waiter.
//!
//! When a stream connect finds every instance of the peer's pipe busy, a
//! worker thread takes over: it waits for an instance to appear, races the
//! other waiters to open it, and publishes the outcome into the socket's
//! error word and connect state. A non-blocking connect returns
//! `EINPROGRESS` and lets the worker run; a blocking connect parks on the
//! worker's completion event. The worker owns a private copy of the pipe
//! name and a termination event, so dropping the socket can always cancel
//! and join it exactly once.

use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;
use std::time::Instant;

use nix::errno::Errno;

use crate::pipe::{device, PipeStatus, PipeWait};
use crate::util::sync::Event;

use super::{ConnectState, Shared, CONNECT_TIMEOUT};

pub(crate) struct ConnectWaiter {
    thread: Option<std::thread::JoinHandle<()>>,
    pub(crate) termination: Event,
    pub(crate) done: Event,
    pub(crate) error: Arc<AtomicI32>,
}

impl ConnectWaiter {
    /// Start the worker. `pipe_name` is copied into the worker's own
    /// context; it never borrows from the caller.
    pub fn spawn(shared: Arc<Shared>, pipe_name: String) -> Result<Self, Errno> {
        let termination = Event::new();
        let done = Event::new();
        let error = Arc::new(AtomicI32::new(0));
        let thread = {
            let termination = termination.clone();
            let done = done.clone();
            let error = Arc::clone(&error);
            std::thread::Builder::new()
                .name("connect-waiter".into())
                .spawn(move || {
                    let err = wait_pipe_loop(&shared, &pipe_name, &termination);
                    publish_outcome(&shared, err);
                    error.store(err, Ordering::SeqCst);
                    done.set();
                })
                .map_err(|e| {
                    e.raw_os_error()
                        .map(Errno::from_i32)
                        .unwrap_or(Errno::EAGAIN)
                })?
        };
        Ok(Self {
            thread: Some(thread),
            termination,
            done,
            error,
        })
    }

    /// Signal the termination event and join the worker.
    pub fn shutdown(mut self) {
        self.stop();
    }

    /// Forget the worker without joining: only valid in a forked child,
    /// where the thread does not exist.
    pub fn abandon(mut self) {
        self.thread.take();
    }

    fn stop(&mut self) {
        self.termination.set();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for ConnectWaiter {
    fn drop(&mut self) {
        self.stop();
    }
}

/// The worker loop: wait for an instance of the peer pipe within the
/// connect budget, racing other waiters for it. Returns the errno value of
/// the outcome, 0 on success.
fn wait_pipe_loop(shared: &Arc<Shared>, pipe_name: &str, termination: &Event) -> i32 {
    let mut remaining = CONNECT_TIMEOUT;
    loop {
        let stamp = Instant::now();
        match device().wait_for_instance(pipe_name, remaining, &[termination]) {
            PipeWait::Complete(PipeStatus::Success) => {
                let status = shared.open_pipe(pipe_name);
                if status.no_instance_available() {
                    // another waiter won the race; charge the time spent and
                    // go back to waiting unless the budget ran out
                    let elapsed = stamp.elapsed();
                    if elapsed >= remaining {
                        return Errno::ETIMEDOUT as i32;
                    }
                    remaining -= elapsed;
                    continue;
                }
                if status.is_success() {
                    return 0;
                }
                return status.to_errno() as i32;
            }
            PipeWait::Complete(PipeStatus::ObjectNameNotFound) => {
                return Errno::EADDRNOTAVAIL as i32;
            }
            PipeWait::Complete(PipeStatus::InsufficientResources) => {
                return Errno::ENOBUFS as i32;
            }
            PipeWait::TimedOut => return Errno::ETIMEDOUT as i32,
            PipeWait::Cancelled(_) => return Errno::EINTR as i32,
            PipeWait::Complete(_) => return Errno::EIO as i32,
        }
    }
}

/// Store the outcome where a later `SO_ERROR` read (or the parked connect)
/// finds it, and move the connect state on.
fn publish_outcome(shared: &Arc<Shared>, err: i32) {
    let mut conn = shared.conn.write().unwrap();
    shared.so_error.store(err, Ordering::SeqCst);
    conn.state = if err == 0 {
        ConnectState::Connected
    } else {
        ConnectState::ConnectFailed
    };
}
