//! Interfaces consumed from the I/O layer.

use crate::barrier::Callback;
use bytes::Bytes;
use std::io;
use std::thread;
use std::time::Instant;

/// A duplex byte channel with completion-based reads and writes.
///
/// Completions may be invoked synchronously from inside `read`/`write` or
/// later from any thread.
pub trait Endpoint: Send + Sync + 'static {
    /// Read whatever is available. An empty buffer means end of stream.
    fn read(&self, on_done: Callback<io::Result<Bytes>>);

    /// Write all of `buffers` in order.
    fn write(&self, buffers: Vec<Bytes>, on_done: Callback<io::Result<()>>);

    /// Stop the channel. Pending reads complete with an error.
    fn shutdown(&self);

    fn peer(&self) -> String;
}

/// Work handed to a [`Scheduler`].
pub type Task = Box<dyn FnOnce() + Send>;

/// Runs closures outside the caller's stack.
pub trait Scheduler: Send + Sync + 'static {
    /// Run `task` soon, after the caller returns if possible.
    fn run_later(&self, task: Task);

    /// Run `task` no earlier than `deadline`.
    fn run_at(&self, deadline: Instant, task: Task);
}

/// Runs deferred tasks immediately and timers on a sleeping thread.
#[derive(Debug, Default, Clone, Copy)]
pub struct InlineScheduler;

impl Scheduler for InlineScheduler {
    fn run_later(&self, task: Task) {
        task();
    }

    fn run_at(&self, deadline: Instant, task: Task) {
        thread::spawn(move || {
            let now = Instant::now();
            if deadline > now {
                thread::sleep(deadline - now);
            }
            task();
        });
    }
}
