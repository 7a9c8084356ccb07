//! Single-writer lock scheduler.
//!
//! A [`Combiner`] owns some state and a FIFO of actions against it. The first
//! caller to find it idle becomes the active actor and drains the queue;
//! everyone else appends and returns immediately. Work that must not run
//! under the state lock (endpoint I/O, application callbacks) is returned by
//! [`Actor::quiesce`] and run while the actor still owns the combiner, so any
//! re-entrant call lands in the queue instead of recursing.

use parking_lot::Mutex;
use std::collections::VecDeque;

/// An action against the combined state.
pub type Action<S> = Box<dyn FnOnce(&mut S) + Send>;

/// Work to run outside the state lock.
pub type Deferred = Box<dyn FnOnce() + Send>;

/// State driven by a [`Combiner`].
pub trait Actor: Send + 'static {
    /// Called under the lock each time the queue runs dry. Returns the
    /// deferred work collected by the actions.
    fn quiesce(&mut self) -> Vec<Deferred>;
}

struct Queue<S> {
    actions: VecDeque<Action<S>>,
    active: bool,
}

pub struct Combiner<S> {
    queue: Mutex<Queue<S>>,
    state: Mutex<S>,
}

impl<S: Actor> Combiner<S> {
    pub fn new(state: S) -> Self {
        Self {
            queue: Mutex::new(Queue {
                actions: VecDeque::new(),
                active: false,
            }),
            state: Mutex::new(state),
        }
    }

    /// Run `action` now if idle, otherwise queue it behind the active actor.
    pub fn run(&self, action: Action<S>) {
        {
            let mut queue = self.queue.lock();
            if queue.active {
                queue.actions.push_back(action);
                return;
            }
            queue.active = true;
        }

        let mut next = Some(action);
        loop {
            let deferred = {
                let mut state = self.state.lock();
                while let Some(action) = next.take() {
                    action(&mut state);
                    next = self.queue.lock().actions.pop_front();
                }
                state.quiesce()
            };

            for work in deferred {
                work();
            }

            let mut queue = self.queue.lock();
            match queue.actions.pop_front() {
                Some(action) => next = Some(action),
                None => {
                    queue.active = false;
                    return;
                }
            }
        }
    }

    /// Read or mutate the state directly.
    ///
    /// Only for short in-memory operations from outside any action: the state
    /// lock is not re-entrant.
    pub fn with_state<R>(&self, f: impl FnOnce(&mut S) -> R) -> R {
        f(&mut self.state.lock())
    }
}
