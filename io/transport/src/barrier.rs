//! Completion gate shared by the sub-operations of one API call.

use crate::error::Error;
use parking_lot::Mutex;
use std::sync::Arc;

/// Callback invoked once with the outcome of an operation.
pub type Callback<T> = Box<dyn FnOnce(T) + Send>;

/// Fires its callback once every registered sub-operation has completed.
///
/// The count starts at one, held by whoever builds the barrier; that holder
/// calls [`complete`](Self::complete) once it has registered everything.
/// Errors from any completion are merged into the result.
#[derive(Clone)]
pub struct ClosureBarrier {
    inner: Arc<Mutex<BarrierState>>,
}

struct BarrierState {
    count: usize,
    errors: Vec<Error>,
    closure: Option<Callback<Result<(), Error>>>,
}

impl ClosureBarrier {
    pub fn new(closure: Callback<Result<(), Error>>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(BarrierState {
                count: 1,
                errors: Vec::new(),
                closure: Some(closure),
            })),
        }
    }

    /// Barrier that ignores its result.
    pub fn noop() -> Self {
        Self::new(Box::new(|_| {}))
    }

    pub fn register(&self, n: usize) {
        self.inner.lock().count += n;
    }

    /// Count one completion. The last one runs the callback with the union
    /// of every error seen, outside the barrier's lock.
    pub fn complete(&self, result: Result<(), Error>) {
        let fire = {
            let mut state = self.inner.lock();
            if let Err(e) = result {
                state.errors.push(e);
            }
            state.count = state.count.saturating_sub(1);
            if state.count > 0 {
                return;
            }
            let errors = std::mem::take(&mut state.errors);
            state.closure.take().map(|closure| (closure, errors))
        };
        if let Some((closure, errors)) = fire {
            match Error::union("Multiple errors in one operation", errors) {
                Some(error) => closure(Err(error)),
                None => closure(Ok(())),
            }
        }
    }

    pub fn pending(&self) -> usize {
        self.inner.lock().count
    }
}

impl std::fmt::Debug for ClosureBarrier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClosureBarrier")
            .field("pending", &self.pending())
            .finish()
    }
}
