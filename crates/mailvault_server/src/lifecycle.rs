//! Start/stop state for background tasks.

use parking_lot::Mutex;
use std::future::Future;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

enum State {
    NotStarted,
    Running {
        cancel: CancellationToken,
        handle: JoinHandle<()>,
    },
    Stopped,
}

/// Owns one background task: `NotStarted -> Running -> Stopped`.
///
/// Stopped is terminal. Starting twice or stopping twice is a no-op.
pub(crate) struct Lifecycle {
    name: &'static str,
    state: Mutex<State>,
}

impl Lifecycle {
    pub(crate) fn new(name: &'static str) -> Self {
        Self {
            name,
            state: Mutex::new(State::NotStarted),
        }
    }

    /// Spawns `task` on the current tokio runtime. Returns false if the task
    /// was already started or stopped.
    pub(crate) fn start<F, Fut>(&self, task: F) -> bool
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut state = self.state.lock();
        if !matches!(*state, State::NotStarted) {
            tracing::debug!(task = self.name, "already started");
            return false;
        }
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(task(cancel.clone()));
        *state = State::Running { cancel, handle };
        tracing::debug!(task = self.name, "started");
        true
    }

    /// Cancels the task. Does not wait for it; the handle is returned for
    /// callers that want to.
    pub(crate) fn stop(&self) -> Option<JoinHandle<()>> {
        let previous = std::mem::replace(&mut *self.state.lock(), State::Stopped);
        match previous {
            State::Running { cancel, handle } => {
                cancel.cancel();
                tracing::debug!(task = self.name, "stopped");
                Some(handle)
            }
            _ => None,
        }
    }

    pub(crate) fn is_running(&self) -> bool {
        matches!(*self.state.lock(), State::Running { .. })
    }
}

impl Drop for Lifecycle {
    fn drop(&mut self) {
        if let State::Running { cancel, .. } = self.state.get_mut() {
            cancel.cancel();
        }
    }
}
