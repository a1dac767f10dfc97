use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::Notify;

use crate::error::InferenceError;
use crate::types::CompletionEvent;

#[derive(Default)]
struct StreamState {
    queue: VecDeque<CompletionEvent>,
    outcome: Option<Result<String, InferenceError>>,
    closed: bool,
}

#[derive(Default)]
struct Shared {
    state: Mutex<StreamState>,
    changed: Notify,
}

impl Shared {
    fn state(&self) -> MutexGuard<'_, StreamState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Incremental view of one streaming completion: text deltas followed by a
/// single `Done` or `Error` event.
///
/// Clones share the same queue. The first terminal event closes the stream
/// for writers; events already queued stay readable through [`next`].
///
/// [`next`]: CompletionEventStream::next
#[derive(Clone, Default)]
pub struct CompletionEventStream {
    shared: Arc<Shared>,
}

impl CompletionEventStream {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_done(&self) -> bool {
        self.shared.state().closed
    }

    pub fn push(&self, event: CompletionEvent) {
        {
            let mut state = self.shared.state();
            if state.closed {
                return;
            }
            match &event {
                CompletionEvent::Done { text } => {
                    state.outcome = Some(Ok(text.clone()));
                    state.closed = true;
                }
                CompletionEvent::Error { error } => {
                    state.outcome = Some(Err(error.clone()));
                    state.closed = true;
                }
                CompletionEvent::Delta { .. } => {}
            }
            state.queue.push_back(event);
        }
        self.shared.changed.notify_waiters();
    }

    /// Closes the stream without a terminal event. `result` is recorded as
    /// the outcome when given.
    pub fn end(&self, result: Option<Result<String, InferenceError>>) {
        {
            let mut state = self.shared.state();
            if state.closed {
                return;
            }
            state.outcome = result;
            state.closed = true;
        }
        self.shared.changed.notify_waiters();
    }

    /// Next queued event, or `None` once the stream is closed and drained.
    pub async fn next(&self) -> Option<CompletionEvent> {
        loop {
            let notified = self.shared.changed.notified();
            {
                let mut state = self.shared.state();
                if let Some(event) = state.queue.pop_front() {
                    return Some(event);
                }
                if state.closed {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// Full response text, or the error that ended the stream.
    pub async fn result(&self) -> Result<String, InferenceError> {
        loop {
            let notified = self.shared.changed.notified();
            {
                let state = self.shared.state();
                if state.closed {
                    return state.outcome.clone().unwrap_or_else(|| {
                        Err(InferenceError::protocol(
                            "stream ended without terminal event",
                        ))
                    });
                }
            }
            notified.await;
        }
    }
}
