//! Single-pending-value write coalescer
//!
//! `SlotWriter` holds at most one queued write per target. Enqueueing while
//! a write is already queued resolves the displaced write's promise as
//! preempted (distinguishing same-value from different-value preemption)
//! and replaces it. An optional debounce window delays dispatch; later
//! enqueues push the deadline forward, so within the window only the last
//! value is ever transmitted.
//!
//! One worker task drains the slot; it is started lazily on the first
//! submit and exits when the slot is empty after a dispatch.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Terminal result of one submitted write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    Completed,
    /// Displaced by a later write carrying a different value
    Preempted,
    /// Displaced by a later write carrying the same value
    PreemptedWithSameValue,
    /// The write's own cancellation signal fired
    Cancelled,
    /// The owning writer was disposed
    CancelledViaDispose,
    Failed,
}

/// Dispatch failure classification reported back by the sink.
#[derive(Debug, Clone, thiserror::Error)]
pub enum SlotError {
    #[error("dispatch canceled")]
    Canceled,
    #[error("dispatch failed: {0}")]
    Failed(String),
}

/// The sink a `SlotWriter` drains into, typically a network pid write.
#[async_trait]
pub trait SlotDispatch<T>: Send + Sync + 'static {
    async fn dispatch(&self, value: T, cancel: &CancellationToken) -> Result<(), SlotError>;
}

struct PendingWrite<T> {
    value: T,
    cancel: CancellationToken,
    tx: oneshot::Sender<WriteOutcome>,
}

struct SlotState<T> {
    queued: Option<PendingWrite<T>>,
    /// Dispatch-not-before time; pushed forward by each enqueue
    deadline: Instant,
    writing: bool,
    disposed: bool,
}

struct SlotInner<T> {
    state: Mutex<SlotState<T>>,
    shutdown: CancellationToken,
    debounce: Duration,
    tag: &'static str,
}

/// Awaitable handle for one submitted write.
pub struct PendingOutcome {
    rx: oneshot::Receiver<WriteOutcome>,
}

impl PendingOutcome {
    /// Resolve the write's terminal outcome. Never hangs: dispose resolves
    /// every pending promise.
    pub async fn outcome(self) -> WriteOutcome {
        // A dropped sender can only mean the writer went away mid-teardown.
        self.rx.await.unwrap_or(WriteOutcome::CancelledViaDispose)
    }

    fn resolved(outcome: WriteOutcome) -> Self {
        let (tx, rx) = oneshot::channel();
        let _ = tx.send(outcome);
        Self { rx }
    }
}

pub struct SlotWriter<T> {
    inner: Arc<SlotInner<T>>,
    dispatch: Arc<dyn SlotDispatch<T>>,
}

impl<T> SlotWriter<T>
where
    T: Clone + PartialEq + Send + 'static,
{
    /// `debounce` of zero dispatches as soon as the worker picks the slot up.
    pub fn new(tag: &'static str, debounce: Duration, dispatch: Arc<dyn SlotDispatch<T>>) -> Self {
        Self {
            inner: Arc::new(SlotInner {
                state: Mutex::new(SlotState {
                    queued: None,
                    deadline: Instant::now(),
                    writing: false,
                    disposed: false,
                }),
                shutdown: CancellationToken::new(),
                debounce,
                tag,
            }),
            dispatch,
        }
    }

    /// Queue `value`, displacing any not-yet-dispatched predecessor.
    pub fn submit(&self, value: T, cancel: CancellationToken) -> PendingOutcome {
        let (tx, rx) = oneshot::channel();
        let mut state = self.inner.state.lock();
        if state.disposed || self.inner.shutdown.is_cancelled() {
            return PendingOutcome::resolved(WriteOutcome::CancelledViaDispose);
        }
        if let Some(displaced) = state.queued.take() {
            let outcome = if displaced.value == value {
                WriteOutcome::PreemptedWithSameValue
            } else {
                WriteOutcome::Preempted
            };
            debug!(tag = self.inner.tag, ?outcome, "queued write displaced");
            let _ = displaced.tx.send(outcome);
        }
        state.queued = Some(PendingWrite { value, cancel, tx });
        state.deadline = Instant::now() + self.inner.debounce;
        if !state.writing {
            state.writing = true;
            tokio::spawn(Self::run(self.inner.clone(), self.dispatch.clone()));
        }
        drop(state);
        PendingOutcome { rx }
    }

    /// True from worker start until the slot drains.
    pub fn is_writing(&self) -> bool {
        self.inner.state.lock().writing
    }

    /// Cancel the internal signal and resolve anything still pending as
    /// `CancelledViaDispose`.
    pub fn dispose(&self) {
        self.inner.shutdown.cancel();
        let mut state = self.inner.state.lock();
        state.disposed = true;
        if let Some(pending) = state.queued.take() {
            let _ = pending.tx.send(WriteOutcome::CancelledViaDispose);
        }
    }

    pub fn is_disposed(&self) -> bool {
        self.inner.state.lock().disposed
    }

    async fn run(inner: Arc<SlotInner<T>>, dispatch: Arc<dyn SlotDispatch<T>>) {
        loop {
            // Debounce wait: sleep until the deadline, restarting whenever a
            // fresh enqueue moves it. The queued write can only be removed
            // by this loop or by dispose.
            let pending = loop {
                let (deadline, pending_cancel) = {
                    let state = inner.state.lock();
                    match state.queued.as_ref() {
                        Some(p) => (state.deadline, p.cancel.clone()),
                        None => {
                            // Disposed (or drained) out from under us.
                            let mut state = state;
                            state.writing = false;
                            return;
                        }
                    }
                };
                if Instant::now() >= deadline {
                    let mut state = inner.state.lock();
                    if Instant::now() >= state.deadline {
                        match state.queued.take() {
                            Some(p) => break p,
                            None => {
                                state.writing = false;
                                return;
                            }
                        }
                    }
                    continue;
                }
                tokio::select! {
                    _ = inner.shutdown.cancelled() => {
                        let mut state = inner.state.lock();
                        if let Some(p) = state.queued.take() {
                            let _ = p.tx.send(WriteOutcome::CancelledViaDispose);
                        }
                        state.writing = false;
                        return;
                    }
                    _ = pending_cancel.cancelled() => {
                        let mut state = inner.state.lock();
                        // The slot may already hold a different, live write.
                        if state
                            .queued
                            .as_ref()
                            .map(|p| p.cancel.is_cancelled())
                            .unwrap_or(false)
                        {
                            let p = state.queued.take().expect("checked above");
                            let _ = p.tx.send(WriteOutcome::Cancelled);
                        }
                        if state.queued.is_none() {
                            state.writing = false;
                            return;
                        }
                    }
                    _ = tokio::time::sleep_until(deadline) => {}
                }
            };

            let outcome = if inner.shutdown.is_cancelled() {
                WriteOutcome::CancelledViaDispose
            } else if pending.cancel.is_cancelled() {
                WriteOutcome::Cancelled
            } else {
                match dispatch.dispatch(pending.value.clone(), &pending.cancel).await {
                    Ok(()) => WriteOutcome::Completed,
                    Err(SlotError::Canceled) => {
                        if inner.shutdown.is_cancelled() {
                            WriteOutcome::CancelledViaDispose
                        } else {
                            WriteOutcome::Cancelled
                        }
                    }
                    Err(SlotError::Failed(message)) => {
                        debug!(tag = inner.tag, %message, "slot dispatch failed");
                        WriteOutcome::Failed
                    }
                }
            };
            let _ = pending.tx.send(outcome);

            let mut state = inner.state.lock();
            if state.queued.is_none() {
                state.writing = false;
                return;
            }
        }
    }
}
