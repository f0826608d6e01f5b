// ── Asynchronous operation handles ──
//
// Every network-facing call returns an `Operation<T>`: a cloneable
// handle to one in-flight unit of work with a single result slot. The
// slot is written exactly once (first writer wins), after which the
// handle is immutable. Listeners run outside the slot lock, in
// registration order; a listener attached after settlement runs
// immediately on the caller's thread.

use std::fmt;
use std::future::{Future, IntoFuture};
use std::pin::Pin;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use strum::Display;
use tokio::sync::{Semaphore, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::trace;
use uuid::Uuid;

use crate::error::CoreError;

/// Lifecycle of an operation. Everything but `Pending` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
pub enum OperationState {
    Pending,
    Completed,
    Failed,
    TimedOut,
    Cancelled,
}

impl OperationState {
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Pending)
    }

    fn of<T>(result: &Result<T, CoreError>) -> Self {
        match result {
            Ok(_) => Self::Completed,
            Err(CoreError::Cancelled) => Self::Cancelled,
            Err(CoreError::Timeout { .. }) => Self::TimedOut,
            Err(_) => Self::Failed,
        }
    }
}

type Outcome<T> = Arc<Result<T, CoreError>>;

enum Listener<T> {
    Success(Box<dyn FnOnce(&T) + Send>),
    Failure(Box<dyn FnOnce(&CoreError) + Send>),
    Cancel(Box<dyn FnOnce() + Send>),
    Settled(Box<dyn FnOnce(OperationState) + Send>),
}

impl<T> Listener<T> {
    fn fire(self, state: OperationState, outcome: &Result<T, CoreError>) {
        match (self, outcome) {
            (Self::Success(f), Ok(value)) => f(value),
            (Self::Failure(f), Err(err)) if state != OperationState::Cancelled => f(err),
            (Self::Cancel(f), _) if state == OperationState::Cancelled => f(),
            (Self::Settled(f), _) => f(state),
            _ => {}
        }
    }
}

struct Slot<T> {
    state: OperationState,
    outcome: Option<Outcome<T>>,
    listeners: Vec<Listener<T>>,
}

struct Shared<T> {
    id: Uuid,
    label: String,
    dispatched_at: Instant,
    deadline: Instant,
    slot: Mutex<Slot<T>>,
    settled: Condvar,
    state_tx: watch::Sender<OperationState>,
    cancel: CancellationToken,
}

impl<T> Shared<T> {
    fn lock(&self) -> MutexGuard<'_, Slot<T>> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Handle to one dispatched unit of work.
///
/// Cloning yields another handle to the same operation.
pub struct Operation<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for Operation<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T> Operation<T> {
    pub fn state(&self) -> OperationState {
        self.shared.lock().state
    }
}

impl<T> fmt::Debug for Operation<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Operation")
            .field("id", &self.shared.id)
            .field("label", &self.shared.label)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl<T: Send + Sync + 'static> Operation<T> {
    /// A pending operation whose deadline is `timeout` from now.
    pub(crate) fn new(label: impl Into<String>, timeout: Duration) -> Self {
        let dispatched_at = Instant::now();
        let (state_tx, _) = watch::channel(OperationState::Pending);
        Self {
            shared: Arc::new(Shared {
                id: Uuid::new_v4(),
                label: label.into(),
                dispatched_at,
                deadline: dispatched_at + timeout,
                slot: Mutex::new(Slot {
                    state: OperationState::Pending,
                    outcome: None,
                    listeners: Vec::new(),
                }),
                settled: Condvar::new(),
                state_tx,
                cancel: CancellationToken::new(),
            }),
        }
    }

    /// An operation that is already settled. Needs no runtime.
    pub(crate) fn ready(label: impl Into<String>, result: Result<T, CoreError>) -> Self {
        let op = Self::new(label, Duration::ZERO);
        op.settle(result);
        op
    }

    pub fn id(&self) -> Uuid {
        self.shared.id
    }

    pub fn label(&self) -> &str {
        &self.shared.label
    }

    pub fn is_finished(&self) -> bool {
        self.state().is_terminal()
    }

    pub fn dispatched_at(&self) -> Instant {
        self.shared.dispatched_at
    }

    pub fn deadline(&self) -> Instant {
        self.shared.deadline
    }

    /// The settled outcome, or `None` while pending.
    pub fn outcome(&self) -> Option<Outcome<T>> {
        self.shared.lock().outcome.clone()
    }

    // ── Listeners ────────────────────────────────────────────────────

    /// Run `f` with the value on success. Never runs on failure or cancellation.
    pub fn on_success<F>(&self, f: F) -> &Self
    where
        F: FnOnce(&T) + Send + 'static,
    {
        self.listen(Listener::Success(Box::new(f)))
    }

    /// Run `f` with the error on failure or timeout. Never runs on cancellation.
    pub fn on_failure<F>(&self, f: F) -> &Self
    where
        F: FnOnce(&CoreError) + Send + 'static,
    {
        self.listen(Listener::Failure(Box::new(f)))
    }

    /// Run `f` if the operation is cancelled.
    pub fn on_cancel<F>(&self, f: F) -> &Self
    where
        F: FnOnce() + Send + 'static,
    {
        self.listen(Listener::Cancel(Box::new(f)))
    }

    /// Run `f` on any terminal state.
    pub(crate) fn on_settled<F>(&self, f: F) -> &Self
    where
        F: FnOnce(OperationState) + Send + 'static,
    {
        self.listen(Listener::Settled(Box::new(f)))
    }

    fn listen(&self, listener: Listener<T>) -> &Self {
        let (state, outcome) = {
            let mut slot = self.shared.lock();
            let Some(outcome) = slot.outcome.clone() else {
                slot.listeners.push(listener);
                return self;
            };
            (slot.state, outcome)
        };
        listener.fire(state, &outcome);
        self
    }

    // ── Settlement ───────────────────────────────────────────────────

    /// Cancel the operation. Returns `true` if this call settled it.
    ///
    /// The in-flight future is dropped, which aborts any HTTP request or
    /// LAN exchange it was awaiting. Whether the remote side already
    /// applied the effect is unknown.
    pub fn cancel(&self) -> bool {
        let settled = self.settle(Err(CoreError::Cancelled));
        self.shared.cancel.cancel();
        settled
    }

    /// Write the result slot. First writer wins; returns `false` if the
    /// operation had already settled.
    pub(crate) fn settle(&self, result: Result<T, CoreError>) -> bool {
        let state = OperationState::of(&result);
        let (listeners, outcome) = {
            let mut slot = self.shared.lock();
            if slot.state.is_terminal() {
                return false;
            }
            let outcome = Arc::new(result);
            slot.state = state;
            slot.outcome = Some(Arc::clone(&outcome));
            (std::mem::take(&mut slot.listeners), outcome)
        };

        trace!(op = %self.shared.id, label = %self.shared.label, %state, "operation settled");
        self.shared.settled.notify_all();
        self.shared.state_tx.send_replace(state);

        for listener in listeners {
            listener.fire(state, &outcome);
        }
        true
    }

    /// Spawn `work` onto the runtime, bounded by the deadline and by
    /// `limiter` (the worker pool). Time spent waiting for a permit
    /// counts against the deadline.
    pub(crate) fn run<F>(&self, limiter: Option<Arc<Semaphore>>, work: F)
    where
        F: Future<Output = Result<T, CoreError>> + Send + 'static,
    {
        let op = self.clone();
        let cancel = self.shared.cancel.clone();
        let deadline = self.shared.deadline;
        let timeout_ms = millis(deadline.saturating_duration_since(self.shared.dispatched_at));

        tokio::spawn(async move {
            let bounded = async move {
                let _permit = match limiter {
                    Some(pool) => Some(
                        pool.acquire_owned()
                            .await
                            .map_err(|_| CoreError::SessionClosed)?,
                    ),
                    None => None,
                };
                work.await
            };

            tokio::select! {
                biased;
                () = cancel.cancelled() => {}
                res = tokio::time::timeout_at(deadline, bounded) => {
                    op.settle(res.unwrap_or(Err(CoreError::Timeout { timeout_ms })));
                }
            }
        });
    }

    // ── Waiting ──────────────────────────────────────────────────────

    async fn settled(&self) -> Option<Outcome<T>> {
        let mut rx = self.shared.state_tx.subscribe();
        rx.wait_for(|s| s.is_terminal()).await.ok()?;
        self.outcome()
    }

    /// Wait for the outcome with no caller-side bound beyond the
    /// operation's own deadline.
    pub async fn result(&self) -> Result<T, CoreError>
    where
        T: Clone,
    {
        match self.settled().await {
            Some(outcome) => (*outcome).clone(),
            None => Err(CoreError::Cancelled),
        }
    }

    /// Wait at most until `timeout` after dispatch.
    ///
    /// Returns `Timeout` if the operation is still pending then; the
    /// operation itself keeps running until its own deadline or `cancel()`.
    pub async fn wait(&self, timeout: Duration) -> Result<T, CoreError>
    where
        T: Clone,
    {
        let deadline = self.shared.dispatched_at + timeout;
        match tokio::time::timeout_at(deadline, self.result()).await {
            Ok(result) => result,
            Err(_) => Err(CoreError::Timeout {
                timeout_ms: millis(timeout),
            }),
        }
    }

    /// Blocking form of [`wait`](Self::wait) for callers on plain threads.
    ///
    /// Must not be called from inside an async task.
    pub fn wait_blocking(&self, timeout: Duration) -> Result<T, CoreError>
    where
        T: Clone,
    {
        let remaining = (self.shared.dispatched_at + timeout).saturating_duration_since(Instant::now());
        let slot = self.shared.lock();
        let (slot, _) = self
            .shared
            .settled
            .wait_timeout_while(slot, remaining, |s| !s.state.is_terminal())
            .unwrap_or_else(PoisonError::into_inner);
        match &slot.outcome {
            Some(outcome) => (**outcome).clone(),
            None => Err(CoreError::Timeout {
                timeout_ms: millis(timeout),
            }),
        }
    }
}

impl<T: Clone + Send + Sync + 'static> IntoFuture for Operation<T> {
    type Output = Result<T, CoreError>;
    type IntoFuture = Pin<Box<dyn Future<Output = Self::Output> + Send>>;

    fn into_future(self) -> Self::IntoFuture {
        Box::pin(async move { self.result().await })
    }
}

fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};

    use super::*;
    use crate::error::ErrorKind;

    fn recorder() -> (Arc<Mutex<Vec<String>>>, impl Fn(&str) + Clone) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&log);
        (log, move |s: &str| sink.lock().unwrap().push(s.to_owned()))
    }

    #[tokio::test(start_paused = true)]
    async fn completes_and_fires_listeners_in_order() {
        let op: Operation<u32> = Operation::new("test", Duration::from_secs(5));
        let (log, push) = recorder();
        let (p1, p2, p3) = (push.clone(), push.clone(), push);
        op.on_success(move |v| p1(&format!("first {v}")))
            .on_failure(move |_| p2("failure"))
            .on_success(move |v| p3(&format!("second {v}")));

        op.run(None, async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            Ok(7)
        });

        assert_eq!(op.clone().await.unwrap(), 7);
        assert_eq!(op.state(), OperationState::Completed);
        assert_eq!(*log.lock().unwrap(), vec!["first 7", "second 7"]);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_wins_over_completion_and_drops_work() {
        struct Flag(Arc<AtomicBool>);
        impl Drop for Flag {
            fn drop(&mut self) {
                self.0.store(true, Ordering::SeqCst);
            }
        }

        let dropped = Arc::new(AtomicBool::new(false));
        let op: Operation<u32> = Operation::new("test", Duration::from_secs(5));
        let (log, push) = recorder();
        let (p1, p2, p3) = (push.clone(), push.clone(), push);
        op.on_success(move |_| p1("success"))
            .on_failure(move |_| p2("failure"))
            .on_cancel(move || p3("cancel"));

        let flag = Flag(Arc::clone(&dropped));
        op.run(None, async move {
            let _flag = flag;
            tokio::time::sleep(Duration::from_secs(1)).await;
            Ok(1)
        });
        tokio::task::yield_now().await;

        assert!(op.cancel());
        assert!(!op.cancel());
        tokio::time::sleep(Duration::from_secs(2)).await;

        assert_eq!(op.state(), OperationState::Cancelled);
        assert_eq!(op.result().await.unwrap_err().kind(), ErrorKind::Cancelled);
        assert_eq!(*log.lock().unwrap(), vec!["cancel"]);
        assert!(dropped.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_times_out() {
        let op: Operation<u32> = Operation::new("slow", Duration::from_millis(100));
        let (log, push) = recorder();
        op.on_failure(move |e| push(&e.kind().to_string()));

        op.run(None, async {
            tokio::time::sleep(Duration::from_secs(10)).await;
            Ok(1)
        });

        let err = op.result().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Timeout);
        assert_eq!(op.state(), OperationState::TimedOut);
        assert_eq!(*log.lock().unwrap(), vec!["Timeout"]);
    }

    #[tokio::test(start_paused = true)]
    async fn late_listener_runs_immediately() {
        let op = Operation::ready("done", Ok(3_u32));
        let (log, push) = recorder();
        op.on_success(move |v| push(&v.to_string()));
        assert_eq!(*log.lock().unwrap(), vec!["3"]);
    }

    #[test]
    fn ready_failure_needs_no_runtime() {
        let op: Operation<()> = Operation::ready(
            "rejected",
            Err(CoreError::WriteInProgress {
                dsn: "A".into(),
                property: "p".into(),
            }),
        );
        assert_eq!(op.state(), OperationState::Failed);
        assert!(!op.cancel());
        assert_eq!(op.state(), OperationState::Failed);
    }

    #[tokio::test(start_paused = true)]
    async fn wait_budget_counts_from_dispatch() {
        let op: Operation<u32> = Operation::new("slow", Duration::from_secs(10));
        op.run(None, async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(1)
        });

        tokio::time::sleep(Duration::from_millis(80)).await;
        let started = Instant::now();
        let err = op.wait(Duration::from_millis(100)).await.unwrap_err();

        assert_eq!(err.kind(), ErrorKind::Timeout);
        assert_eq!(started.elapsed(), Duration::from_millis(20));
        assert_eq!(op.state(), OperationState::Pending);
    }

    #[tokio::test(start_paused = true)]
    async fn worker_pool_queues_excess_work() {
        let pool = Arc::new(Semaphore::new(1));
        let first: Operation<u32> = Operation::new("a", Duration::from_secs(10));
        let second: Operation<u32> = Operation::new("b", Duration::from_secs(10));
        for op in [&first, &second] {
            op.run(Some(Arc::clone(&pool)), async {
                tokio::time::sleep(Duration::from_secs(1)).await;
                Ok(1)
            });
        }

        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert_eq!(first.state(), OperationState::Completed);
        assert_eq!(second.state(), OperationState::Pending);

        second.result().await.unwrap();
    }

    #[test]
    fn wait_blocking_from_plain_thread() {
        let rt = tokio::runtime::Builder::new_multi_thread()
            .enable_time()
            .build()
            .unwrap();
        let op: Operation<u32> = Operation::new("bg", Duration::from_secs(5));
        let worker = op.clone();
        rt.spawn(async move {
            worker.run(None, async {
                tokio::time::sleep(Duration::from_millis(20)).await;
                Ok(42)
            });
        });

        assert_eq!(op.wait_blocking(Duration::from_secs(5)).unwrap(), 42);
    }

    #[test]
    fn debug_shows_label_and_state() {
        let op: Operation<u32> = Operation::ready("done", Ok(1));
        let rendered = format!("{op:?}");
        assert!(rendered.contains("\"done\""), "{rendered}");
        assert!(rendered.contains("Completed"), "{rendered}");
    }
}
