//! One-shot asynchronous operation with late-subscriber replay.
//!
//! Everything in the engine (negotiation, transport start, send, abort, hub
//! invocations) is represented as an [`Operation`]. An operation completes
//! at most once with a value, can be cancelled cooperatively, and carries an
//! error channel that is independent of completion: a streaming transport
//! whose start already succeeded still reports a broken stream through the
//! same operation.
//!
//! Subscribers frequently attach after the fact (a reconnect handler reads a
//! start operation that resolved while it was being registered), so every
//! channel replays its terminal event to late subscribers. Errors raised
//! before any error subscriber exists are queued and drained by the first
//! subscriber to attach, and only by the first.

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::time::{Duration, Instant};

use hubwire_shared::ClientError;

type DoneFn<T, E> = Box<dyn FnOnce(&T) -> Result<(), E> + Send>;
type ErrorFn<E> = Arc<dyn Fn(&E) + Send + Sync>;
type CancelFn = Box<dyn FnOnce() + Send>;

/// Anything that can be cancelled; used to propagate cancellation upstream
/// through chains of operations with different value types.
pub trait Cancellable: Send + Sync {
    fn cancel(&self);
}

/// Outcome of a blocking [`Operation::wait`].
#[derive(Debug, Clone, PartialEq)]
pub enum WaitError<E> {
    /// The operation was cancelled before completing.
    Cancelled,
    /// The wait deadline elapsed.
    TimedOut,
    /// The operation raised an error.
    Errored(E),
}

struct Inner<T, E> {
    done: bool,
    cancelled: bool,
    value: Option<T>,
    last_error: Option<E>,
    done_subs: Vec<DoneFn<T, E>>,
    cancel_subs: Vec<CancelFn>,
    error_subs: Vec<ErrorFn<E>>,
    queued_errors: VecDeque<E>,
    dependency: Option<Arc<dyn Cancellable>>,
}

impl<T, E> Default for Inner<T, E> {
    fn default() -> Self {
        Self {
            done: false,
            cancelled: false,
            value: None,
            last_error: None,
            done_subs: Vec::new(),
            cancel_subs: Vec::new(),
            error_subs: Vec::new(),
            queued_errors: VecDeque::new(),
            dependency: None,
        }
    }
}

/// A composable one-shot operation.
///
/// Completion (`set_result`) and cancellation are terminal and fire their
/// subscribers exactly once each; the error channel may fire any number of
/// times and also after completion. Subscribing after the fact replays the
/// stored value synchronously.
pub struct Operation<T, E = ClientError> {
    inner: Mutex<Inner<T, E>>,
    completed: Condvar,
}

impl<T, E> Operation<T, E>
where
    T: Clone + Send + 'static,
    E: Clone + Send + 'static,
{
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(Inner::default()),
            completed: Condvar::new(),
        })
    }

    /// An operation that is already done with `value`.
    pub fn completed(value: T) -> Arc<Self> {
        let op = Self::new();
        op.set_result(value);
        op
    }

    /// An operation that already failed with `error`. The error waits in the
    /// queue for the first error subscriber.
    pub fn failed(error: E) -> Arc<Self> {
        let op = Self::new();
        op.set_error(error);
        op
    }

    pub fn is_done(&self) -> bool {
        self.inner.lock().unwrap().done
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.lock().unwrap().cancelled
    }

    pub fn errored(&self) -> bool {
        self.inner.lock().unwrap().last_error.is_some()
    }

    /// Complete the operation. No-op if already done or cancelled; the first
    /// completion wins and the stored value never changes afterwards.
    ///
    /// Done subscribers run synchronously on the caller's thread, in
    /// registration order. A subscriber failure is converted into
    /// `set_error` on this same operation rather than propagated.
    pub fn set_result(&self, value: T) {
        let subs = {
            let mut inner = self.inner.lock().unwrap();
            if inner.done || inner.cancelled {
                return;
            }
            inner.done = true;
            inner.value = Some(value.clone());
            std::mem::take(&mut inner.done_subs)
        };
        self.completed.notify_all();
        for sub in subs {
            if let Err(err) = sub(&value) {
                self.set_error(err);
            }
        }
    }

    /// Register a completion subscriber. If the operation already completed,
    /// the subscriber is invoked immediately with the stored value.
    pub fn on_done(&self, f: impl FnOnce(&T) -> Result<(), E> + Send + 'static) {
        {
            let mut inner = self.inner.lock().unwrap();
            if !inner.done {
                inner.done_subs.push(Box::new(f));
                return;
            }
        }
        let value = self.inner.lock().unwrap().value.clone();
        if let Some(value) = value {
            if let Err(err) = f(&value) {
                self.set_error(err);
            }
        }
    }

    /// Raise an error. Delivered to every current error subscriber, or
    /// queued if none exists yet. Raising an error is independent of
    /// completion and may happen after `set_result`.
    pub fn set_error(&self, error: E) {
        let subs = {
            let mut inner = self.inner.lock().unwrap();
            inner.last_error = Some(error.clone());
            if inner.error_subs.is_empty() {
                inner.queued_errors.push_back(error.clone());
                Vec::new()
            } else {
                inner.error_subs.clone()
            }
        };
        self.completed.notify_all();
        for sub in &subs {
            sub(&error);
        }
    }

    /// Register an error subscriber.
    ///
    /// Only the first subscriber drains errors that were queued before any
    /// subscriber existed; they are delivered to it alone, once each.
    pub fn on_error(&self, f: impl Fn(&E) + Send + Sync + 'static) {
        let f: ErrorFn<E> = Arc::new(f);
        let queued = {
            let mut inner = self.inner.lock().unwrap();
            inner.error_subs.push(f.clone());
            std::mem::take(&mut inner.queued_errors)
        };
        for err in queued {
            f(&err);
        }
    }

    /// Cancel the operation. Idempotent. Fires cancellation subscribers,
    /// releases blocked waiters and propagates to the current upstream
    /// dependency. Cancelling after completion does not disturb the stored
    /// result.
    pub fn cancel(&self) {
        let (subs, dependency) = {
            let mut inner = self.inner.lock().unwrap();
            if inner.cancelled {
                return;
            }
            inner.cancelled = true;
            (
                std::mem::take(&mut inner.cancel_subs),
                inner.dependency.take(),
            )
        };
        self.completed.notify_all();
        for sub in subs {
            sub();
        }
        if let Some(dep) = dependency {
            dep.cancel();
        }
    }

    /// Register a cancellation subscriber; invoked immediately if the
    /// operation is already cancelled.
    pub fn on_cancelled(&self, f: impl FnOnce() + Send + 'static) {
        let already = {
            let mut inner = self.inner.lock().unwrap();
            if !inner.cancelled {
                inner.cancel_subs.push(Box::new(f));
                None
            } else {
                Some(f)
            }
        };
        if let Some(f) = already {
            f();
        }
    }

    /// Point this operation at its current upstream dependency: cancelling
    /// this operation cancels the dependency. Replaces any previous
    /// dependency, which chained request cycles do on every hop.
    pub fn set_dependency(&self, dependency: Arc<dyn Cancellable>) {
        let cancel_now = {
            let mut inner = self.inner.lock().unwrap();
            if inner.cancelled {
                true
            } else {
                inner.dependency = Some(dependency.clone());
                false
            }
        };
        if cancel_now {
            dependency.cancel();
        }
    }

    /// Block until the operation resolves, errors, is cancelled, or the
    /// timeout elapses. Must not be called from a subscriber callback of the
    /// same operation.
    pub fn wait(&self, timeout: Duration) -> Result<T, WaitError<E>> {
        let deadline = Instant::now() + timeout;
        let mut inner = self.inner.lock().unwrap();
        loop {
            if let Some(err) = &inner.last_error {
                return Err(WaitError::Errored(err.clone()));
            }
            if inner.done {
                if let Some(value) = inner.value.clone() {
                    return Ok(value);
                }
            }
            if inner.cancelled {
                return Err(WaitError::Cancelled);
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(WaitError::TimedOut);
            }
            let (guard, _) = self
                .completed
                .wait_timeout(inner, deadline - now)
                .unwrap();
            inner = guard;
        }
    }
}

impl<T, E> Cancellable for Operation<T, E>
where
    T: Clone + Send + 'static,
    E: Clone + Send + 'static,
{
    fn cancel(&self) {
        Operation::cancel(self);
    }
}

/// Link a dependent operation to the one feeding it: cancelling `outer`
/// cancels `upstream`, and an error on `upstream` re-raises on `outer`.
///
/// Used everywhere a result flows through (negotiation into connection
/// start, transport start into connection start) instead of wiring the two
/// directions by hand at each site.
pub fn link<T, E, U, F>(outer: &Arc<Operation<U, F>>, upstream: &Arc<Operation<T, E>>)
where
    T: Clone + Send + 'static,
    E: Clone + Send + Into<F> + 'static,
    U: Clone + Send + Sync + 'static,
    F: Clone + Send + Sync + 'static,
{
    let dep = upstream.clone();
    outer.on_cancelled(move || dep.cancel());
    let target: Weak<Operation<U, F>> = Arc::downgrade(outer);
    upstream.on_error(move |err| {
        if let Some(outer) = target.upgrade() {
            outer.set_error(err.clone().into());
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counter() -> Arc<AtomicUsize> {
        Arc::new(AtomicUsize::new(0))
    }

    #[test]
    fn done_subscriber_sees_result() {
        let op: Arc<Operation<u32>> = Operation::new();
        let seen = counter();
        let seen2 = seen.clone();
        op.on_done(move |v| {
            seen2.store(*v as usize, Ordering::SeqCst);
            Ok(())
        });
        op.set_result(7);
        assert_eq!(seen.load(Ordering::SeqCst), 7);
    }

    #[test]
    fn late_done_subscriber_replays_synchronously() {
        let op: Arc<Operation<u32>> = Operation::new();
        op.set_result(42);
        let seen = counter();
        let seen2 = seen.clone();
        op.on_done(move |v| {
            seen2.store(*v as usize, Ordering::SeqCst);
            Ok(())
        });
        assert_eq!(seen.load(Ordering::SeqCst), 42);
    }

    #[test]
    fn result_is_delivered_at_most_once() {
        let op: Arc<Operation<u32>> = Operation::new();
        let calls = counter();
        let calls2 = calls.clone();
        op.on_done(move |_| {
            calls2.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        op.set_result(1);
        op.set_result(2);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(op.wait(Duration::from_millis(10)), Ok(1));
    }

    #[test]
    fn queued_error_goes_to_first_subscriber_only() {
        let op: Arc<Operation<()>> = Operation::new();
        op.set_error(ClientError::Transport("one".into()));
        op.set_error(ClientError::Transport("two".into()));

        let first = counter();
        let first2 = first.clone();
        op.on_error(move |_| {
            first2.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(first.load(Ordering::SeqCst), 2);

        // A second subscriber sees nothing queued.
        let second = counter();
        let second2 = second.clone();
        op.on_error(move |_| {
            second2.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(second.load(Ordering::SeqCst), 0);

        // New errors reach both.
        op.set_error(ClientError::Transport("three".into()));
        assert_eq!(first.load(Ordering::SeqCst), 3);
        assert_eq!(second.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn failing_done_subscriber_turns_into_error() {
        let op: Arc<Operation<u32>> = Operation::new();
        op.on_done(|_| Err(ClientError::Handler("refused".into())));
        op.set_result(5);
        let seen = counter();
        let seen2 = seen.clone();
        op.on_error(move |err| {
            assert_eq!(*err, ClientError::Handler("refused".into()));
            seen2.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn cancel_after_result_keeps_the_result() {
        let op: Arc<Operation<u32>> = Operation::new();
        op.set_result(9);
        op.cancel();
        assert_eq!(op.wait(Duration::from_millis(10)), Ok(9));
    }

    #[test]
    fn result_after_cancel_is_ignored() {
        let op: Arc<Operation<u32>> = Operation::new();
        op.cancel();
        op.set_result(1);
        assert_eq!(
            op.wait(Duration::from_millis(10)),
            Err(WaitError::Cancelled)
        );
    }

    #[test]
    fn cancel_subscriber_fires_once_and_replays() {
        let op: Arc<Operation<()>> = Operation::new();
        let calls = counter();
        let calls2 = calls.clone();
        op.on_cancelled(move || {
            calls2.fetch_add(1, Ordering::SeqCst);
        });
        op.cancel();
        op.cancel();
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let late = counter();
        let late2 = late.clone();
        op.on_cancelled(move || {
            late2.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(late.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn wait_times_out() {
        let op: Arc<Operation<()>> = Operation::new();
        assert_eq!(
            op.wait(Duration::from_millis(20)),
            Err(WaitError::TimedOut)
        );
    }

    #[test]
    fn wait_sees_result_from_another_thread() {
        let op: Arc<Operation<u32>> = Operation::new();
        let producer = op.clone();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            producer.set_result(11);
        });
        assert_eq!(op.wait(Duration::from_secs(2)), Ok(11));
        handle.join().unwrap();
    }

    #[test]
    fn link_propagates_cancel_down_and_error_up() {
        let upstream: Arc<Operation<u32>> = Operation::new();
        let outer: Arc<Operation<()>> = Operation::new();
        link(&outer, &upstream);

        outer.cancel();
        assert!(upstream.is_cancelled());

        let upstream: Arc<Operation<u32>> = Operation::new();
        let outer: Arc<Operation<()>> = Operation::new();
        link(&outer, &upstream);
        upstream.set_error(ClientError::Transport("broken".into()));
        let seen = counter();
        let seen2 = seen.clone();
        outer.on_error(move |err| {
            assert_eq!(*err, ClientError::Transport("broken".into()));
            seen2.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn dependency_cancellation_is_updateable() {
        let outer: Arc<Operation<()>> = Operation::new();
        let first: Arc<Operation<()>> = Operation::new();
        let second: Arc<Operation<()>> = Operation::new();
        outer.set_dependency(first.clone());
        outer.set_dependency(second.clone());
        outer.cancel();
        assert!(!first.is_cancelled());
        assert!(second.is_cancelled());

        // Setting a dependency on an already-cancelled operation cancels it
        // right away.
        let third: Arc<Operation<()>> = Operation::new();
        outer.set_dependency(third.clone());
        assert!(third.is_cancelled());
    }

    #[test]
    fn error_after_done_still_reaches_subscribers() {
        let op: Arc<Operation<()>> = Operation::new();
        op.set_result(());
        let seen = counter();
        let seen2 = seen.clone();
        op.on_error(move |_| {
            seen2.fetch_add(1, Ordering::SeqCst);
        });
        op.set_error(ClientError::ConnectionLost("stream ended".into()));
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }
}
