//! Promises: settle-once asynchronous results with continuations.
//!
//! A [`Promise`] is a cloneable handle to a single shared slot. Any holder may
//! settle it with [`Promise::resolve`] or [`Promise::reject`]; the first call
//! wins and every later call is ignored and reports `false`. This is not an
//! error: several parties (a write completing, the connection closing) are
//! allowed to race to settle the same promise, and exactly one outcome is kept.
//!
//! Continuations attached with [`Promise::then`] run exactly once, in the order
//! they were attached, on the thread that settles the promise. A continuation
//! attached after settlement runs immediately on the attaching thread.
//!
//! Promises are also [`Future`]s, so async code can simply `.await` them, and a
//! [`Barrier`] bridges them back to blocking callers.
//!
//! ```
//! use std::time::Duration;
//! use keel::promise::{Barrier, Promise};
//!
//! let promise = Promise::new();
//! let doubled = promise.map(|v: u32| v * 2);
//!
//! let resolver = promise.clone();
//! std::thread::spawn(move || resolver.resolve(21));
//!
//! assert!(Barrier::new(&doubled).wait_for(Duration::from_secs(5)));
//! assert_eq!(doubled.value(), Some(42));
//! ```

use std::any::Any;
use std::fmt;
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll, Waker};
use std::time::Duration;

const PENDING: u8 = 0;
const RESOLVED: u8 = 1;
const REJECTED: u8 = 2;

/// The reason a promise was rejected.
///
/// Wraps any error type behind an `Arc` so the same rejection can be handed to
/// every continuation.
#[derive(Clone)]
pub struct Rejection(Arc<dyn std::error::Error + Send + Sync + 'static>);

impl Rejection {
    pub fn new<E>(error: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self(Arc::new(error))
    }

    /// Wraps an error that is already shared.
    pub fn shared<E>(error: Arc<E>) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self(error)
    }

    /// A rejection carrying only a message.
    pub fn msg(message: impl Into<String>) -> Self {
        Self::new(Message(message.into()))
    }

    /// Returns the wrapped error if it is of type `E`.
    pub fn downcast_ref<E>(&self) -> Option<&E>
    where
        E: std::error::Error + 'static,
    {
        self.0.downcast_ref::<E>()
    }

    fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        let message = payload
            .downcast_ref::<&str>()
            .map(|s| (*s).to_owned())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "continuation panicked".to_owned());
        Self::msg(message)
    }
}

impl fmt::Debug for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Rejection").field(&self.0).finish()
    }
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl std::error::Error for Rejection {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&*self.0)
    }
}

#[derive(Debug)]
struct Message(String);

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::error::Error for Message {}

type Continuation<T> = Box<dyn FnOnce(Result<T, Rejection>) + Send + 'static>;

struct Slot<T> {
    outcome: Option<Result<T, Rejection>>,
    continuations: Vec<Continuation<T>>,
    wakers: Vec<Waker>,
}

struct Shared<T> {
    state: AtomicU8,
    slot: Mutex<Slot<T>>,
    settled: Condvar,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A settle-once asynchronous result. See the [module docs](self).
pub struct Promise<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for Promise<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T> fmt::Debug for Promise<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match self.shared.state.load(Ordering::Acquire) {
            PENDING => "pending",
            RESOLVED => "resolved",
            _ => "rejected",
        };
        f.debug_struct("Promise").field("state", &state).finish()
    }
}

impl<T> Default for Promise<T>
where
    T: Clone + Send + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Promise<T>
where
    T: Clone + Send + 'static,
{
    /// Creates a pending promise.
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                state: AtomicU8::new(PENDING),
                slot: Mutex::new(Slot {
                    outcome: None,
                    continuations: Vec::new(),
                    wakers: Vec::new(),
                }),
                settled: Condvar::new(),
            }),
        }
    }

    /// Creates an already resolved promise.
    pub fn resolved(value: T) -> Self {
        let promise = Self::new();
        promise.resolve(value);
        promise
    }

    /// Creates an already rejected promise.
    pub fn rejected(rejection: Rejection) -> Self {
        let promise = Self::new();
        promise.reject(rejection);
        promise
    }

    /// Resolves the promise. Returns `false` if it was already settled, in which
    /// case the value is dropped.
    pub fn resolve(&self, value: T) -> bool {
        self.settle(Ok(value))
    }

    /// Rejects the promise. Returns `false` if it was already settled.
    pub fn reject(&self, rejection: Rejection) -> bool {
        self.settle(Err(rejection))
    }

    /// Settles the promise with `outcome`; first writer wins.
    pub fn settle(&self, outcome: Result<T, Rejection>) -> bool {
        let next = if outcome.is_ok() { RESOLVED } else { REJECTED };
        if self
            .shared
            .state
            .compare_exchange(PENDING, next, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }

        let (continuations, wakers) = {
            let mut slot = lock(&self.shared.slot);
            slot.outcome = Some(outcome.clone());
            (
                std::mem::take(&mut slot.continuations),
                std::mem::take(&mut slot.wakers),
            )
        };
        self.shared.settled.notify_all();

        for continuation in continuations {
            continuation(outcome.clone());
        }
        for waker in wakers {
            waker.wake();
        }
        true
    }

    pub fn is_pending(&self) -> bool {
        self.shared.state.load(Ordering::Acquire) == PENDING
    }

    pub fn is_resolved(&self) -> bool {
        self.shared.state.load(Ordering::Acquire) == RESOLVED
    }

    pub fn is_rejected(&self) -> bool {
        self.shared.state.load(Ordering::Acquire) == REJECTED
    }

    /// The outcome, if settled.
    pub fn outcome(&self) -> Option<Result<T, Rejection>> {
        lock(&self.shared.slot).outcome.clone()
    }

    /// The resolved value, if any.
    pub fn value(&self) -> Option<T> {
        self.outcome().and_then(Result::ok)
    }

    /// The rejection, if any.
    pub fn rejection(&self) -> Option<Rejection> {
        self.outcome().and_then(Result::err)
    }

    // Runs `f` once the promise settles, or right away if it already has.
    fn subscribe<F>(&self, f: F)
    where
        F: FnOnce(Result<T, Rejection>) + Send + 'static,
    {
        let mut slot = lock(&self.shared.slot);
        match slot.outcome.clone() {
            Some(outcome) => {
                drop(slot);
                f(outcome);
            }
            None => slot.continuations.push(Box::new(f)),
        }
    }

    /// Chains a continuation.
    ///
    /// `on_ok` runs with the value, `on_err` with the rejection; whichever runs
    /// settles the returned promise with its result. A panic inside either
    /// rejects the returned promise.
    pub fn then<U, F, R>(&self, on_ok: F, on_err: R) -> Promise<U>
    where
        U: Clone + Send + 'static,
        F: FnOnce(T) -> Result<U, Rejection> + Send + 'static,
        R: FnOnce(Rejection) -> Result<U, Rejection> + Send + 'static,
    {
        let next = Promise::new();
        let chained = next.clone();
        self.subscribe(move |outcome| {
            let result = panic::catch_unwind(AssertUnwindSafe(move || match outcome {
                Ok(value) => on_ok(value),
                Err(rejection) => on_err(rejection),
            }));
            match result {
                Ok(settled) => chained.settle(settled),
                Err(payload) => chained.reject(Rejection::from_panic(payload)),
            };
        });
        next
    }

    /// Transforms the resolved value; rejections pass through.
    pub fn map<U, F>(&self, f: F) -> Promise<U>
    where
        U: Clone + Send + 'static,
        F: FnOnce(T) -> U + Send + 'static,
    {
        self.then(move |value| Ok(f(value)), Err)
    }

    /// Chains another asynchronous step; the returned promise follows the one
    /// produced by `f`.
    pub fn and_then<U, F>(&self, f: F) -> Promise<U>
    where
        U: Clone + Send + 'static,
        F: FnOnce(T) -> Promise<U> + Send + 'static,
    {
        let next = Promise::new();
        let chained = next.clone();
        self.subscribe(move |outcome| match outcome {
            Ok(value) => match panic::catch_unwind(AssertUnwindSafe(move || f(value))) {
                Ok(inner) => inner.subscribe(move |o| {
                    chained.settle(o);
                }),
                Err(payload) => {
                    chained.reject(Rejection::from_panic(payload));
                }
            },
            Err(rejection) => {
                chained.reject(rejection);
            }
        });
        next
    }
}

impl<T> Future for Promise<T>
where
    T: Clone + Send + 'static,
{
    type Output = Result<T, Rejection>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut slot = lock(&self.shared.slot);
        if let Some(outcome) = &slot.outcome {
            return Poll::Ready(outcome.clone());
        }
        if !slot.wakers.iter().any(|w| w.will_wake(cx.waker())) {
            slot.wakers.push(cx.waker().clone());
        }
        Poll::Pending
    }
}

/// Blocks the calling thread until a promise settles.
///
/// Giving up on the wait never cancels the underlying work; the promise keeps
/// running to completion in the background.
pub struct Barrier<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Barrier<T> {
    pub fn new(promise: &Promise<T>) -> Self {
        Self {
            shared: Arc::clone(&promise.shared),
        }
    }

    /// Waits until the promise settles.
    pub fn wait(&self) {
        let slot = lock(&self.shared.slot);
        let _slot = self
            .shared
            .settled
            .wait_while(slot, |s| s.outcome.is_none())
            .unwrap_or_else(PoisonError::into_inner);
    }

    /// Waits at most `timeout`; returns whether the promise settled in time.
    pub fn wait_for(&self, timeout: Duration) -> bool {
        let slot = lock(&self.shared.slot);
        let (slot, _) = self
            .shared
            .settled
            .wait_timeout_while(slot, timeout, |s| s.outcome.is_none())
            .unwrap_or_else(PoisonError::into_inner);
        slot.outcome.is_some()
    }
}

impl<T> fmt::Debug for Barrier<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Barrier").finish_non_exhaustive()
    }
}

/// Waits for every promise to settle.
///
/// The returned promise settles only after *all* inputs have settled. It
/// resolves with the values in input order, or rejects with the first
/// rejection in input order. An empty input resolves immediately.
pub fn when_all<T>(promises: Vec<Promise<T>>) -> Promise<Vec<T>>
where
    T: Clone + Send + 'static,
{
    let all = Promise::new();
    if promises.is_empty() {
        all.resolve(Vec::new());
        return all;
    }

    struct Pending<T> {
        outcomes: Vec<Option<Result<T, Rejection>>>,
        remaining: usize,
    }

    let pending = Arc::new(Mutex::new(Pending {
        outcomes: (0..promises.len()).map(|_| None).collect(),
        remaining: promises.len(),
    }));

    for (index, promise) in promises.iter().enumerate() {
        let pending = Arc::clone(&pending);
        let all = all.clone();
        promise.subscribe(move |outcome| {
            let outcomes = {
                let mut state = lock(&pending);
                state.outcomes[index] = Some(outcome);
                state.remaining -= 1;
                if state.remaining > 0 {
                    return;
                }
                std::mem::take(&mut state.outcomes)
            };
            all.settle(outcomes.into_iter().flatten().collect());
        });
    }
    all
}

/// Settles with the first input to settle, value or rejection.
///
/// An empty input rejects immediately.
pub fn when_any<T>(promises: Vec<Promise<T>>) -> Promise<T>
where
    T: Clone + Send + 'static,
{
    let any = Promise::new();
    if promises.is_empty() {
        any.reject(Rejection::msg("when_any called without promises"));
        return any;
    }
    for promise in &promises {
        let any = any.clone();
        promise.subscribe(move |outcome| {
            any.settle(outcome);
        });
    }
    any
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::thread;
    use std::time::Instant;

    #[test]
    fn first_settlement_wins() {
        let p = Promise::new();
        assert!(p.resolve(1));
        assert!(!p.resolve(2));
        assert!(!p.reject(Rejection::msg("late")));
        assert_eq!(p.value(), Some(1));
        assert!(p.is_resolved());
    }

    #[test]
    fn continuations_run_once_in_attachment_order() {
        let p: Promise<u8> = Promise::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        for i in 0..3 {
            let order = Arc::clone(&order);
            p.map(move |_| order.lock().unwrap().push(i));
        }
        p.resolve(0);
        p.resolve(1);
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2]);
    }

    #[test]
    fn late_continuation_runs_immediately() {
        let p = Promise::resolved(5);
        let seen = Arc::new(AtomicUsize::new(0));
        let s = Arc::clone(&seen);
        p.map(move |v: i32| s.store(v as usize, Ordering::SeqCst));
        assert_eq!(seen.load(Ordering::SeqCst), 5);
    }

    #[test]
    fn error_in_continuation_rejects_chain() {
        let p = Promise::resolved(1);
        let chained: Promise<i32> = p.then(|_| Err(Rejection::msg("nope")), Err);
        assert_eq!(chained.rejection().unwrap().to_string(), "nope");
    }

    #[test]
    fn panic_in_continuation_rejects_chain() {
        let p = Promise::resolved(1);
        let chained: Promise<i32> = p.map(|_| panic!("boom"));
        assert!(chained.is_rejected());
        assert_eq!(chained.rejection().unwrap().to_string(), "boom");
    }

    #[test]
    fn rejection_reaches_error_branch() {
        let p: Promise<i32> = Promise::rejected(Rejection::msg("bad"));
        let recovered = p.then(Ok, |e| Ok(e.to_string().len() as i32));
        assert_eq!(recovered.value(), Some(3));
    }

    #[test]
    fn and_then_flattens() {
        let inner = Promise::new();
        let i2 = inner.clone();
        let outer = Promise::resolved(1).and_then(move |_| i2);
        assert!(outer.is_pending());
        inner.resolve("done");
        assert_eq!(outer.value(), Some("done"));
    }

    #[test]
    fn when_all_preserves_order() {
        let a = Promise::new();
        let b = Promise::new();
        let all = when_all(vec![a.clone(), b.clone()]);
        b.resolve(2);
        assert!(all.is_pending());
        a.resolve(1);
        assert_eq!(all.value(), Some(vec![1, 2]));
    }

    #[test]
    fn when_all_waits_for_every_input_before_rejecting() {
        let a: Promise<i32> = Promise::new();
        let b = Promise::new();
        let all = when_all(vec![a.clone(), b.clone()]);
        a.reject(Rejection::msg("first"));
        assert!(all.is_pending());
        b.resolve(2);
        assert_eq!(all.rejection().unwrap().to_string(), "first");
    }

    #[test]
    fn when_all_empty_resolves() {
        let all: Promise<Vec<u8>> = when_all(Vec::new());
        assert_eq!(all.value(), Some(Vec::new()));
    }

    #[test]
    fn when_any_takes_first() {
        let a = Promise::new();
        let b = Promise::new();
        let any = when_any(vec![a.clone(), b.clone()]);
        b.resolve("b");
        a.resolve("a");
        assert_eq!(any.value(), Some("b"));
    }

    #[test]
    fn barrier_times_out_without_cancelling() {
        let p: Promise<u8> = Promise::new();
        let started = Instant::now();
        assert!(!Barrier::new(&p).wait_for(Duration::from_millis(50)));
        assert!(started.elapsed() >= Duration::from_millis(50));

        let resolver = p.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            resolver.resolve(7)
        });
        assert!(Barrier::new(&p).wait_for(Duration::from_secs(5)));
        assert!(handle.join().unwrap());
        assert_eq!(p.value(), Some(7));
    }

    #[test]
    fn concurrent_settlement_has_one_winner() {
        let p = Promise::new();
        let winners: usize = (0..8)
            .map(|i| {
                let p = p.clone();
                thread::spawn(move || p.resolve(i))
            })
            .collect::<Vec<_>>()
            .into_iter()
            .map(|h| h.join().unwrap() as usize)
            .sum();
        assert_eq!(winners, 1);
    }

    #[tokio::test]
    async fn awaitable() {
        let p = Promise::new();
        let r = p.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            r.resolve(3u32);
        });
        assert_eq!(p.await.unwrap(), 3);
    }
}
