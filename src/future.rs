//! The single-assignment [`Future`] and its [`Completer`].

use std::sync::{Arc, Mutex, PoisonError};

use crossbeam_channel::Receiver;

use crate::stopper::Stopper;

struct Inner<T> {
    value: Mutex<Option<T>>,
    done: Stopper,
}

/// A value that might not be there yet.
///
/// Created together with its [`Completer`] by [`Future::new`]. Any number of threads can block
/// on the future (it is a cheap handle, clone it around freely); the completer is a linear token
/// ‒ completing consumes it, so a future can only ever be assigned once and the type system says
/// so.
///
/// If the completer is dropped without completing, the future stays forever incomplete and
/// [`get`][Future::get]/[`wait`][Future::wait] block indefinitely.
///
/// This has nothing to do with `std::future::Future` ‒ it is a blocking, thread-oriented tool.
///
/// # Examples
///
/// ```rust
/// use std::thread;
/// use synckit::Future;
///
/// let (future, completer) = Future::new();
/// thread::spawn(move || {
///     completer.complete(3);
/// });
/// assert_eq!(3, future.get());
/// assert_eq!(3, future.get());
/// ```
pub struct Future<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Future<T> {
    /// Creates an incomplete future and the completer that'll fill it in.
    pub fn new() -> (Future<T>, Completer<T>) {
        let inner = Arc::new(Inner {
            value: Mutex::new(None),
            done: Stopper::new(),
        });
        let future = Future {
            inner: Arc::clone(&inner),
        };
        (future, Completer { inner })
    }

    /// Blocks until the future completes, then returns a copy of the value.
    pub fn get(&self) -> T
    where
        T: Clone,
    {
        self.wait();
        self.inner
            .value
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .expect("Done fired with an empty slot")
    }

    /// Returns a copy of the value if the future already completed.
    pub fn try_get(&self) -> Option<T>
    where
        T: Clone,
    {
        self.inner
            .value
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Blocks until the future completes, without touching the value.
    pub fn wait(&self) {
        self.inner.done.wait();
    }

    /// Has the value been assigned yet?
    pub fn is_complete(&self) -> bool {
        self.inner.done.is_stopped()
    }

    /// A channel end that becomes ready once the future completes.
    ///
    /// Usable with [`select`][crate::select]; it never yields values, it only disconnects.
    pub fn done(&self) -> &Receiver<()> {
        self.inner.done.done()
    }
}

// Derived Clone would demand T: Clone, which a handle doesn't need.
impl<T> Clone for Future<T> {
    fn clone(&self) -> Self {
        Future {
            inner: Arc::clone(&self.inner),
        }
    }
}

/// The write end of a [`Future`].
pub struct Completer<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Completer<T> {
    /// Completes the future, waking everyone blocked on it.
    ///
    /// Takes the completer by value: there is no second assignment to guard against at runtime.
    pub fn complete(self, value: T) {
        *self
            .inner
            .value
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(value);
        self.inner.done.stop();
    }
}
