//! The [`Stopper`] done-signal.

use std::sync::{Arc, Mutex, PoisonError};

use crossbeam_channel::{bounded, Receiver, Sender};

/// A simple broadcast "we are done here" signal.
///
/// Internally this is a channel nobody ever sends on: stopping drops the hidden sender, which
/// disconnects the [`done`][Stopper::done] receiver for every clone of the stopper at once. That
/// makes the signal usable from [`select`][crate::select] like any other channel end, and
/// observable any number of times.
///
/// Useful for internal coordination inside one program; across API boundaries a channel of
/// actual values usually serves better.
///
/// # Examples
///
/// ```rust
/// use synckit::Stopper;
///
/// let stopper = Stopper::new();
/// let watcher = stopper.clone();
/// assert!(!watcher.is_stopped());
/// stopper.stop();
/// assert!(watcher.is_stopped());
/// watcher.wait(); // Returns right away.
/// ```
#[derive(Clone, Debug)]
pub struct Stopper {
    trigger: Arc<Mutex<Option<Sender<()>>>>,
    done: Receiver<()>,
}

impl Stopper {
    /// Creates a fresh, not-yet-stopped signal.
    pub fn new() -> Self {
        let (trigger, done) = bounded(0);
        Stopper {
            trigger: Arc::new(Mutex::new(Some(trigger))),
            done,
        }
    }

    /// Fires the signal. Safe to call more than once; all but the first are no-ops.
    pub fn stop(&self) {
        self.trigger
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }

    /// Has [`stop`][Stopper::stop] been called?
    pub fn is_stopped(&self) -> bool {
        self.trigger
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_none()
    }

    /// The channel end that becomes ready (disconnected) once the signal fires.
    ///
    /// Receiving on it never yields a value; it only ever errors out, and does so exactly from
    /// the moment somebody stops.
    pub fn done(&self) -> &Receiver<()> {
        &self.done
    }

    /// Blocks until the signal fires.
    pub fn wait(&self) {
        let _ = self.done.recv();
    }
}

impl Default for Stopper {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use crossbeam_utils::thread;

    use super::*;

    #[test]
    fn observable_through_clones() {
        let stopper = Stopper::new();
        let watcher = stopper.clone();
        assert!(!stopper.is_stopped());
        assert!(watcher.done().try_recv().is_err());
        stopper.stop();
        assert!(watcher.is_stopped());
        watcher.wait();
        watcher.wait();
    }

    #[test]
    fn stop_twice() {
        let stopper = Stopper::new();
        stopper.stop();
        stopper.stop();
        assert!(stopper.is_stopped());
    }

    #[test]
    fn wakes_blocked_waiter() {
        let stopper = Stopper::new();
        thread::scope(|s| {
            let watcher = stopper.clone();
            s.spawn(move |_| watcher.wait());
            stopper.stop();
        })
        .unwrap();
    }
}
