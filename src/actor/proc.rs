//! Spawned processes: the [`Proc`] handle and its [`Context`].

use std::any::Any;
use std::mem;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;

use crossbeam_channel::Receiver;
use thiserror::Error;

use super::mailbox::Mailbox;
use crate::stopper::Stopper;

/// An error a process exited with.
///
/// Cloneable on purpose ‒ any number of [`wait`][Proc::wait]ers and monitors may want to see
/// it, so it carries rendered messages rather than the error values themselves.
#[derive(Clone, Debug, Error, PartialEq)]
pub enum ExitError {
    /// The process body returned an error.
    #[error("process failed: {0}")]
    Failed(String),
    /// The process body panicked.
    #[error("process panicked: {0}")]
    Panicked(String),
}

/// Identity of a spawned process, unique within the program run.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct ProcId(u64);

/// The message a [`monitor`][Proc::monitor]ing mailbox gets when the process exits.
#[derive(Clone, Debug, PartialEq)]
pub struct Exited {
    /// Which process exited.
    pub id: ProcId,
    /// What it exited with, if it didn't exit cleanly.
    pub error: Option<ExitError>,
}

/// The control message [`Proc::stop`] drops into the process mailbox.
///
/// The [`Server`][super::Server] loop honors it by exiting cleanly. Hand-written process bodies
/// can selectively receive it, or just watch [`Context::done`] instead.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Shutdown;

struct ProcShared {
    id: ProcId,
    mailbox: Arc<Mailbox>,
    done: Stopper,
    result: Mutex<Option<Result<(), ExitError>>>,
    monitors: Mutex<Vec<Arc<Mailbox>>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// What a process body runs with: its own mailbox and the stop signal.
pub struct Context {
    shared: Arc<ProcShared>,
    stop: Stopper,
}

impl Context {
    /// The process's mailbox.
    pub fn mailbox(&self) -> &Arc<Mailbox> {
        &self.shared.mailbox
    }

    /// This process's id.
    pub fn id(&self) -> ProcId {
        self.shared.id
    }

    /// Fires when the process is asked to stop ‒ selectable, see
    /// [`Stopper::done`][crate::Stopper::done].
    pub fn done(&self) -> &Receiver<()> {
        self.stop.done()
    }

    /// Has the process been asked to stop?
    pub fn is_stopped(&self) -> bool {
        self.stop.is_stopped()
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        (*msg).to_owned()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "non-string panic payload".to_owned()
    }
}

/// Runs `body` as a process on its own thread.
///
/// The body gets a [`Context`] with the process mailbox and the stop signal; the stop signal
/// also fires once the body returns, whichever way. A panicking body is caught and recorded as
/// [`ExitError::Panicked`] rather than tearing anything else down.
pub fn spawn<F>(body: F) -> Proc
where
    F: FnOnce(&Context) -> Result<(), Box<dyn std::error::Error + Send + Sync>> + Send + 'static,
{
    static NEXT_ID: AtomicU64 = AtomicU64::new(1);
    let shared = Arc::new(ProcShared {
        id: ProcId(NEXT_ID.fetch_add(1, Ordering::Relaxed)),
        mailbox: Arc::new(Mailbox::new()),
        done: Stopper::new(),
        result: Mutex::new(None),
        monitors: Mutex::new(Vec::new()),
    });
    let stop = Stopper::new();
    let context = Context {
        shared: Arc::clone(&shared),
        stop: stop.clone(),
    };

    thread::spawn(move || {
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| body(&context)));
        let result = match outcome {
            Ok(Ok(())) => Ok(()),
            Ok(Err(error)) => Err(ExitError::Failed(error.to_string())),
            Err(payload) => Err(ExitError::Panicked(panic_message(&*payload))),
        };

        let Context { shared, stop } = context;
        *lock(&shared.result) = Some(result.clone());
        // Result first, done after ‒ everyone woken by done finds the result in place.
        stop.stop();
        shared.done.stop();
        let monitors = mem::replace(&mut *lock(&shared.monitors), Vec::new());
        for monitor in monitors {
            monitor.send(Exited {
                id: shared.id,
                error: result.clone().err(),
            });
        }
    });

    Proc { shared, stop }
}

/// A handle to a spawned process.
///
/// Dropping the handle detaches the process; it keeps running until its body returns.
pub struct Proc {
    shared: Arc<ProcShared>,
    stop: Stopper,
}

impl Proc {
    /// The process's id.
    pub fn id(&self) -> ProcId {
        self.shared.id
    }

    /// The process's mailbox. Anyone may send into it.
    pub fn mailbox(&self) -> &Arc<Mailbox> {
        &self.shared.mailbox
    }

    /// Shorthand for sending into the process's mailbox.
    pub fn send<M: Any + Send>(&self, msg: M) {
        self.shared.mailbox.send(msg);
    }

    /// Asks the process to stop.
    ///
    /// Fires the context's stop signal and posts a [`Shutdown`] message into the mailbox, so
    /// both signal-watching and mailbox-looping bodies notice. Whether and when the process
    /// actually exits is up to its body.
    pub fn stop(&self) {
        self.stop.stop();
        self.shared.mailbox.send(Shutdown);
    }

    /// Fires once the process has fully exited ‒ selectable.
    pub fn done(&self) -> &Receiver<()> {
        self.shared.done.done()
    }

    /// Blocks until the process exits and reports how that went.
    pub fn wait(&self) -> Result<(), ExitError> {
        self.shared.done.wait();
        lock(&self.shared.result)
            .clone()
            .expect("Done fired without a recorded result")
    }

    /// Registers a mailbox to get an [`Exited`] message when the process exits.
    ///
    /// Monitoring an already-exited process delivers the message immediately. Each registration
    /// delivers once.
    pub fn monitor(&self, mailbox: &Arc<Mailbox>) {
        // The monitors lock also orders us against the exiting thread: it drains the list after
        // firing done, so either it sees our registration or we see done fired.
        let mut monitors = lock(&self.shared.monitors);
        if self.shared.done.is_stopped() {
            let error = lock(&self.shared.result)
                .clone()
                .and_then(Result::err);
            mailbox.send(Exited {
                id: self.shared.id,
                error,
            });
        } else {
            monitors.push(Arc::clone(mailbox));
        }
    }
}
