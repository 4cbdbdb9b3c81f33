//! The [`Mailbox`] with selective receive.

use std::any::Any;
use std::collections::VecDeque;
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};

/// A message in flight ‒ any sendable type, boxed.
pub type Message = Box<dyn Any + Send>;

/// An actor mailbox.
///
/// Works a bit like a channel, but isn't tied to one message type and receiving is *selective*:
/// [`recv`][Mailbox::recv] takes the oldest message of the requested type (optionally further
/// narrowed by a predicate, see [`recv_where`][Mailbox::recv_where]), leaving everything else in
/// place for other receive calls to pick up. Sending never blocks ‒ the buffer grows as needed.
///
/// # Examples
///
/// ```rust
/// use synckit::actor::Mailbox;
///
/// let mailbox = Mailbox::new();
/// mailbox.send(1);
/// mailbox.send("in between");
/// mailbox.send(2);
/// // Selects by type and predicate, not by position.
/// assert_eq!(2, mailbox.recv_where(|n: &i32| n % 2 == 0));
/// assert_eq!(1, mailbox.recv::<i32>());
/// assert_eq!("in between", mailbox.recv::<&str>());
/// ```
pub struct Mailbox {
    queue: Mutex<VecDeque<Message>>,
    arrived: Condvar,
}

impl Mailbox {
    /// Creates an empty mailbox.
    pub fn new() -> Self {
        Mailbox {
            queue: Mutex::new(VecDeque::new()),
            arrived: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<Message>> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Delivers a message.
    ///
    /// Every blocked receive gets a chance to check whether this is what it was waiting for.
    pub fn send<M: Any + Send>(&self, msg: M) {
        self.send_boxed(Box::new(msg));
    }

    /// Delivers an already-boxed message.
    pub fn send_boxed(&self, msg: Message) {
        self.lock().push_back(msg);
        self.arrived.notify_all();
    }

    fn take<T: Any>(
        queue: &mut VecDeque<Message>,
        matcher: &mut dyn FnMut(&T) -> bool,
    ) -> Option<T> {
        let idx = queue
            .iter()
            .position(|msg| msg.downcast_ref::<T>().map_or(false, |msg| matcher(msg)))?;
        let msg = queue.remove(idx).expect("Position was just found");
        Some(*msg.downcast::<T>().expect("Type was just checked"))
    }

    /// Takes the oldest message of type `T`, blocking until one arrives.
    pub fn recv<T: Any>(&self) -> T {
        self.recv_where(|_: &T| true)
    }

    /// Takes the oldest message of type `T` the matcher likes, blocking until one arrives.
    pub fn recv_where<T: Any, F: FnMut(&T) -> bool>(&self, mut matcher: F) -> T {
        let mut queue = self.lock();
        loop {
            if let Some(msg) = Self::take(&mut queue, &mut matcher) {
                return msg;
            }
            queue = self
                .arrived
                .wait(queue)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Like [`recv`][Mailbox::recv], but returns `None` right away instead of blocking.
    pub fn try_recv<T: Any>(&self) -> Option<T> {
        self.try_recv_where(|_: &T| true)
    }

    /// Like [`recv_where`][Mailbox::recv_where], but returns `None` right away instead of
    /// blocking.
    pub fn try_recv_where<T: Any, F: FnMut(&T) -> bool>(&self, mut matcher: F) -> Option<T> {
        Self::take(&mut self.lock(), &mut matcher)
    }

    /// Takes the oldest message regardless of type, blocking until one arrives.
    pub fn recv_message(&self) -> Message {
        let mut queue = self.lock();
        loop {
            if let Some(msg) = queue.pop_front() {
                return msg;
            }
            queue = self
                .arrived
                .wait(queue)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Like [`recv_message`][Mailbox::recv_message], but doesn't block.
    pub fn try_recv_message(&self) -> Option<Message> {
        self.lock().pop_front()
    }
}

impl Default for Mailbox {
    fn default() -> Self {
        Self::new()
    }
}
