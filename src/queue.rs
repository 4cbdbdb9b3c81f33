//! The closable FIFO [`Queue`].

use std::collections::VecDeque;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{bounded, unbounded, Receiver, Select, Sender};

use crate::stopper::Stopper;

/// A concurrent FIFO queue with channel ends and an unbounded buffer in between.
///
/// Producers send into [`add`][Queue::add] (never blocks on a full buffer ‒ there is no full),
/// consumers receive from [`get`][Queue::get], and a pump thread in the middle owns the buffer,
/// so neither side ever waits for the other directly. Both ends are ordinary crossbeam channel
/// endpoints: clone them, move them to other threads, use them in [`select`][crate::select].
///
/// [`stop`][Queue::stop] closes the consumer end right away. Values still sitting in the buffer
/// at that moment are discarded, and later sends into the producer end error out. Dropping the
/// queue stops it.
///
/// # Examples
///
/// ```rust
/// use synckit::Queue;
///
/// let queue = Queue::new();
/// queue.add().send(1).unwrap();
/// queue.add().send(2).unwrap();
/// assert_eq!(Ok(1), queue.get().recv());
/// assert_eq!(Ok(2), queue.get().recv());
/// queue.stop();
/// assert!(queue.get().recv().is_err());
/// ```
pub struct Queue<T> {
    add: Sender<T>,
    get: Receiver<T>,
    stop: Stopper,
    pump: Option<JoinHandle<()>>,
}

impl<T: Send + 'static> Queue<T> {
    /// Creates a queue (and its pump thread).
    pub fn new() -> Self {
        let (add, add_in) = unbounded();
        // Rendezvous on the way out ‒ values stay in the pump's buffer until a consumer shows
        // up, so stopping can discard them instead of leaving them stuck in a channel.
        let (get_out, get) = bounded(0);
        let stop = Stopper::new();
        let done = stop.done().clone();
        let pump = thread::spawn(move || Self::pump(done, add_in, get_out));
        Queue {
            add,
            get,
            stop,
            pump: Some(pump),
        }
    }

    /// The producer end. Values sent here join the queue.
    ///
    /// Sends fail once the queue is stopped.
    pub fn add(&self) -> &Sender<T> {
        &self.add
    }

    /// The consumer end. Yields queued values in FIFO order.
    ///
    /// Disconnects once the queue is stopped, so `queue.get().iter()` runs until then.
    pub fn get(&self) -> &Receiver<T> {
        &self.get
    }

    /// Stops the queue, discarding anything still buffered. Safe to call more than once.
    pub fn stop(&self) {
        self.stop.stop();
    }

    fn pump(done: Receiver<()>, add: Receiver<T>, get: Sender<T>) {
        let mut buffer = VecDeque::new();
        let mut add_open = true;
        loop {
            if !add_open && buffer.is_empty() {
                // Every producer handle is gone and there's nothing left to hand out.
                return;
            }
            let mut select = Select::new();
            let done_case = select.recv(&done);
            let add_case = if add_open {
                Some(select.recv(&add))
            } else {
                None
            };
            let get_case = if buffer.is_empty() {
                None
            } else {
                Some(select.send(&get))
            };

            let oper = select.select();
            match oper.index() {
                i if i == done_case => {
                    let _ = oper.recv(&done);
                    return;
                }
                i if Some(i) == add_case => match oper.recv(&add) {
                    Ok(value) => buffer.push_back(value),
                    Err(_) => add_open = false,
                },
                i if Some(i) == get_case => {
                    let value = buffer.pop_front().expect("Guarded by is_empty above");
                    if let Err(returned) = oper.send(&get, value) {
                        // The consumer end disappeared mid-handshake; hold onto the value, the
                        // done signal arrives next.
                        buffer.push_front(returned.into_inner());
                    }
                }
                _ => unreachable!("Select returned an unregistered case"),
            }
        }
    }
}

impl<T: Send + 'static> Default for Queue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Drop for Queue<T> {
    fn drop(&mut self) {
        self.stop.stop();
        if let Some(pump) = self.pump.take() {
            let _ = pump.join();
        }
    }
}
