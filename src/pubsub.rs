//! The broadcast [`Pub`]/[`Sub`] pair.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use crossbeam_channel::{bounded, Receiver, Sender};
use smallvec::SmallVec;

/// What the publisher keeps per subscription.
struct SubEntry<T> {
    sender: Sender<T>,
    /// Liveness token. The matching [`Arc`] sits in the `Sub`; once that's gone the
    /// subscription is dead weight and the next send sweeps it out.
    alive: Weak<()>,
}

/// The subscriber table, shared so a [`Sub`] can take itself out.
///
/// A plain locked table, not the crate's own map: subscriber teardown must drop the `Sender`
/// right away (that is what disconnects the subscriber's receiver), and the concurrent map only
/// retires removed values lazily.
type SubTable<T> = Mutex<HashMap<u64, SubEntry<T>>>;

fn lock<T>(table: &SubTable<T>) -> MutexGuard<'_, HashMap<u64, SubEntry<T>>> {
    table.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A broadcast publisher.
///
/// Hands out [`Sub`]scriptions and [`send`][Pub::send]s values to all of them. Delivery is a
/// rendezvous: the send blocks until every live subscriber took its copy (subscribers that
/// dropped out ‒ explicitly via [`Sub::stop`] or just by dropping the `Sub` ‒ are skipped and
/// cleaned up along the way, nobody waits for them).
///
/// Dropping the publisher disconnects every subscriber's receiver.
///
/// # Examples
///
/// ```rust
/// use crossbeam_utils::thread;
/// use synckit::Pub;
///
/// let publisher = Pub::new();
/// publisher.send("nobody listens"); // No subscribers, returns right away.
///
/// let sub = publisher.subscribe();
/// thread::scope(|s| {
///     s.spawn(|_| publisher.send("hello"));
///     assert_eq!(Ok("hello"), sub.recv().recv());
/// }).unwrap();
/// ```
pub struct Pub<T> {
    subs: Arc<SubTable<T>>,
    next_id: AtomicU64,
}

impl<T> Pub<T> {
    /// Creates a publisher with no subscribers.
    pub fn new() -> Self {
        Pub {
            subs: Arc::new(Mutex::new(HashMap::new())),
            next_id: AtomicU64::new(0),
        }
    }

    /// Registers a new subscription.
    pub fn subscribe(&self) -> Sub<T> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (sender, receiver) = bounded(0);
        let alive = Arc::new(());
        lock(&self.subs).insert(
            id,
            SubEntry {
                sender,
                alive: Arc::downgrade(&alive),
            },
        );
        Sub {
            id,
            receiver,
            _alive: alive,
            subs: Arc::downgrade(&self.subs),
        }
    }

    /// Delivers `value` to every live subscriber, one after another.
    ///
    /// Blocks until each of them receives its copy. Subscriptions whose [`Sub`] is gone are
    /// dropped instead of delivered to. The lock is not held while delivering, so subscribers
    /// are free to subscribe/unsubscribe from their callbacks ‒ whether a subscription changed
    /// mid-send catches this very value is then a race by nature.
    pub fn send(&self, value: T)
    where
        T: Clone,
    {
        let mut live = SmallVec::<[Sender<T>; 8]>::new();
        {
            let mut subs = lock(&self.subs);
            subs.retain(|_, entry| entry.alive.upgrade().is_some());
            live.extend(subs.values().map(|entry| entry.sender.clone()));
        }
        for sender in live {
            // A subscriber that disappeared between the sweep and here shows up as a failed
            // send; that's its problem, not ours.
            let _ = sender.send(value.clone());
        }
    }
}

impl<T> Default for Pub<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// A subscription to a [`Pub`].
///
/// Values published while the subscription is live arrive at [`recv`][Sub::recv]. Both
/// [`stop`][Sub::stop]ping and dropping the `Sub` unsubscribe; from then on (and likewise once
/// the publisher itself is dropped) the receiver reports disconnected.
pub struct Sub<T> {
    id: u64,
    receiver: Receiver<T>,
    _alive: Arc<()>,
    subs: Weak<SubTable<T>>,
}

impl<T> Sub<T> {
    /// The channel end yielding published values.
    pub fn recv(&self) -> &Receiver<T> {
        &self.receiver
    }

    /// Unsubscribes from the publisher.
    pub fn stop(&self) {
        if let Some(subs) = self.subs.upgrade() {
            lock(&subs).remove(&self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;

    use crossbeam_utils::thread;

    use super::*;
    use crate::select::{recv, select};

    #[test]
    fn no_subscribers() {
        let publisher = Pub::new();
        publisher.send("into the void");
    }

    #[test]
    fn one_subscriber() {
        let publisher = Pub::new();
        let sub = publisher.subscribe();
        thread::scope(|s| {
            s.spawn(|_| publisher.send("one sub"));
            assert_eq!(Ok("one sub"), sub.recv().recv());
        })
        .unwrap();
    }

    #[test]
    fn two_subscribers_both_get_it() {
        let publisher = Pub::new();
        let sub1 = publisher.subscribe();
        let sub2 = publisher.subscribe();
        thread::scope(|s| {
            s.spawn(|_| publisher.send("two subs"));
            // Delivery order between subscribers is unspecified, so take them as they come.
            // (A Cell, because both case callbacks need somewhere to put the value.)
            for _ in 0..2 {
                let got = Cell::new(None);
                select(vec![
                    recv(sub1.recv(), |v| got.set(v.ok())),
                    recv(sub2.recv(), |v| got.set(v.ok())),
                ]);
                assert_eq!(Some("two subs"), got.get());
            }
        })
        .unwrap();
    }

    #[test]
    fn stopped_subscriber_is_skipped() {
        let publisher = Pub::new();
        let sub1 = publisher.subscribe();
        let sub2 = publisher.subscribe();
        sub1.stop();
        thread::scope(|s| {
            s.spawn(|_| publisher.send("one sub"));
            assert_eq!(Ok("one sub"), sub2.recv().recv());
        })
        .unwrap();
        // Unsubscribing dropped the sending end.
        assert!(sub1.recv().recv().is_err());
    }

    #[test]
    fn dropped_subscriber_is_swept() {
        let publisher = Pub::new();
        let sub1 = publisher.subscribe();
        let sub2 = publisher.subscribe();
        drop(sub1);
        thread::scope(|s| {
            s.spawn(|_| publisher.send(1));
            assert_eq!(Ok(1), sub2.recv().recv());
        })
        .unwrap();
        assert!(lock(&publisher.subs).len() == 1);
    }

    #[test]
    fn publisher_drop_disconnects() {
        let publisher = Pub::<i32>::new();
        let sub = publisher.subscribe();
        drop(publisher);
        assert!(sub.recv().recv().is_err());
    }
}
