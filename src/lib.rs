#![doc(html_root_url = "https://docs.rs/synckit/0.1.0/synckit/")]

//! Extra synchronization primitives for threaded programs.
//!
//! The crate revolves around [`SnapMap`], a concurrent map for workloads that mostly *read* a
//! stable set of keys from many threads, with the occasional insert or delete. Reads of settled
//! keys don't take any lock. The other modules are small independent tools that tend to be needed
//! in the same programs ‒ a single-assignment [`Future`], a closable FIFO [`Queue`], a broadcast
//! [`Pub`]/[`Sub`] pair, a [`Stopper`] done-signal, a multi-way [`select`] and an [`actor`]
//! mailbox with a call/cast server loop. None of them depend on each other's internals and each
//! can be used alone.
//!
//! # The map in a nutshell
//!
//! [`SnapMap`] keeps two copies of its bookkeeping. An immutable *snapshot* is published through
//! an atomic pointer and serves all reads of keys it contains without any locking. Keys not yet
//! in the snapshot live in a mutex-guarded *dirty* overlay; every read that has to go there is
//! counted and once there were as many such misses as the overlay has keys, the overlay is
//! promoted wholesale into a fresh snapshot. Both sides share the per-key entry slots, so a write
//! through one side is seen through the other without another lookup.
//!
//! This shape pays off when the key set stabilizes: the steady state is one atomic load plus one
//! hash lookup per read. It is a poor fit for write-heavy workloads that keep churning fresh keys
//! ‒ those keep the overlay hot and pay for the mutex; a sharded or tree-based map does better
//! there.
//!
//! Values are handed out as clones (the cheap way to stay safe without keeping locks across the
//! API boundary). If your values are expensive to clone, store `Arc<T>` in the map.
//!
//! # Blocking
//!
//! Everything here is thread-oriented and blocking ‒ there are no async surfaces. The channel
//! ends exposed by [`Queue`], [`Pub`]/[`Sub`] and [`Stopper`] are `crossbeam-channel` endpoints,
//! so they compose with [`select`] and with any other crossbeam machinery.
//!
//! # Examples
//!
//! ```rust
//! use synckit::SnapMap;
//! use crossbeam_utils::thread;
//!
//! let map = SnapMap::new();
//! map.store("hello", 1);
//!
//! thread::scope(|s| {
//!     s.spawn(|_| {
//!         map.store("world", 2);
//!     });
//!     s.spawn(|_| {
//!         map.load(&"hello");
//!     });
//! }).unwrap();
//!
//! assert_eq!(Some(1), map.load(&"hello"));
//! assert_eq!(Some(2), map.load(&"world"));
//! ```

pub mod actor;
mod existing_or_new;
mod future;
mod map;
mod pubsub;
mod queue;
pub mod select;
mod stopper;

#[cfg(test)]
mod tests;

pub use crate::existing_or_new::ExistingOrNew;
pub use crate::future::{Completer, Future};
pub use crate::map::SnapMap;
pub use crate::pubsub::{Pub, Sub};
pub use crate::queue::Queue;
pub use crate::select::select;
pub use crate::stopper::Stopper;
