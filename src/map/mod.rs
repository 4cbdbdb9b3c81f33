//! The [`SnapMap`] concurrent map.
//!
//! # Internals
//!
//! The map is two maps in a trench coat. The *snapshot* is an immutable `HashMap` published
//! through an atomic pointer ‒ readers grab the pointer once per operation (under an epoch
//! guard, so a concurrent republish can't pull the memory from under them) and do a plain hash
//! lookup, no lock anywhere. The *dirty overlay* is an ordinary mutable `HashMap` living under
//! the map's one mutex; it holds the keys the snapshot doesn't know about yet.
//!
//! Both maps store `Arc<Entry>` slots and share them for any key they both know, which is the
//! load-bearing trick: a lock-free write through a snapshot entry is immediately visible through
//! the overlay and survives the next promotion, without either side re-looking anything up.
//!
//! Every lookup that had to fall through to the overlay counts as a miss. Once there were as
//! many misses as the overlay has keys, the overlay is adopted wholesale as the new snapshot ‒
//! so the O(overlay) cost of rebuilding a lock-free view is amortized to O(1) per miss.
//!
//! Deletion is two-step. Deleting a key that made it into a snapshot just nulls the shared entry
//! (the slot stays and a later store to the key reuses it lock-free). Only when a fresh overlay
//! is built are null entries marked *expunged* and left out of it; from that point the slot is
//! dead to the lock-free path and a store of the key has to go through the mutex, which either
//! resurrects the slot back into the overlay or makes a new one.

use std::borrow::Borrow;
use std::collections::hash_map::RandomState;
use std::collections::HashMap;
use std::fmt::{Debug, Formatter, Result as FmtResult};
use std::hash::{BuildHasher, Hash};
use std::mem;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crossbeam_epoch::{Atomic, Guard, Owned, Shared};

mod entry;

use self::entry::{CellFlags, Entry, Slot};
use crate::existing_or_new::ExistingOrNew;

/// The immutable, atomically published view of the map.
///
/// Never modified once it went through [`SnapMap::publish`]; replaced as a whole instead.
struct Snapshot<K, V, S> {
    entries: HashMap<K, Arc<Entry<V>>, S>,
    /// True if the dirty overlay holds at least one key that `entries` doesn't.
    amended: bool,
}

/// Everything that lives under the map's mutex.
///
/// Bundling the miss counter with the overlay makes "locked" a type-level fact ‒ there's no way
/// to touch either without holding the one lock.
struct Overlay<K, V, S> {
    /// The dirty overlay. `None` until a write first needs a key the snapshot lacks.
    ///
    /// Once present it contains every key whose content may differ from a fresh snapshot ‒
    /// that's what makes adopting it wholesale during promotion correct.
    map: Option<HashMap<K, Arc<Entry<V>>, S>>,
    /// Lookups that had to consult the overlay since the last promotion.
    misses: usize,
}

/// The promotion heuristic.
///
/// Promoting costs O(overlay size) (the old snapshot is dropped and the overlay adopted), so we
/// wait until that cost is already paid for by an equal number of locked lookups. Purely a
/// throughput/latency trade-off; any threshold keeps the map correct.
fn should_promote(misses: usize, overlay_len: usize) -> bool {
    misses >= overlay_len
}

/// A concurrent map for read-mostly workloads over a stable key set.
///
/// Loads, stores and deletes of keys that settled into the internal snapshot run lock-free;
/// operations on keys still outside it briefly take the map's single mutex. Every operation is
/// atomic with respect to its own key; there is no cross-key atomicity and no ordered iteration.
///
/// Contended first writes of *fresh* keys serialize on the mutex ‒ if your workload keeps
/// inventing new keys from many threads, this map is the wrong tool.
///
/// The `Clone` bound on values appears only on operations that return one; `PartialEq` only on
/// the compare-and-* family. Keys get cloned into the internal bookkeeping, so both bounds on
/// keys are unconditional.
///
/// # Examples
///
/// ```rust
/// use synckit::SnapMap;
///
/// let map = SnapMap::new();
/// map.store("apples", 3);
/// map.store("oranges", 7);
/// assert_eq!(Some(3), map.load(&"apples"));
/// map.delete(&"apples");
/// assert_eq!(None, map.load(&"apples"));
/// ```
pub struct SnapMap<K, V, S = RandomState> {
    hash_builder: S,
    read: Atomic<Snapshot<K, V, S>>,
    dirty: Mutex<Overlay<K, V, S>>,
}

impl<K, V> SnapMap<K, V, RandomState>
where
    K: Hash + Eq + Clone,
{
    /// Creates an empty map.
    pub fn new() -> Self {
        Self::with_hasher(RandomState::default())
    }
}

impl<K, V, S> SnapMap<K, V, S>
where
    K: Hash + Eq + Clone,
    S: BuildHasher + Clone,
{
    /// Creates an empty map that'll use the given hasher for both of its internal tables.
    pub fn with_hasher(hash_builder: S) -> Self {
        // Internal sanity check, same spirit as asserting a struct layout: the expunged mark
        // lives in the low pointer bits, so the value slots must leave at least one free.
        assert!(
            mem::align_of::<Slot<V>>().trailing_zeros() >= CellFlags::all().bits().count_ones(),
            "BUG: Alignment of Slot<V> is not large enough to store the cell flags",
        );
        Self {
            hash_builder,
            read: Atomic::null(),
            dirty: Mutex::new(Overlay {
                map: None,
                misses: 0,
            }),
        }
    }

    /// Takes the mutex.
    ///
    /// Poisoning is deliberately ignored. Nothing in here panics halfway through an update ‒
    /// every step under the lock leaves the invariants intact, so a poisoned lock only means
    /// some *caller's* code panicked while we were unwinding through it.
    fn lock(&self) -> MutexGuard<'_, Overlay<K, V, S>> {
        self.dirty.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The current snapshot, if any was published yet.
    fn snapshot<'g>(&self, guard: &'g Guard) -> Option<&'g Snapshot<K, V, S>> {
        unsafe { self.read.load(Ordering::Acquire, guard).as_ref() }
    }

    /// Replaces the published snapshot, retiring the old one.
    fn publish<'g>(
        &self,
        snapshot: Snapshot<K, V, S>,
        guard: &'g Guard,
    ) -> Shared<'g, Snapshot<K, V, S>> {
        let new = Owned::new(snapshot).into_shared(guard);
        // Release publishes the snapshot's content to the readers' Acquire loads; the old one is
        // acquired so its destruction (on whatever thread runs it) sees it whole.
        let old = self.read.swap(new, Ordering::AcqRel, guard);
        if !old.is_null() {
            unsafe { guard.defer_destroy(old) };
        }
        new
    }

    fn new_table(&self) -> HashMap<K, Arc<Entry<V>>, S> {
        HashMap::with_hasher(self.hash_builder.clone())
    }

    /// Counts a lookup that had to consult the overlay and promotes it once it paid off.
    ///
    /// Promotion adopts the overlay as the entry set of a brand-new snapshot ‒ moved, not
    /// copied ‒ and leaves the overlay unmaterialized for the next out-of-snapshot write.
    fn miss_locked(&self, overlay: &mut Overlay<K, V, S>, guard: &Guard) {
        overlay.misses += 1;
        let len = overlay.map.as_ref().map_or(0, HashMap::len);
        if !should_promote(overlay.misses, len) {
            return;
        }
        let entries = overlay.map.take().unwrap_or_else(|| self.new_table());
        self.publish(
            Snapshot {
                entries,
                amended: false,
            },
            guard,
        );
        overlay.misses = 0;
    }

    /// Builds the dirty overlay if there is none, copying the live part of the snapshot.
    ///
    /// Every null entry met during the copy is expunged instead of copied ‒ that's the moment a
    /// deleted key's slot stops being writable lock-free (see the module docs).
    fn materialize_locked(&self, overlay: &mut Overlay<K, V, S>, guard: &Guard) {
        if overlay.map.is_some() {
            return;
        }
        let mut dirty = self.new_table();
        if let Some(read) = self.snapshot(guard) {
            dirty.reserve(read.entries.len());
            for (key, entry) in &read.entries {
                if !entry.try_expunge_locked(guard) {
                    dirty.insert(key.clone(), Arc::clone(entry));
                }
            }
        }
        overlay.map = Some(dirty);
    }

    /// Prepares the overlay for inserting a key the snapshot doesn't have.
    ///
    /// Re-publishes the same snapshot entries with the amended flag up, so lock-free readers of
    /// missing keys know they have to come ask the overlay.
    fn amend_locked(&self, overlay: &mut Overlay<K, V, S>, guard: &Guard) {
        self.materialize_locked(overlay, guard);
        let entries = match self.snapshot(guard) {
            // Cloning buys the immutability of the published snapshot: K plus one Arc bump per
            // entry, once per amend cycle.
            Some(read) => read.entries.clone(),
            None => self.new_table(),
        };
        self.publish(
            Snapshot {
                entries,
                amended: true,
            },
            guard,
        );
    }

    fn load_inner<'g, Q>(&self, key: &Q, guard: &'g Guard) -> Option<&'g V>
    where
        Q: ?Sized + Hash + Eq,
        K: Borrow<Q>,
    {
        match self.snapshot(guard) {
            Some(read) => {
                if let Some(entry) = read.entries.get(key) {
                    return entry.load(guard);
                }
                if !read.amended {
                    return None;
                }
            }
            // No snapshot yet means nothing was ever stored.
            None => return None,
        }

        // The key may live only in the overlay. The snapshot gets re-checked under the lock ‒ it
        // may have been promoted between our lock-free look and getting the mutex.
        let mut overlay = self.lock();
        let entry = match self.snapshot(guard) {
            Some(read) => match read.entries.get(key) {
                Some(entry) => Some(Arc::clone(entry)),
                None if read.amended => {
                    let entry = overlay
                        .map
                        .as_ref()
                        .and_then(|dirty| dirty.get(key))
                        .map(Arc::clone);
                    // Counted whether or not the key was there ‒ the price was the same.
                    self.miss_locked(&mut overlay, guard);
                    entry
                }
                None => None,
            },
            None => None,
        };
        drop(overlay);
        entry.as_ref().and_then(|entry| entry.load(guard))
    }

    /// Looks the key up.
    ///
    /// Lock-free unless the key is currently outside the snapshot.
    pub fn load<Q>(&self, key: &Q) -> Option<V>
    where
        Q: ?Sized + Hash + Eq,
        K: Borrow<Q>,
        V: Clone,
    {
        let guard = crossbeam_epoch::pin();
        self.load_inner(key, &guard).cloned()
    }

    fn swap_inner<'g>(&self, key: K, value: V, guard: &'g Guard) -> Option<&'g V> {
        let mut value = value;
        if let Some(read) = self.snapshot(guard) {
            if let Some(entry) = read.entries.get(&key) {
                match entry.try_swap(value, guard) {
                    Ok(previous) => return previous,
                    // Expunged ‒ resurrecting needs the mutex. The value comes back to us.
                    Err(returned) => value = returned,
                }
            }
        }

        let mut overlay = self.lock();
        let read = self.snapshot(guard);
        let amended = read.map_or(false, |read| read.amended);
        if let Some(entry) = read.and_then(|read| read.entries.get(&key)) {
            if entry.unexpunge_locked(guard) {
                // It was expunged: the overlay exists and lacks the key, so the resurrected slot
                // goes (back) in. Snapshot and overlay share it again from here on.
                let dirty = overlay
                    .map
                    .as_mut()
                    .expect("Expunged entry without a dirty overlay");
                dirty.insert(key, Arc::clone(entry));
            }
            entry.swap_locked(value, guard)
        } else {
            let entry = overlay
                .map
                .as_ref()
                .and_then(|dirty| dirty.get(&key))
                .map(Arc::clone);
            if let Some(entry) = entry {
                self.miss_locked(&mut overlay, guard);
                entry.swap_locked(value, guard)
            } else {
                if !amended {
                    self.amend_locked(&mut overlay, guard);
                }
                let dirty = overlay.map.as_mut().expect("Just amended");
                dirty.insert(key, Arc::new(Entry::new(value)));
                None
            }
        }
    }

    /// Stores the value under the key, replacing whatever was there.
    pub fn store(&self, key: K, value: V) {
        let guard = crossbeam_epoch::pin();
        self.swap_inner(key, value, &guard);
    }

    /// Stores the value under the key and returns the previous one, if there was any.
    pub fn swap(&self, key: K, value: V) -> Option<V>
    where
        V: Clone,
    {
        let guard = crossbeam_epoch::pin();
        self.swap_inner(key, value, &guard).cloned()
    }

    fn load_or_store_inner<'g>(&self, key: K, value: V, guard: &'g Guard) -> ExistingOrNew<&'g V> {
        let mut value = value;
        if let Some(read) = self.snapshot(guard) {
            if let Some(entry) = read.entries.get(&key) {
                match entry.try_load_or_store(value, guard) {
                    Ok(result) => return result,
                    Err(returned) => value = returned,
                }
            }
        }
        // A key missing from the snapshot always goes through the mutex here ‒ only that can
        // tell "resurrect the expunged slot" from "make a brand new one".

        let mut overlay = self.lock();
        let read = self.snapshot(guard);
        let amended = read.map_or(false, |read| read.amended);
        if let Some(entry) = read.and_then(|read| read.entries.get(&key)) {
            if entry.unexpunge_locked(guard) {
                let dirty = overlay
                    .map
                    .as_mut()
                    .expect("Expunged entry without a dirty overlay");
                dirty.insert(key, Arc::clone(entry));
            }
            match entry.try_load_or_store(value, guard) {
                Ok(result) => result,
                Err(_) => unreachable!("Entry expunged while the map mutex is held"),
            }
        } else {
            let entry = overlay
                .map
                .as_ref()
                .and_then(|dirty| dirty.get(&key))
                .map(Arc::clone);
            if let Some(entry) = entry {
                let result = match entry.try_load_or_store(value, guard) {
                    Ok(result) => result,
                    Err(_) => unreachable!("Overlay entries are never expunged"),
                };
                self.miss_locked(&mut overlay, guard);
                result
            } else {
                if !amended {
                    self.amend_locked(&mut overlay, guard);
                }
                let entry = Arc::new(Entry::new(value));
                let stored = entry.load(guard).expect("Freshly stored value");
                let dirty = overlay.map.as_mut().expect("Just amended");
                dirty.insert(key, entry);
                ExistingOrNew::New(stored)
            }
        }
    }

    /// Returns the value under the key, storing the provided one if the key was vacant.
    ///
    /// The [`ExistingOrNew`] answer tells which of the two happened.
    pub fn load_or_store(&self, key: K, value: V) -> ExistingOrNew<V>
    where
        V: Clone,
    {
        let guard = crossbeam_epoch::pin();
        self.load_or_store_inner(key, value, &guard)
            .map(Clone::clone)
    }

    fn load_and_delete_inner<'g, Q>(&self, key: &Q, guard: &'g Guard) -> Option<&'g V>
    where
        Q: ?Sized + Hash + Eq,
        K: Borrow<Q>,
    {
        match self.snapshot(guard) {
            Some(read) => {
                if let Some(entry) = read.entries.get(key) {
                    return entry.delete(guard);
                }
                if !read.amended {
                    return None;
                }
            }
            None => return None,
        }

        let mut overlay = self.lock();
        let entry = match self.snapshot(guard) {
            Some(read) => match read.entries.get(key) {
                Some(entry) => Some(Arc::clone(entry)),
                None if read.amended => {
                    // An overlay-only key is dropped from the overlay right away ‒ there's no
                    // snapshot holding the slot, so nulling it out would just leak the entry
                    // until the next promotion cycle.
                    let entry = overlay.map.as_mut().and_then(|dirty| dirty.remove(key));
                    self.miss_locked(&mut overlay, guard);
                    entry
                }
                None => None,
            },
            None => None,
        };
        drop(overlay);
        entry.as_ref().and_then(|entry| entry.delete(guard))
    }

    /// Deletes the key and returns the value it held, if any.
    pub fn load_and_delete<Q>(&self, key: &Q) -> Option<V>
    where
        Q: ?Sized + Hash + Eq,
        K: Borrow<Q>,
        V: Clone,
    {
        let guard = crossbeam_epoch::pin();
        self.load_and_delete_inner(key, &guard).cloned()
    }

    /// Deletes the key.
    pub fn delete<Q>(&self, key: &Q)
    where
        Q: ?Sized + Hash + Eq,
        K: Borrow<Q>,
    {
        let guard = crossbeam_epoch::pin();
        self.load_and_delete_inner(key, &guard);
    }

    /// Replaces the value under the key by `new`, provided the current one equals `old`.
    ///
    /// Returns whether it did. An absent key never matches and nothing gets inserted.
    pub fn compare_and_swap<Q>(&self, key: &Q, old: &V, new: V) -> bool
    where
        Q: ?Sized + Hash + Eq,
        K: Borrow<Q>,
        V: PartialEq,
    {
        let guard = crossbeam_epoch::pin();
        match self.snapshot(&guard) {
            Some(read) => {
                if let Some(entry) = read.entries.get(key) {
                    return entry.try_compare_and_swap(old, new, &guard);
                }
                if !read.amended {
                    // Not in the snapshot, no overlay surplus ‒ provably no such key anywhere.
                    return false;
                }
            }
            None => return false,
        }

        let mut overlay = self.lock();
        match self.snapshot(&guard) {
            Some(read) => {
                if let Some(entry) = read.entries.get(key) {
                    // An expunged entry fails the CAS on its own ‒ no resurrection for an
                    // operation that never inserts.
                    entry.try_compare_and_swap(old, new, &guard)
                } else {
                    let entry = overlay
                        .map
                        .as_ref()
                        .and_then(|dirty| dirty.get(key))
                        .map(Arc::clone);
                    match entry {
                        Some(entry) => {
                            let swapped = entry.try_compare_and_swap(old, new, &guard);
                            self.miss_locked(&mut overlay, &guard);
                            swapped
                        }
                        None => false,
                    }
                }
            }
            None => false,
        }
    }

    /// Deletes the key, provided its current value equals `old`.
    ///
    /// Returns whether it did. An absent key never matches.
    pub fn compare_and_delete<Q>(&self, key: &Q, old: &V) -> bool
    where
        Q: ?Sized + Hash + Eq,
        K: Borrow<Q>,
        V: PartialEq,
    {
        let guard = crossbeam_epoch::pin();
        match self.snapshot(&guard) {
            Some(read) => {
                if let Some(entry) = read.entries.get(key) {
                    return entry.try_compare_and_delete(old, &guard);
                }
                if !read.amended {
                    return false;
                }
            }
            None => return false,
        }

        let mut overlay = self.lock();
        let entry = match self.snapshot(&guard) {
            Some(read) => match read.entries.get(key) {
                Some(entry) => Some(Arc::clone(entry)),
                None if read.amended => {
                    let entry = overlay
                        .map
                        .as_ref()
                        .and_then(|dirty| dirty.get(key))
                        .map(Arc::clone);
                    self.miss_locked(&mut overlay, &guard);
                    entry
                }
                None => None,
            },
            None => None,
        };
        drop(overlay);
        entry.map_or(false, |entry| entry.try_compare_and_delete(old, &guard))
    }

    /// Calls the visitor on each key/value pair. Returning `false` stops the iteration.
    ///
    /// No lock is held while the visitor runs, so it may call back into the map (including
    /// nested `range`s) freely. The view is *not* a consistent point in time when writers run
    /// concurrently: a key held throughout the call is visited at most once, a key inserted
    /// during the call may or may not show up, a concurrently deleted one may still show up with
    /// its last value. With no concurrent writers it is simply the map's content.
    pub fn range<F>(&self, mut visitor: F)
    where
        F: FnMut(&K, &V) -> bool,
    {
        let guard = crossbeam_epoch::pin();
        let mut read = self.read.load(Ordering::Acquire, &guard);
        if unsafe { read.as_ref() }.map_or(false, |read| read.amended) {
            // The overlay has keys the snapshot lacks and we promised to consider them. Promote
            // right away, ignoring the miss budget ‒ iteration pays O(n) anyway, so the rebuild
            // is free amortization-wise.
            let mut overlay = self.lock();
            read = self.read.load(Ordering::Acquire, &guard);
            if unsafe { read.as_ref() }.map_or(false, |read| read.amended) {
                let entries = overlay.map.take().unwrap_or_else(|| self.new_table());
                read = self.publish(
                    Snapshot {
                        entries,
                        amended: false,
                    },
                    &guard,
                );
                overlay.misses = 0;
            }
        }

        if let Some(read) = unsafe { read.as_ref() } {
            for (key, entry) in &read.entries {
                // Deleted and expunged slots read as absent and are skipped.
                if let Some(value) = entry.load(&guard) {
                    if !visitor(key, value) {
                        break;
                    }
                }
            }
        }
    }

    /// Removes all keys.
    pub fn clear(&self) {
        let guard = crossbeam_epoch::pin();
        let empty = match self.snapshot(&guard) {
            Some(read) => read.entries.is_empty() && !read.amended,
            None => true,
        };
        if empty {
            return;
        }

        let mut overlay = self.lock();
        let stale = match self.snapshot(&guard) {
            Some(read) => !read.entries.is_empty() || read.amended,
            None => false,
        };
        if stale {
            self.publish(
                Snapshot {
                    entries: self.new_table(),
                    amended: false,
                },
                &guard,
            );
        }
        if let Some(dirty) = overlay.map.as_mut() {
            dirty.clear();
        }
        overlay.misses = 0;
    }
}

impl<K, V, S> Default for SnapMap<K, V, S>
where
    K: Hash + Eq + Clone,
    S: BuildHasher + Clone + Default,
{
    fn default() -> Self {
        Self::with_hasher(S::default())
    }
}

impl<K, V, S> Debug for SnapMap<K, V, S>
where
    K: Hash + Eq + Clone + Debug,
    V: Debug,
    S: BuildHasher + Clone,
{
    fn fmt(&self, fmt: &mut Formatter) -> FmtResult {
        let mut map = fmt.debug_map();
        self.range(|key, value| {
            map.entry(key, value);
            true
        });
        map.finish()
    }
}

impl<K, V, S> Drop for SnapMap<K, V, S> {
    fn drop(&mut self) {
        /*
         * Notes about unsafety here:
         * * We are in a destructor and that one is &mut self. There are no concurrent accesses
         *   to the map any more, therefore we can safely assume we are the only ones looking at
         *   the snapshot pointer.
         * * Therefore, using unprotected is also fine.
         * * Similarly, the Relaxed ordering here is fine too, as the whole data structure must
         *   have been synchronized into our thread already by this time.
         * The overlay and the entries drop themselves; entries retire their slots through the
         * collector on their own.
         */
        unsafe {
            let read = self
                .read
                .load(Ordering::Relaxed, crossbeam_epoch::unprotected());
            if !read.is_null() {
                drop(read.into_owned());
            }
        }
    }
}
