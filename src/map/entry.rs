//! The per-key atomic value cell of the map.
//!
//! An [`Entry`] is the one piece of map state that gets mutated without the map mutex. It is a
//! single atomically-swappable pointer with three states:
//!
//! * A pointer to a live value.
//! * Null ‒ the key is logically deleted, but the slot is kept around and a later store to the
//!   same key can reuse it without going through the map's locked path.
//! * Null with the [`EXPUNGED`][CellFlags::EXPUNGED] tag bit ‒ the slot was dropped while
//!   building a dirty overlay and must not be written through the lock-free path any more. Only
//!   the locked path may resurrect it (and it re-registers the entry in the overlay when it
//!   does).
//!
//! The expunged mark is a *tag*, not an allocated sentinel value. It is told apart by pointer
//! identity (null + bit), never compared or dereferenced as a value. That needs one free low bit
//! in every value pointer, which the [`Slot`] wrapper guarantees by raising the alignment.

use std::sync::atomic::Ordering;

use bitflags::bitflags;
use crossbeam_epoch::{Atomic, Guard, Owned, Shared};

use crate::existing_or_new::ExistingOrNew;

bitflags! {
    /// Flags living in the unused low bits of a cell pointer.
    ///
    /// [`Slot`] aligns to at least 2, so there's always at least the one bit we need.
    pub(crate) struct CellFlags: usize {
        /// The slot is permanently gone from the map's bookkeeping.
        ///
        /// Stores through the lock-free path must fail and fall back to the map's locked path,
        /// because the slot is absent from the dirty overlay and a successful store would be
        /// invisible to a later promotion.
        const EXPUNGED = 0b01;
    }
}

/// The heap allocation a cell points to.
///
/// Exists only to force a free low bit into the pointer (a bare `V` may align to 1).
#[repr(align(2))]
pub(crate) struct Slot<V>(V);

/// Extracts [`CellFlags`] from a cell pointer.
fn flags<V>(ptr: Shared<'_, Slot<V>>) -> CellFlags {
    CellFlags::from_bits(ptr.tag()).expect("Invalid cell flags")
}

/// The expunged marker ‒ a tagged null, never dereferenced.
fn expunged<'g, V>() -> Shared<'g, Slot<V>> {
    Shared::null().with_tag(CellFlags::EXPUNGED.bits())
}

/// A single mutable value slot, shared by the snapshot and the dirty overlay for one key.
///
/// All methods are atomic with respect to the one cell and lock-free; the `*_locked` ones are
/// additionally only correct while the caller holds the owning map's mutex (nothing enforces
/// that here, the map is the only caller).
///
/// Replaced values are retired through the epoch [`Guard`], so `&'g V` borrows handed out by
/// these methods stay valid for as long as the guard they were loaded under.
pub(crate) struct Entry<V> {
    cell: Atomic<Slot<V>>,
}

impl<V> Entry<V> {
    /// Creates a slot already holding a value.
    pub(crate) fn new(value: V) -> Self {
        Entry {
            cell: Atomic::new(Slot(value)),
        }
    }

    /// Reads the current value. Null and expunged both read as absent.
    pub(crate) fn load<'g>(&self, guard: &'g Guard) -> Option<&'g V> {
        let current = self.cell.load(Ordering::Acquire, guard);
        // Expunged is a tagged null, so this covers both absent states.
        unsafe { current.as_ref() }.map(|slot| &slot.0)
    }

    /// Replaces the value unconditionally, unless the slot is expunged.
    ///
    /// On success returns the previous value (if the slot wasn't null). If the slot is expunged
    /// nothing is mutated and the input value is handed back, so the caller can retry on the
    /// locked path without another allocation.
    pub(crate) fn try_swap<'g>(&self, value: V, guard: &'g Guard) -> Result<Option<&'g V>, V> {
        let mut new = Owned::new(Slot(value));
        let mut current = self.cell.load(Ordering::Acquire, guard);
        loop {
            if flags(current).contains(CellFlags::EXPUNGED) {
                return Err(new.into_box().0);
            }
            match self
                .cell
                .compare_and_set(current, new, (Ordering::AcqRel, Ordering::Acquire), guard)
            {
                Ok(_) => {
                    let previous = unsafe { current.as_ref() }.map(|slot| &slot.0);
                    if !current.is_null() {
                        unsafe { guard.defer_destroy(current) };
                    }
                    return Ok(previous);
                }
                Err(e) => {
                    current = e.current;
                    new = e.new;
                }
            }
        }
    }

    /// Replaces the value unconditionally.
    ///
    /// Valid only under the map mutex ‒ the slot is guaranteed not to be expunged there (the
    /// caller un-expunges first and expunging itself needs the same mutex).
    pub(crate) fn swap_locked<'g>(&self, value: V, guard: &'g Guard) -> Option<&'g V> {
        let previous = self.cell.swap(Owned::new(Slot(value)), Ordering::AcqRel, guard);
        debug_assert!(!flags(previous).contains(CellFlags::EXPUNGED));
        let value = unsafe { previous.as_ref() }.map(|slot| &slot.0);
        if !previous.is_null() {
            unsafe { guard.defer_destroy(previous) };
        }
        value
    }

    /// Replaces the value only if the current one equals `old`.
    ///
    /// Fails without mutating if the slot is null or expunged, or if the value differs. A CAS
    /// lost to a competing writer is retried as long as the freshly observed value still equals
    /// `old`.
    pub(crate) fn try_compare_and_swap(&self, old: &V, new: V, guard: &Guard) -> bool
    where
        V: PartialEq,
    {
        let mut current = self.cell.load(Ordering::Acquire, guard);
        match unsafe { current.as_ref() } {
            Some(slot) if slot.0 == *old => (),
            _ => return false,
        }
        let mut new = Owned::new(Slot(new));
        loop {
            match self
                .cell
                .compare_and_set(current, new, (Ordering::AcqRel, Ordering::Acquire), guard)
            {
                Ok(_) => {
                    unsafe { guard.defer_destroy(current) };
                    return true;
                }
                Err(e) => {
                    current = e.current;
                    new = e.new;
                    match unsafe { current.as_ref() } {
                        Some(slot) if slot.0 == *old => (),
                        _ => return false,
                    }
                }
            }
        }
    }

    /// Deletes the value only if the current one equals `old`.
    ///
    /// The null left behind keeps the slot reusable, same as [`delete`][Entry::delete].
    pub(crate) fn try_compare_and_delete(&self, old: &V, guard: &Guard) -> bool
    where
        V: PartialEq,
    {
        let mut current = self.cell.load(Ordering::Acquire, guard);
        loop {
            match unsafe { current.as_ref() } {
                Some(slot) if slot.0 == *old => (),
                _ => return false,
            }
            match self.cell.compare_and_set(
                current,
                Shared::null(),
                (Ordering::AcqRel, Ordering::Acquire),
                guard,
            ) {
                Ok(_) => {
                    unsafe { guard.defer_destroy(current) };
                    return true;
                }
                Err(e) => current = e.current,
            }
        }
    }

    /// Nulls the slot out, returning the value it held.
    ///
    /// Fails if the slot is already null or expunged.
    pub(crate) fn delete<'g>(&self, guard: &'g Guard) -> Option<&'g V> {
        let mut current = self.cell.load(Ordering::Acquire, guard);
        loop {
            if current.is_null() {
                return None;
            }
            match self.cell.compare_and_set(
                current,
                Shared::null(),
                (Ordering::AcqRel, Ordering::Acquire),
                guard,
            ) {
                Ok(_) => {
                    unsafe { guard.defer_destroy(current) };
                    return Some(&unsafe { current.deref() }.0);
                }
                Err(e) => current = e.current,
            }
        }
    }

    /// Returns the present value, or stores the provided one into a null slot.
    ///
    /// If the slot is expunged nothing happens and the value is handed back for the locked path.
    pub(crate) fn try_load_or_store<'g>(
        &self,
        value: V,
        guard: &'g Guard,
    ) -> Result<ExistingOrNew<&'g V>, V> {
        let current = self.cell.load(Ordering::Acquire, guard);
        if flags(current).contains(CellFlags::EXPUNGED) {
            return Err(value);
        }
        if let Some(slot) = unsafe { current.as_ref() } {
            return Ok(ExistingOrNew::Existing(&slot.0));
        }
        let mut new = Owned::new(Slot(value));
        loop {
            match self.cell.compare_and_set(
                Shared::null(),
                new,
                (Ordering::AcqRel, Ordering::Acquire),
                guard,
            ) {
                Ok(stored) => return Ok(ExistingOrNew::New(&unsafe { stored.deref() }.0)),
                Err(e) => {
                    let current = e.current;
                    new = e.new;
                    if flags(current).contains(CellFlags::EXPUNGED) {
                        return Err(new.into_box().0);
                    }
                    if let Some(slot) = unsafe { current.as_ref() } {
                        // The Owned in `new` is dropped here, discarding the input value ‒ the
                        // caller gets the one that won.
                        return Ok(ExistingOrNew::Existing(&slot.0));
                    }
                    // Null again (a racing delete). Retry the store.
                }
            }
        }
    }

    /// Turns an expunged slot back into a plain null one.
    ///
    /// Reports whether the slot actually was expunged ‒ if so, the caller must re-insert the
    /// entry into the dirty overlay (both happen under the map mutex, so they are one step as
    /// far as other writers are concerned).
    pub(crate) fn unexpunge_locked(&self, guard: &Guard) -> bool {
        self.cell
            .compare_and_set(
                expunged(),
                Shared::null(),
                (Ordering::Release, Ordering::Relaxed),
                guard,
            )
            .is_ok()
    }

    /// Marks a null slot as expunged, so the lock-free write path keeps its hands off it.
    ///
    /// Returns the final verdict: true if the slot ended up (or already was) expunged, false if
    /// it holds a value ‒ then it must be carried over into the dirty overlay instead. Called
    /// only under the map mutex while building an overlay.
    pub(crate) fn try_expunge_locked(&self, guard: &Guard) -> bool {
        let mut current = self.cell.load(Ordering::Acquire, guard);
        while current.is_null() && !flags(current).contains(CellFlags::EXPUNGED) {
            match self.cell.compare_and_set(
                Shared::null(),
                expunged(),
                // Only the tag is inspected on failure, nothing gets dereferenced.
                (Ordering::Release, Ordering::Relaxed),
                guard,
            ) {
                Ok(_) => return true,
                Err(e) => current = e.current,
            }
        }
        flags(current).contains(CellFlags::EXPUNGED)
    }
}

impl<V> Drop for Entry<V> {
    fn drop(&mut self) {
        /*
         * &mut self means nobody can reach the *entry* any more. Readers may still be holding
         * `&V` borrows into the slot allocation though (they loaded it under an epoch guard and
         * only kept their own Arc on the entry for as long as the load itself) ‒ so the slot is
         * retired through the collector rather than freed in place.
         */
        let guard = crossbeam_epoch::pin();
        let current = self.cell.load(Ordering::Relaxed, &guard);
        if !current.is_null() {
            unsafe { guard.defer_destroy(current) };
        }
    }
}
