//! The [`ExistingOrNew`][crate::ExistingOrNew] enum.

use std::ops::Deref;

/// Tells whether a looked-up value was already in place or was inserted by the call that
/// returned it.
///
/// Returned by [`SnapMap::load_or_store`][crate::SnapMap::load_or_store]. It dereferences to the
/// held value, so in code that doesn't care about the distinction it can be used as the value
/// directly.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum ExistingOrNew<T> {
    /// The value was present before the call.
    Existing(T),
    /// The value was inserted by the call.
    New(T),
}

impl<T> ExistingOrNew<T> {
    /// Extracts the value, losing the existing/new distinction.
    pub fn into_inner(self) -> T {
        match self {
            ExistingOrNew::Existing(value) => value,
            ExistingOrNew::New(value) => value,
        }
    }

    /// Transforms the value inside while keeping the existing/new distinction.
    pub fn map<U, F: FnOnce(T) -> U>(self, f: F) -> ExistingOrNew<U> {
        match self {
            ExistingOrNew::Existing(value) => ExistingOrNew::Existing(f(value)),
            ExistingOrNew::New(value) => ExistingOrNew::New(f(value)),
        }
    }

    /// Did the call that produced this insert the value?
    pub fn is_new(&self) -> bool {
        match self {
            ExistingOrNew::Existing(_) => false,
            ExistingOrNew::New(_) => true,
        }
    }
}

impl<T> Deref for ExistingOrNew<T> {
    type Target = T;
    fn deref(&self) -> &T {
        match self {
            ExistingOrNew::Existing(value) => value,
            ExistingOrNew::New(value) => value,
        }
    }
}
