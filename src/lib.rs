//! Thread-safe shared ownership with weak observers.
//!
//! A [`Shared`] handle keeps a resource alive; when the last one goes away the resource's
//! release action runs, on whichever thread dropped it. A [`Weak`] handle observes the same
//! resource without keeping it alive and can be promoted back to a [`Shared`] as long as the
//! resource has not been released yet.
//!
//! ```
//! use shared_handle::{Shared, Weak};
//!
//! let strong = Shared::new(42);
//! let weak = Weak::from(&strong);
//!
//! assert_eq!(*weak.lock(), 42);
//!
//! drop(strong);
//! assert!(weak.lock().get().is_none());
//! assert!(weak.expired());
//! ```
//!
//! There is no cycle detection: two resources holding `Shared` handles to each other are never
//! released. Break cycles with `Weak`.

#![no_std]
#![allow(unused_unsafe)]
extern crate maybe_std as base;

#[cfg(test)]
extern crate std;

/// A handle that takes part in the reference counting of a shared resource and exposes the
/// number of owners in its API.
pub trait ReferenceCounted: Clone {
    /// Get the number of owning handles referring to the same resource, or zero for an empty
    /// handle.
    ///
    /// The value is a relaxed snapshot. Other threads may change it at any time, so it is fit
    /// for diagnostics but not for deciding anything.
    fn use_count(this: &Self) -> usize;

    /// Whether the resource is gone (or there never was one).
    ///
    /// Unlike `use_count`, a `true` result is stable: once the count hits zero it stays there.
    fn expired(this: &Self) -> bool {
        Self::use_count(this) == 0
    }
}

mod control;

mod error;
pub use error::*;

mod shared;
pub use shared::*;

mod weak;
pub use weak::*;
