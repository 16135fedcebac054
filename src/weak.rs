use base::fmt;
use base::marker::{PhantomData, Unpin};
use base::mem;
use base::ptr::NonNull;

use crate::control::ControlBlock;
use crate::{ReferenceCounted, Shared};

/// A non-owning observer of a resource held by [`Shared`] handles.
///
/// A `Weak` never keeps the resource alive. The only way to reach the resource through it is
/// [`Weak::lock`], which hands out a new [`Shared`] owner if the resource has not been released
/// yet. Weak handles keep the control block allocated, so probing a released resource is always
/// safe.
///
/// Use `Weak` for back references, otherwise two resources owning each other are never released.
pub struct Weak<T: ?Sized> {
    // Only valid to follow after a successful promotion.
    ptr: Option<NonNull<T>>,
    block: Option<NonNull<ControlBlock>>,
    phantom: PhantomData<T>,
}

unsafe impl<T: ?Sized + Sync + Send> Send for Weak<T> {}
unsafe impl<T: ?Sized + Sync + Send> Sync for Weak<T> {}

impl<T: ?Sized> Weak<T> {
    /// An empty observer. [`Weak::lock`] always fails on it.
    pub const fn new() -> Self {
        Weak {
            ptr: None,
            block: None,
            phantom: PhantomData,
        }
    }

    #[inline]
    fn control(&self) -> Option<&ControlBlock> {
        // Our weak unit keeps the block allocated, even after the resource is gone.
        self.block.map(|block| unsafe { &*block.as_ptr() })
    }

    /// Try to become an owner of the resource.
    ///
    /// Returns a new [`Shared`] handle if the resource is still alive, an empty one otherwise.
    /// Never blocks. A `lock` racing with the drop of the last owner either wins, keeping the
    /// resource alive, or fails; it never hands out a resource that is being released.
    ///
    /// ```
    /// use shared_handle::{Shared, Weak};
    ///
    /// let owner = Shared::new(String::from("alive"));
    /// let observer = Weak::from(&owner);
    ///
    /// {
    ///     let promoted = observer.lock();
    ///     assert_eq!(&*promoted, "alive");
    ///     assert_eq!(owner.use_count(), 2);
    /// }
    /// assert_eq!(owner.use_count(), 1);
    ///
    /// drop(owner);
    /// assert!(observer.lock().is_null());
    /// ```
    pub fn lock(&self) -> Shared<T> {
        match self.control() {
            // The successful promotion already counted the strong unit we hand over.
            Some(control) if control.try_promote() => unsafe { Shared::from_parts(self.ptr, self.block) },
            _ => Shared::empty(),
        }
    }

    /// The number of strong owners of the resource, zero for an empty observer.
    ///
    /// This is a relaxed snapshot. Only a zero is meaningful, since the count never rises again
    /// once it got there.
    pub fn use_count(&self) -> usize {
        self.control().map_or(0, ControlBlock::use_count)
    }

    /// Whether the resource has been released (or there never was one).
    ///
    /// A `true` answer is final. A `false` answer may be outdated by the time it is returned; to
    /// actually use the resource, go through [`Weak::lock`].
    pub fn expired(&self) -> bool {
        self.use_count() == 0
    }

    /// Stop observing and become empty.
    pub fn reset(&mut self) {
        drop(mem::take(self));
    }

    /// Exchange the contents of two observers. No counts change.
    pub fn swap(&mut self, other: &mut Self) {
        mem::swap(self, other);
    }

    /// Whether both observers (and the resource) share the same control block.
    pub fn owner_eq(this: &Self, other: &Self) -> bool {
        this.block == other.block
    }

    /// Turn this observer into one of the same resource that hands out `f(ptr)` when locked,
    /// typically the resource as a trait object. No counts change. An empty observer stays
    /// empty and `f` is not called.
    ///
    /// # Safety
    ///
    /// `f` must not dereference its argument, the resource may already be gone. The pointer it
    /// returns must be derived from its argument and point into the resource, so that it is
    /// valid whenever the resource is.
    ///
    /// ```
    /// use std::fmt::Debug;
    /// use std::ptr::NonNull;
    /// use shared_handle::{Shared, Weak};
    ///
    /// let owner = Shared::new(5u32);
    /// let weak: Weak<dyn Debug + Send + Sync> =
    ///     unsafe { Weak::map_raw(owner.downgrade(), |p: NonNull<u32>| p as NonNull<dyn Debug + Send + Sync>) };
    ///
    /// assert_eq!(format!("{:?}", weak.lock()), "5");
    /// ```
    pub unsafe fn map_raw<U, F>(this: Self, f: F) -> Weak<U>
    where
        T: Send + Sync,
        U: ?Sized,
        F: FnOnce(NonNull<T>) -> NonNull<U>,
    {
        let ptr = this.ptr.map(f);
        let block = this.block;
        mem::forget(this);

        Weak {
            ptr,
            block,
            phantom: PhantomData,
        }
    }

    /// Like [`Weak::map_raw`], but leaves `self` alone and adds a new observer.
    ///
    /// # Safety
    ///
    /// Same as for [`Weak::map_raw`].
    pub unsafe fn map_raw_cloned<U, F>(&self, f: F) -> Weak<U>
    where
        T: Send + Sync,
        U: ?Sized,
        F: FnOnce(NonNull<T>) -> NonNull<U>,
    {
        unsafe { Weak::map_raw(self.clone(), f) }
    }
}

impl<T: ?Sized> From<&Shared<T>> for Weak<T> {
    /// Start observing the resource of `shared`. An empty `shared` gives an empty observer.
    fn from(shared: &Shared<T>) -> Self {
        let (ptr, block) = shared.parts();

        if let Some(block) = block {
            // `shared` holds a strong unit, and with it the implicit weak unit.
            unsafe { block.as_ref() }.increment_weak();
        }

        Weak {
            ptr,
            block,
            phantom: PhantomData,
        }
    }
}

impl<T: ?Sized> Clone for Weak<T> {
    /// Makes a clone of the `Weak` observer, adding a weak unit.
    #[inline]
    fn clone(&self) -> Weak<T> {
        if let Some(control) = self.control() {
            control.increment_weak();
        }

        Weak {
            ptr: self.ptr,
            block: self.block,
            phantom: PhantomData,
        }
    }

    fn clone_from(&mut self, source: &Self) {
        let mut replacement = source.clone();
        self.swap(&mut replacement);
    }
}

impl<T: ?Sized> Drop for Weak<T> {
    /// Drops the `Weak` observer. This never releases the resource, but may deallocate the
    /// control block if the resource is already gone.
    #[inline]
    fn drop(&mut self) {
        if let Some(block) = self.block {
            unsafe { ControlBlock::decrement_weak(block) };
        }
    }
}

impl<T: ?Sized> Default for Weak<T> {
    /// An empty observer.
    fn default() -> Weak<T> {
        Weak::new()
    }
}

impl<T: ?Sized> fmt::Debug for Weak<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("(Weak)")
    }
}

impl<T: ?Sized> ReferenceCounted for Weak<T> {
    fn use_count(this: &Self) -> usize {
        this.use_count()
    }
}

impl<T: ?Sized> Unpin for Weak<T> {}
