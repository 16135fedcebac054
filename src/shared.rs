use base::alloc::handle_alloc_error;
use base::borrow;
use base::boxed::Box;
use base::fmt;
use base::marker::{PhantomData, Unpin};
use base::mem;
use base::ops::Deref;
use base::ptr::{self, NonNull};

use crate::control::{self, ControlBlock};
use crate::{AllocError, ReferenceCounted, Weak};

/// A thread-safe shared owner of a resource.
///
/// Every clone of a `Shared` shares ownership of the same resource. When the last clone (or the
/// last handle promoted from a [`Weak`]) is dropped, the release action of the resource runs, on
/// whichever thread that happens to be.
///
/// A `Shared` can also be empty, owning nothing. Empty handles are what `Default` gives, what
/// [`Shared::reset`] leaves behind, and what a failed [`Weak::lock`] returns.
pub struct Shared<T: ?Sized> {
    // Cached so that access does not go through the control block.
    ptr: Option<NonNull<T>>,
    block: Option<NonNull<ControlBlock>>,
    phantom: PhantomData<T>,
}

unsafe impl<T: ?Sized + Sync + Send> Send for Shared<T> {}
unsafe impl<T: ?Sized + Sync + Send> Sync for Shared<T> {}

/// The release action of resources that were handed over in a `Box`.
fn drop_box<T: ?Sized>(ptr: *mut T) {
    drop(unsafe { Box::from_raw(ptr) });
}

impl<T: ?Sized> Shared<T> {
    /// An empty handle, owning nothing.
    pub const fn empty() -> Self {
        Shared {
            ptr: None,
            block: None,
            phantom: PhantomData,
        }
    }

    /// Take shared ownership of `ptr`, to be released by calling `release(ptr)` exactly once
    /// when the last owner goes away.
    ///
    /// `ptr` may be null. The resulting handle then owns a control block but no resource, and
    /// `release` is still called (with the null pointer) in the end.
    ///
    /// Aborts through `handle_alloc_error` if the control block cannot be allocated; `release`
    /// has been called on `ptr` by then. See [`Shared::try_from_raw`] for the fallible version.
    ///
    /// # Safety
    ///
    /// Unless it is null, `ptr` must be valid for shared reads until `release` is called, and
    /// nothing else may mutate the pointee through other pointers in the meantime (interior
    /// mutability aside).
    ///
    /// ```
    /// use std::sync::atomic::{AtomicBool, Ordering};
    /// use std::sync::Arc;
    /// use shared_handle::Shared;
    ///
    /// let released = Arc::new(AtomicBool::new(false));
    /// let flag = Arc::clone(&released);
    ///
    /// let raw = Box::into_raw(Box::new(String::from("hello")));
    /// let a = unsafe {
    ///     Shared::from_raw(raw, move |p: *mut String| {
    ///         drop(unsafe { Box::from_raw(p) });
    ///         flag.store(true, Ordering::SeqCst);
    ///     })
    /// };
    /// let b = a.clone();
    ///
    /// drop(a);
    /// assert!(!released.load(Ordering::SeqCst));
    /// assert_eq!(&*b, "hello");
    ///
    /// drop(b);
    /// assert!(released.load(Ordering::SeqCst));
    /// ```
    pub unsafe fn from_raw<D>(ptr: *mut T, release: D) -> Self
    where
        D: FnOnce(*mut T) + Send + 'static,
    {
        match unsafe { Self::try_from_raw(ptr, release) } {
            Ok(shared) => shared,
            Err(err) => handle_alloc_error(err.layout()),
        }
    }

    /// Like [`Shared::from_raw`], but reports a failed control block allocation as an
    /// [`AllocError`]. `release` has been called on `ptr` by the time the error is returned.
    ///
    /// # Safety
    ///
    /// Same as for [`Shared::from_raw`].
    pub unsafe fn try_from_raw<D>(ptr: *mut T, release: D) -> Result<Self, AllocError>
    where
        D: FnOnce(*mut T) + Send + 'static,
    {
        let block = control::allocate(ptr, release)?;

        Ok(Shared {
            ptr: NonNull::new(ptr),
            block: Some(block),
            phantom: PhantomData,
        })
    }

    /// Take shared ownership of a boxed value. The box is dropped when the last owner goes away.
    pub fn from_box(boxed: Box<T>) -> Self
    where
        T: 'static,
    {
        unsafe { Self::from_raw(Box::into_raw(boxed), drop_box::<T>) }
    }

    /// Like [`Shared::from_box`], but reports a failed control block allocation. The box has been
    /// dropped by the time the error is returned.
    pub fn try_from_box(boxed: Box<T>) -> Result<Self, AllocError>
    where
        T: 'static,
    {
        unsafe { Self::try_from_raw(Box::into_raw(boxed), drop_box::<T>) }
    }

    /// Assemble a handle from a pointer and a strong unit the caller hands over.
    pub(crate) unsafe fn from_parts(ptr: Option<NonNull<T>>, block: Option<NonNull<ControlBlock>>) -> Self {
        Shared {
            ptr,
            block,
            phantom: PhantomData,
        }
    }

    pub(crate) fn parts(&self) -> (Option<NonNull<T>>, Option<NonNull<ControlBlock>>) {
        (self.ptr, self.block)
    }

    #[inline]
    fn control(&self) -> Option<&ControlBlock> {
        // The strong unit we hold keeps the block allocated.
        self.block.map(|block| unsafe { &*block.as_ptr() })
    }

    /// A reference to the resource, or `None` for an empty handle (or a null resource).
    #[inline]
    pub fn get(&self) -> Option<&T> {
        // While we own a strong unit the release action has not run, so the pointer is valid.
        self.ptr.map(|ptr| unsafe { &*ptr.as_ptr() })
    }

    /// The cached resource pointer.
    #[inline]
    pub fn as_ptr(&self) -> Option<NonNull<T>> {
        self.ptr
    }

    /// Whether this handle has no resource to hand out.
    #[inline]
    pub fn is_null(&self) -> bool {
        self.ptr.is_none()
    }

    /// The number of strong owners of the resource, zero for an empty handle.
    ///
    /// This is a relaxed snapshot that other threads may invalidate at any moment. Use it for
    /// diagnostics, never to decide whether something is safe to do.
    pub fn use_count(&self) -> usize {
        self.control().map_or(0, ControlBlock::use_count)
    }

    /// Create a [`Weak`] observer of the resource.
    pub fn downgrade(&self) -> Weak<T> {
        Weak::from(self)
    }

    /// Release this handle's share and leave it empty.
    pub fn reset(&mut self) {
        drop(mem::take(self));
    }

    /// Release this handle's share and take shared ownership of `ptr` instead.
    ///
    /// The replacement is built first and then swapped in, so `self` is never observed half
    /// replaced.
    ///
    /// # Safety
    ///
    /// Same as for [`Shared::from_raw`].
    pub unsafe fn reset_with<D>(&mut self, ptr: *mut T, release: D)
    where
        D: FnOnce(*mut T) + Send + 'static,
    {
        let mut replacement = unsafe { Self::from_raw(ptr, release) };
        self.swap(&mut replacement);
    }

    /// Exchange the contents of two handles. No counts change.
    pub fn swap(&mut self, other: &mut Self) {
        mem::swap(self, other);
    }

    /// Whether both handles cache the same resource address. Two empty handles are equal.
    pub fn ptr_eq(this: &Self, other: &Self) -> bool {
        this.ptr.map(NonNull::cast::<u8>) == other.ptr.map(NonNull::cast::<u8>)
    }

    /// Whether both handles share the same control block, i.e. the same ownership.
    ///
    /// Handles produced by [`Shared::map`] share ownership with their source even though they
    /// point elsewhere.
    pub fn owner_eq(this: &Self, other: &Self) -> bool {
        this.block == other.block
    }

    /// Turn this handle into one that shares the same ownership but points at `f(&resource)`,
    /// typically a field of the resource or the resource as a trait object. No counts change.
    ///
    /// An empty handle or a null resource stays that way, `f` is not called.
    ///
    /// ```
    /// use std::fmt::Debug;
    /// use shared_handle::Shared;
    ///
    /// let pair = Shared::new((1u8, String::from("two")));
    /// let second: Shared<String> = Shared::map(pair.clone(), |p| &p.1);
    /// let debug = Shared::map::<dyn Debug + Send + Sync, _>(pair.clone(), |p| p);
    ///
    /// assert_eq!(&*second, "two");
    /// assert_eq!(format!("{:?}", debug), "(1, \"two\")");
    /// assert_eq!(pair.use_count(), 3);
    /// ```
    pub fn map<U, F>(this: Self, f: F) -> Shared<U>
    where
        T: Send + Sync,
        U: ?Sized,
        F: FnOnce(&T) -> &U,
    {
        let ptr = this.get().map(|resource| NonNull::from(f(resource)));
        let block = this.block;
        mem::forget(this);

        Shared {
            ptr,
            block,
            phantom: PhantomData,
        }
    }

    /// Like [`Shared::map`], but leaves `self` alone and adds a new strong owner.
    pub fn map_cloned<U, F>(&self, f: F) -> Shared<U>
    where
        T: Send + Sync,
        U: ?Sized,
        F: FnOnce(&T) -> &U,
    {
        Shared::map(self.clone(), f)
    }
}

impl<T> Shared<T> {
    /// Move `value` to the heap and take shared ownership of it.
    ///
    /// ```
    /// use shared_handle::Shared;
    ///
    /// let five = Shared::new(5);
    /// assert_eq!(*five, 5);
    /// assert_eq!(five.use_count(), 1);
    /// ```
    pub fn new(value: T) -> Self
    where
        T: 'static,
    {
        Shared::from_box(Box::new(value))
    }

    /// Like [`Shared::new`], but reports a failed control block allocation. `value` has been
    /// dropped by the time the error is returned.
    pub fn try_new(value: T) -> Result<Self, AllocError>
    where
        T: 'static,
    {
        Shared::try_from_box(Box::new(value))
    }
}

impl<T: ?Sized> Clone for Shared<T> {
    /// Makes a clone of the `Shared` handle, adding a strong owner.
    #[inline]
    fn clone(&self) -> Shared<T> {
        if let Some(control) = self.control() {
            control.increment_strong();
        }

        Shared {
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

impl<T: ?Sized> Drop for Shared<T> {
    /// Drops the `Shared` handle, releasing the resource if this was its last owner.
    #[inline]
    fn drop(&mut self) {
        if let Some(block) = self.block {
            unsafe { ControlBlock::decrement_strong(block) };
        }
    }
}

impl<T: ?Sized> Default for Shared<T> {
    /// An empty handle.
    fn default() -> Shared<T> {
        Shared::empty()
    }
}

impl<T: ?Sized> Deref for Shared<T> {
    type Target = T;

    /// # Panics
    ///
    /// Panics if the handle is empty or its resource is null.
    #[inline]
    fn deref(&self) -> &T {
        match self.get() {
            Some(resource) => resource,
            None => panic!("dereferenced an empty Shared handle"),
        }
    }
}

impl<T: ?Sized> borrow::Borrow<T> for Shared<T> {
    fn borrow(&self) -> &T {
        &**self
    }
}

impl<T: ?Sized> AsRef<T> for Shared<T> {
    fn as_ref(&self) -> &T {
        &**self
    }
}

impl<T: ?Sized + fmt::Debug> fmt::Debug for Shared<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.get() {
            Some(resource) => fmt::Debug::fmt(resource, f),
            None => f.write_str("(empty)"),
        }
    }
}

impl<T: ?Sized> fmt::Pointer for Shared<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.ptr {
            Some(ptr) => fmt::Pointer::fmt(&ptr, f),
            None => fmt::Pointer::fmt(&ptr::null::<u8>(), f),
        }
    }
}

impl<T: ?Sized> ReferenceCounted for Shared<T> {
    fn use_count(this: &Self) -> usize {
        this.use_count()
    }
}

impl<T: 'static> From<T> for Shared<T> {
    fn from(t: T) -> Self {
        Shared::new(t)
    }
}

impl<T: ?Sized + 'static> From<Box<T>> for Shared<T> {
    fn from(boxed: Box<T>) -> Self {
        Shared::from_box(boxed)
    }
}

impl<T: ?Sized> Unpin for Shared<T> {}
