// The lifecycle state shared by every handle to one resource.
//
// A control block moves through three states and never back:
//
// - live: `strong > 0`, the resource may be used.
// - zombie: `strong == 0`, the resource has been released, but weak handles still keep the block
//   itself allocated so that they can observe the zero.
// - dead: `weak == 0`, the block has been deallocated.
//
// The strong owners collectively hold one unit of `weak`. That unit is given back only after the
// release action has run, so the block always outlives the resource.

use base::alloc::{alloc, dealloc, Layout};
use base::mem::ManuallyDrop;
use base::ptr::{self, NonNull};
use base::sync::atomic::AtomicUsize;
use base::sync::atomic::Ordering::{AcqRel, Acquire, Relaxed};

use log::{trace, warn};

use crate::AllocError;

/// A soft limit on the amount of references that may be made to a resource.
///
/// Going above this limit will panic (although not necessarily) at _exactly_
/// `MAX_REFCOUNT + 1` references.
const MAX_REFCOUNT: usize = (isize::MAX) as usize;

/// The two teardown phases of a typed control block, reached through a single indirection.
struct Teardown {
    /// Runs the release action on the resource.
    dispose: unsafe fn(NonNull<ControlBlock>),
    /// Deallocates the control block.
    destroy: unsafe fn(NonNull<ControlBlock>),
}

/// The type-erased part of a control block: two counters and the way to tear the rest down.
#[repr(C)]
pub(crate) struct ControlBlock {
    strong: AtomicUsize,
    weak: AtomicUsize,
    teardown: &'static Teardown,
}

// `header` must stay the first field so that a pointer to the typed block is a pointer to its
// header and back.
#[repr(C)]
struct TypedControlBlock<T: ?Sized, D> {
    header: ControlBlock,
    resource: *mut T,
    release: ManuallyDrop<D>,
}

impl<T: ?Sized, D: FnOnce(*mut T)> TypedControlBlock<T, D> {
    const TEARDOWN: Teardown = Teardown {
        dispose: Self::dispose,
        destroy: Self::destroy,
    };

    unsafe fn dispose(block: NonNull<ControlBlock>) {
        let this = block.cast::<Self>().as_ptr();

        // Only the `resource` and `release` fields are touched here, other threads may still be
        // reading the counters in the header.
        let (resource, release) = unsafe {
            (
                ptr::read(ptr::addr_of!((*this).resource)),
                ManuallyDrop::take(&mut *ptr::addr_of_mut!((*this).release)),
            )
        };

        release(resource);
    }

    unsafe fn destroy(block: NonNull<ControlBlock>) {
        // `release` was taken by `dispose` and `resource` is a plain pointer, so there is nothing
        // left to drop.
        unsafe { dealloc(block.as_ptr().cast(), Layout::new::<Self>()) };
    }
}

/// Allocate a control block for `resource` with `strong == 1` and `weak == 1`.
///
/// If the allocation fails, `release` is called on `resource` before the error is returned, so
/// the resource does not leak.
pub(crate) fn allocate<T, D>(resource: *mut T, release: D) -> Result<NonNull<ControlBlock>, AllocError>
where
    T: ?Sized,
    D: FnOnce(*mut T),
{
    let layout = Layout::new::<TypedControlBlock<T, D>>();
    let raw = unsafe { alloc(layout) }.cast::<TypedControlBlock<T, D>>();

    let block = match NonNull::new(raw) {
        Some(block) => block,
        None => {
            warn!(
                "could not allocate a {} byte control block, releasing the resource",
                layout.size()
            );
            release(resource);
            return Err(AllocError::new(layout));
        }
    };

    unsafe {
        block.as_ptr().write(TypedControlBlock {
            header: ControlBlock {
                strong: AtomicUsize::new(1),
                weak: AtomicUsize::new(1),
                teardown: &TypedControlBlock::<T, D>::TEARDOWN,
            },
            resource,
            release: ManuallyDrop::new(release),
        });
    }

    Ok(block.cast())
}

impl ControlBlock {
    /// Add a strong unit. The caller must already hold one, this never revives a released
    /// resource.
    #[inline]
    pub(crate) fn increment_strong(&self) {
        // Relaxed is enough: a new reference can only be formed from an existing one, and
        // handing that one to another thread already synchronizes.
        let old = self.strong.fetch_add(1, Relaxed);
        debug_assert!(old != 0, "copied a strong reference to a released resource");

        // Only reachable by leaking handles; continuing would eventually wrap to zero and free
        // the resource under live owners.
        if old > MAX_REFCOUNT {
            panic!("strong reference count overflow");
        }
    }

    /// Give back a strong unit. The thread that takes the count from one to zero releases the
    /// resource and then gives back the implicit weak unit.
    ///
    /// # Safety
    ///
    /// `this` must point to a control block the caller holds a strong unit of, and that unit
    /// must not be used afterwards.
    #[inline]
    pub(crate) unsafe fn decrement_strong(this: NonNull<Self>) {
        // `AcqRel`: releasing publishes everything this owner wrote, acquiring on the final
        // decrement makes all those writes visible to the release action.
        let strong = unsafe { &(*this.as_ptr()).strong };
        if strong.fetch_sub(1, AcqRel) != 1 {
            return;
        }

        trace!("releasing resource of control block {:p}", this);
        let teardown = unsafe { (*this.as_ptr()).teardown };
        unsafe {
            (teardown.dispose)(this);
            Self::decrement_weak(this);
        }
    }

    /// Add a weak unit. The caller must already hold a strong or weak unit.
    #[inline]
    pub(crate) fn increment_weak(&self) {
        let old = self.weak.fetch_add(1, Relaxed);

        if old > MAX_REFCOUNT {
            panic!("weak reference count overflow");
        }
    }

    /// Give back a weak unit. The thread that takes the count from one to zero deallocates the
    /// block.
    ///
    /// # Safety
    ///
    /// `this` must point to a control block the caller holds a weak unit of (possibly the
    /// implicit one), and `this` must not be used afterwards.
    #[inline]
    pub(crate) unsafe fn decrement_weak(this: NonNull<Self>) {
        let weak = unsafe { &(*this.as_ptr()).weak };
        if weak.fetch_sub(1, AcqRel) != 1 {
            return;
        }

        trace!("deallocating control block {:p}", this);
        let teardown = unsafe { (*this.as_ptr()).teardown };
        unsafe { (teardown.destroy)(this) };
    }

    /// Try to add a strong unit on behalf of a weak holder.
    ///
    /// Fails for good once the strong count has reached zero. On success the caller owns the new
    /// unit.
    pub(crate) fn try_promote(&self) -> bool {
        let mut n = self.strong.load(Relaxed);

        loop {
            if n == 0 {
                return false;
            }

            if n > MAX_REFCOUNT {
                panic!("strong reference count overflow");
            }

            // Acquire on success pairs with the release of earlier decrements, so the new owner
            // sees the resource as the previous owners left it.
            match self.strong.compare_exchange_weak(n, n + 1, Acquire, Relaxed) {
                Ok(_) => return true,
                Err(old) => n = old,
            }
        }
    }

    /// A relaxed snapshot of the strong count.
    #[inline]
    pub(crate) fn use_count(&self) -> usize {
        self.strong.load(Relaxed)
    }

    #[cfg(test)]
    fn weak_count(&self) -> usize {
        self.weak.load(Relaxed)
    }
}
