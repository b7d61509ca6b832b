use std::fmt;
use std::ptr::NonNull;
use std::sync::atomic::{self, AtomicUsize};

const MAX_REF_COUNT: usize = usize::MAX / 2;

/// What happens to the allocation once the last reference is dropped.
pub enum Teardown {
    /// Deallocate without running element destructors.
    ///
    /// Only chosen for element types that don't need dropping.
    Free,
    /// Drop every element in place, then deallocate.
    DropElements,
    /// Memory is owned by someone else. The optional release hook is invoked
    /// exactly once, nothing is deallocated.
    External(Option<Box<dyn FnOnce() + Send + Sync>>),
}

impl fmt::Debug for Teardown {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Free => write!(f, "Free"),
            Self::DropElements => write!(f, "DropElements"),
            Self::External(hook) => write!(f, "External(hook={})", hook.is_some()),
        }
    }
}

/// Control block guarding a single allocation.
///
/// Aligned to a cache line so that concurrent count updates from worker
/// threads don't false share with neighboring data.
#[repr(C, align(64))]
struct ControlBlock<T> {
    ref_count: AtomicUsize,
    ptr: NonNull<T>,
    len: usize,
    capacity: usize,
    teardown: Teardown,
}

/// A reference counted, immutable buffer of `T`.
///
/// Cloning increments an intrusive atomic count stored in the control block.
/// Many array views can share one buffer, the buffer is torn down exactly
/// once when the last reference goes away.
pub struct SharedBuffer<T> {
    block: NonNull<ControlBlock<T>>,
}

// SAFETY: The buffer is immutable after construction, and the count is atomic.
// Sharing across threads requires `T` to be shareable.
unsafe impl<T: Send + Sync> Send for SharedBuffer<T> {}
unsafe impl<T: Send + Sync> Sync for SharedBuffer<T> {}

impl<T> SharedBuffer<T> {
    /// Take ownership of a vec's allocation.
    pub fn from_vec(values: Vec<T>) -> Self {
        let teardown = if std::mem::needs_drop::<T>() {
            Teardown::DropElements
        } else {
            Teardown::Free
        };

        let mut values = std::mem::ManuallyDrop::new(values);
        let len = values.len();
        let capacity = values.capacity();
        // Vec pointers are never null, even for empty vecs.
        let ptr = NonNull::new(values.as_mut_ptr()).unwrap_or(NonNull::dangling());

        Self::from_block(ControlBlock {
            ref_count: AtomicUsize::new(1),
            ptr,
            len,
            capacity,
            teardown,
        })
    }

    /// Wrap memory owned elsewhere.
    ///
    /// `release` is called once after the last reference is dropped.
    ///
    /// # Safety
    ///
    /// `ptr` must point to `len` initialized values that stay valid and
    /// unmodified until `release` is called (or forever if `release` is None).
    pub unsafe fn from_external(
        ptr: NonNull<T>,
        len: usize,
        release: Option<Box<dyn FnOnce() + Send + Sync>>,
    ) -> Self {
        Self::from_block(ControlBlock {
            ref_count: AtomicUsize::new(1),
            ptr,
            len,
            capacity: len,
            teardown: Teardown::External(release),
        })
    }

    fn from_block(block: ControlBlock<T>) -> Self {
        let block = Box::new(block);
        SharedBuffer {
            block: NonNull::from(Box::leak(block)),
        }
    }

    const fn block(&self) -> &ControlBlock<T> {
        // SAFETY: Block is valid for as long as any reference exists.
        unsafe { self.block.as_ref() }
    }

    pub fn len(&self) -> usize {
        self.block().len
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn as_slice(&self) -> &[T] {
        let block = self.block();
        // SAFETY: `len` elements were initialized at construction and the
        // buffer is never mutated.
        unsafe { std::slice::from_raw_parts(block.ptr.as_ptr().cast_const(), block.len) }
    }

    /// Current number of references.
    ///
    /// Only informational, may be stale by the time it's read.
    pub fn ref_count(&self) -> usize {
        self.block().ref_count.load(atomic::Ordering::Acquire)
    }

    /// Check if two handles share the same control block.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        self.block == other.block
    }
}

impl<T> Clone for SharedBuffer<T> {
    fn clone(&self) -> Self {
        // Relaxed is enough for increments, a new reference can only be formed
        // from an existing one.
        let prev = self
            .block()
            .ref_count
            .fetch_add(1, atomic::Ordering::Relaxed);
        if prev >= MAX_REF_COUNT {
            panic!("Ref count exceeded {MAX_REF_COUNT}");
        }
        SharedBuffer { block: self.block }
    }
}

impl<T> Drop for SharedBuffer<T> {
    fn drop(&mut self) {
        let prev = self
            .block()
            .ref_count
            .fetch_sub(1, atomic::Ordering::Release);
        if prev != 1 {
            return;
        }

        // Synchronize with every release decrement before tearing down.
        atomic::fence(atomic::Ordering::Acquire);

        // SAFETY: We held the last reference, nobody else can observe the
        // block anymore.
        let block = unsafe { Box::from_raw(self.block.as_ptr()) };
        let ControlBlock {
            ptr,
            len,
            capacity,
            teardown,
            ..
        } = *block;

        match teardown {
            Teardown::Free => {
                // SAFETY: Allocation came from a vec with this capacity. A
                // zero length means no element destructors run.
                drop(unsafe { Vec::from_raw_parts(ptr.as_ptr(), 0, capacity) });
            }
            Teardown::DropElements => {
                // SAFETY: Same as above, all `len` elements are initialized.
                drop(unsafe { Vec::from_raw_parts(ptr.as_ptr(), len, capacity) });
            }
            Teardown::External(release) => {
                if let Some(release) = release {
                    release();
                }
            }
        }
    }
}

impl<T: fmt::Debug> fmt::Debug for SharedBuffer<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedBuffer")
            .field("len", &self.len())
            .field("ref_count", &self.ref_count())
            .field("teardown", &self.block().teardown)
            .finish_non_exhaustive()
    }
}
