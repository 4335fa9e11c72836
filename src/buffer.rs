//! Host memory, and the buffers allocated from it

use core::{
    cell::UnsafeCell,
    ptr::NonNull,
    sync::atomic::{AtomicBool, Ordering},
};

use crate::bd::Bdt;

/// Memory buffer allocator
///
/// Allocates from the top of the region, down towards the start.
/// A [`Checkpoint`] lets the host release everything that was
/// allocated after it, all at once.
pub struct Allocator {
    start: *mut u8,
    ptr: *mut u8,
}

/// A position in the allocator, taken with [`Allocator::checkpoint`]
#[derive(Clone, Copy)]
pub struct Checkpoint(*mut u8);

// Safety: the allocator exclusively owns its region.
unsafe impl Send for Allocator {}
unsafe impl Send for Checkpoint {}

impl Allocator {
    /// # Safety
    ///
    /// Caller must ensure `start` points to an allocation of size. Caller must
    /// ensure that no one else is using this memory for anything else.
    pub unsafe fn new(start: NonNull<u8>, size: usize) -> Self {
        let start = start.as_ptr();
        let ptr = start.add(size);
        Allocator { start, ptr }
    }
    /// Allocates a buffer of `size`
    ///
    /// The buffer returned from `allocate` is guaranteed to be at least `size`
    /// bytes large.
    pub fn allocate(&mut self, size: usize) -> Option<Buffer> {
        let ptr = self.ptr as usize;
        let new_ptr = ptr.checked_sub(size)?;
        let start = self.start as usize;
        if new_ptr < start {
            None
        } else {
            self.ptr = new_ptr as *mut u8;
            NonNull::new(self.ptr).map(|ptr| Buffer { ptr, len: size })
        }
    }
    /// Represents an `Allocator` that does not allocate any memory
    pub fn empty() -> Self {
        Allocator {
            start: core::ptr::null_mut(),
            ptr: core::ptr::null_mut(),
        }
    }
    /// Remember the current allocation position
    pub fn checkpoint(&self) -> Checkpoint {
        Checkpoint(self.ptr)
    }
    /// Release every buffer allocated after `checkpoint`
    ///
    /// # Safety
    ///
    /// Caller must ensure that none of the released buffers are still in use.
    pub unsafe fn restore(&mut self, checkpoint: Checkpoint) {
        self.ptr = checkpoint.0;
    }
    /// Number of bytes still available
    pub fn available(&self) -> usize {
        (self.ptr as usize).saturating_sub(self.start as usize)
    }
}

/// A memory buffer
///
/// Either a region allocated from [`HostMemory`], or a caller's
/// `&'static mut [u8]` leased to the host for the duration of a transfer.
pub struct Buffer {
    ptr: NonNull<u8>,
    len: usize,
}

// Safety: a buffer is exclusively owned by whoever holds the `Buffer`.
unsafe impl Send for Buffer {}

impl Buffer {
    /// Lease a static buffer to the host
    pub(crate) fn from_static(buffer: &'static mut [u8]) -> Self {
        let len = buffer.len();
        Buffer {
            ptr: NonNull::from(buffer).cast(),
            len,
        }
    }
    /// Return a leased buffer to its owner
    ///
    /// # Safety
    ///
    /// The buffer must have come from [`from_static`](Buffer::from_static),
    /// and no transaction may still be using it.
    pub(crate) unsafe fn into_static(self) -> &'static mut [u8] {
        core::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len)
    }
    pub fn len(&self) -> usize {
        self.len
    }
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
    /// Pointer to the byte at `offset`, clamped to the end of the buffer
    pub(crate) fn ptr_at(&self, offset: usize) -> *mut u8 {
        // Safety: offset is clamped to the allocation.
        unsafe { self.ptr.as_ptr().add(offset.min(self.len)) }
    }
    /// View the buffer
    ///
    /// # Safety
    ///
    /// No transaction may be writing to the buffer.
    pub(crate) unsafe fn as_slice(&self) -> &[u8] {
        core::slice::from_raw_parts(self.ptr.as_ptr(), self.len)
    }
    /// Mutably view the buffer
    ///
    /// # Safety
    ///
    /// No transaction may be using the buffer.
    pub(crate) unsafe fn as_mut_slice(&mut self) -> &mut [u8] {
        core::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len)
    }
}

/// Static memory for one USB host
///
/// Holds the buffer descriptor table, and the pool from which the host
/// allocates descriptor and isochronous buffers. `SIZE` is the size of
/// the pool, in bytes.
///
/// ```
/// use usbh_core::HostMemory;
/// static MEMORY: HostMemory<2048> = HostMemory::new();
/// ```
pub struct HostMemory<const SIZE: usize> {
    bdt: Bdt,
    pool: UnsafeCell<[u8; SIZE]>,
    taken: AtomicBool,
}

// Safety: access to the pool is guarded by the `taken` flag. After it's
// taken, the only user is the host that took it.
unsafe impl<const SIZE: usize> Sync for HostMemory<SIZE> {}

impl<const SIZE: usize> HostMemory<SIZE> {
    pub const fn new() -> Self {
        HostMemory {
            bdt: Bdt::new(),
            pool: UnsafeCell::new([0; SIZE]),
            taken: AtomicBool::new(false),
        }
    }

    /// Acquire the table and an allocator over the pool
    ///
    /// Returns `None` if the memory was already taken.
    pub(crate) fn take(&'static self) -> Option<(&'static Bdt, Allocator)> {
        if self.taken.swap(true, Ordering::SeqCst) {
            return None;
        }
        // Safety: the flag guarantees we're the only user of the pool. The
        // pool pointer is never null.
        let allocator =
            unsafe { Allocator::new(NonNull::new_unchecked(self.pool.get().cast()), SIZE) };
        Some((&self.bdt, allocator))
    }
}

impl<const SIZE: usize> Default for HostMemory<SIZE> {
    fn default() -> Self {
        Self::new()
    }
}
