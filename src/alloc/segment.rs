//! Shared-memory arenas.
//!
//! A [`Segment`] is one fixed-size mapping owned by exactly one allocator.
//! On unix it is an anonymous shared mapping, so it stays visible to
//! processes forked after it was created.

use crate::alloc::page::{align_up, PAGE_SIZE};
use crate::error::{AllocError, Result};
use core::ptr::{self, NonNull};
use core::sync::atomic::{AtomicI32, Ordering};

static NEXT_SEGMENT_ID: AtomicI32 = AtomicI32::new(1);

#[cfg(unix)]
unsafe fn allocate_region(size: usize) -> Option<*mut u8> {
    let ptr = libc::mmap(
        ptr::null_mut(),
        size,
        libc::PROT_READ | libc::PROT_WRITE,
        libc::MAP_SHARED | libc::MAP_ANON,
        -1,
        0,
    );
    if ptr == libc::MAP_FAILED {
        None
    } else {
        Some(ptr.cast::<u8>())
    }
}

#[cfg(unix)]
unsafe fn free_region(ptr: *mut u8, size: usize) {
    libc::munmap(ptr.cast::<libc::c_void>(), size);
}

#[cfg(windows)]
unsafe fn allocate_region(size: usize) -> Option<*mut u8> {
    use windows_sys::Win32::System::Memory::{VirtualAlloc, MEM_COMMIT, MEM_RESERVE, PAGE_READWRITE};
    let ptr = VirtualAlloc(ptr::null_mut(), size, MEM_COMMIT | MEM_RESERVE, PAGE_READWRITE);
    if ptr.is_null() {
        None
    } else {
        Some(ptr.cast::<u8>())
    }
}

#[cfg(windows)]
unsafe fn free_region(ptr: *mut u8, _size: usize) {
    use windows_sys::Win32::System::Memory::{VirtualFree, MEM_RELEASE};
    VirtualFree(ptr.cast::<core::ffi::c_void>(), 0, MEM_RELEASE);
}

/// A fixed-capacity memory arena.
#[derive(Debug)]
pub struct Segment {
    base: NonNull<u8>,
    size: usize,
    mapped: usize,
    id: i32,
}

// The segment owns its mapping and is never aliased by another owner.
unsafe impl Send for Segment {}

impl Segment {
    /// Maps a zero-filled arena of `size` bytes.
    ///
    /// # Errors
    /// `InvalidArgument` for a zero size, `OutOfMemory` if the mapping fails.
    pub fn map(size: usize) -> Result<Self> {
        if size == 0 {
            return Err(AllocError::invalid("segment size must be non-zero"));
        }
        if size > usize::MAX - PAGE_SIZE {
            return Err(AllocError::OutOfMemory {
                requested: size,
                available: 0,
            });
        }
        let mapped = align_up(size, PAGE_SIZE);
        let base = unsafe { allocate_region(mapped) }
            .and_then(NonNull::new)
            .ok_or(AllocError::OutOfMemory {
                requested: mapped,
                available: 0,
            })?;
        Ok(Self {
            base,
            size,
            mapped,
            id: NEXT_SEGMENT_ID.fetch_add(1, Ordering::Relaxed),
        })
    }

    /// Start of the arena.
    #[inline]
    pub fn base(&self) -> NonNull<u8> {
        self.base
    }

    /// Usable size in bytes.
    #[inline]
    pub fn size(&self) -> usize {
        self.size
    }

    /// Process-unique id of this segment.
    #[inline]
    pub fn id(&self) -> i32 {
        self.id
    }

    /// Address of `offset`, if it lies inside the arena.
    pub fn ptr_at(&self, offset: usize) -> Option<NonNull<u8>> {
        if offset >= self.size {
            return None;
        }
        // SAFETY: offset is within the mapping.
        Some(unsafe { NonNull::new_unchecked(self.base.as_ptr().add(offset)) })
    }
}

impl Drop for Segment {
    fn drop(&mut self) {
        unsafe { free_region(self.base.as_ptr(), self.mapped) }
    }
}
