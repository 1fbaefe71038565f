use crate::page::multiple_of_page_size;
use rustix::mm::{
    mmap_anonymous, mprotect, munmap, MapFlags, MprotectFlags, ProtFlags,
};
use std::io::{Error, Result as IoResult};
use std::ptr::null_mut;

/// A chunk of memory created using `mmap` and similar functions.
///
/// The memory starts out inaccessible. Access is granted per range using
/// `grant`, and only the pages actually touched are committed by the kernel.
pub(crate) struct MemoryMap {
    pub(crate) ptr: *mut u8,
    pub(crate) len: usize,
}

fn mmap_options(stack: bool) -> MapFlags {
    let base = MapFlags::PRIVATE | MapFlags::NORESERVE;

    if stack {
        base | MapFlags::STACK
    } else {
        base
    }
}

impl MemoryMap {
    /// Reserves `size` bytes (rounded up to whole pages) of address space.
    pub(crate) fn reserve(size: usize, stack: bool) -> IoResult<Self> {
        let size = multiple_of_page_size(size);
        let opts = mmap_options(stack);
        let res = unsafe {
            mmap_anonymous(null_mut(), size, ProtFlags::empty(), opts)
        };

        match res {
            Ok(ptr) => Ok(MemoryMap { ptr: ptr as *mut u8, len: size }),
            Err(e) => Err(Error::from_raw_os_error(e.raw_os_error())),
        }
    }

    /// Makes the range `start..start + len` readable and writable.
    ///
    /// Both `start` and `len` must be multiples of the page size.
    pub(crate) fn grant(&mut self, start: usize, len: usize) -> IoResult<()> {
        debug_assert!(start + len <= self.len);

        let res = unsafe {
            mprotect(
                self.ptr.add(start) as _,
                len,
                MprotectFlags::READ | MprotectFlags::WRITE,
            )
        };

        res.map_err(|e| Error::from_raw_os_error(e.raw_os_error()))
    }
}

impl Drop for MemoryMap {
    fn drop(&mut self) {
        unsafe {
            let _ = munmap(self.ptr as _, self.len);
        }
    }
}
