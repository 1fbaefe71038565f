use crate::memory_map::MemoryMap;
use crate::page::{multiple_of_page_size, page_size};
use std::io;
use std::mem::size_of;

/// The stack memory of a single coroutine.
///
/// The layout of the stack is as follows:
///
///     +--------------+ <- end of the mapping
///     |  guard page  |
///     +--------------+ <- top()
///     |              | |
///     |     stack    | | stack growth direction
///     |              | v
///     +--------------+ <- start()
///     |  guard page  |
///     +--------------+ <- start of the mapping
///
/// Both guard pages are inaccessible, so running off either end of the stack
/// traps instead of corrupting whatever memory happens to sit next to it. The
/// usable part is committed lazily, so a coroutine only pays for the pages it
/// actually touches.
///
/// Stacks can't grow or shrink after they are created.
pub(crate) struct GuardedStack {
    mem: MemoryMap,
    page: usize,
    size: usize,

    /// The number of bytes pushed using `push`.
    used: usize,
}

impl GuardedStack {
    pub(crate) fn new(size: usize) -> io::Result<Self> {
        let page = page_size();
        let size = multiple_of_page_size(size.max(1));
        let mut mem = MemoryMap::reserve(size + page + page, true)?;

        mem.grant(page, size)?;
        Ok(Self { mem, page, size, used: 0 })
    }

    /// Returns the lowest usable address.
    pub(crate) fn start(&self) -> *mut u8 {
        unsafe { self.mem.ptr.add(self.page) }
    }

    /// Returns the address just past the highest usable byte.
    pub(crate) fn top(&self) -> *mut u8 {
        unsafe { self.start().add(self.size) }
    }

    #[cfg(test)]
    pub(crate) fn size(&self) -> usize {
        self.size
    }

    /// Returns the current stack pointer, which starts out at `top()`.
    pub(crate) fn pointer(&self) -> *mut u8 {
        unsafe { self.top().sub(self.used) }
    }

    /// Pushes a machine word onto the stack.
    pub(crate) fn push(&mut self, value: usize) {
        let word = size_of::<usize>();

        assert!(self.used + word <= self.size, "the stack is full");
        self.used += word;

        unsafe { (self.pointer() as *mut usize).write(value) };
    }
}
