//! Context switching between coroutine stacks
//!
//! An execution context is nothing more than the saved stack pointer of a
//! suspended stack. Everything else needed to resume it (the callee-saved
//! registers and the address to return to) is pushed onto that stack by
//! `switch` before the stack pointers are swapped.
//!
//! A fresh stack has nothing to resume yet, so `Context::prepare` writes a
//! frame that looks exactly like one saved by `switch`, with its return address
//! pointing to a small trampoline. The trampoline moves the entry function and
//! its data argument out of the restored registers and calls the function,
//! which must never return.
use crate::stack::GuardedStack;
use std::cell::Cell;
use std::ptr::null_mut;

mod unix;

// These functions are defined in the inline assembly macros, found in modules
// such as context/unix/x86_64.rs.
extern "C" {
    fn portcullis_context_switch(from: *mut *mut u8, to: *const *mut u8);
    fn portcullis_context_start();
}

/// The function a prepared context starts running.
pub(crate) type Entry = unsafe extern "C" fn(*mut u8) -> !;

/// The saved execution point of a stack that isn't running.
pub(crate) struct Context {
    stack_pointer: Cell<*mut u8>,
}

impl Context {
    /// Returns a context that is filled in the first time something switches
    /// away from it.
    pub(crate) fn new() -> Self {
        Context { stack_pointer: Cell::new(null_mut()) }
    }

    /// Sets up `stack` such that switching to this context calls
    /// `entry(data)` on that stack.
    pub(crate) fn prepare(
        &self,
        stack: &mut GuardedStack,
        entry: Entry,
        data: *mut u8,
    ) {
        let start = portcullis_context_start as usize;

        unix::initial_frame(stack, start, entry as usize, data as usize);
        self.stack_pointer.set(stack.pointer());
    }

    pub(crate) fn as_ptr(&self) -> *mut *mut u8 {
        self.stack_pointer.as_ptr()
    }
}

/// Saves the current execution point in `from` and resumes `to`.
///
/// This returns once another switch resumes `from`.
///
/// # Safety
///
/// `to` must point to a context that was either prepared, or saved by an
/// earlier switch and not resumed since. The stack it belongs to must still be
/// alive.
#[inline(always)]
pub(crate) unsafe fn switch(from: *mut *mut u8, to: *const *mut u8) {
    portcullis_context_switch(from, to);
}
