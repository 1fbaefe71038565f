use crate::stack::GuardedStack;

// X0: a pointer to store the current stack pointer in.
// X1: a pointer to the stack pointer to restore.
asm_func!(
    "portcullis_context_switch",
    "
    stp x29, x30, [sp, -16]!
    stp x20, x19, [sp, -16]!
    stp x22, x21, [sp, -16]!
    stp x24, x23, [sp, -16]!
    stp x26, x25, [sp, -16]!
    stp x28, x27, [sp, -16]!
    stp d9, d8, [sp, -16]!
    stp d11, d10, [sp, -16]!
    stp d13, d12, [sp, -16]!
    stp d15, d14, [sp, -16]!

    // Swap the stack pointers
    mov x9, sp
    str x9, [x0]
    ldr x8, [x1]
    mov sp, x8

    ldp d15, d14, [sp], 16
    ldp d13, d12, [sp], 16
    ldp d11, d10, [sp], 16
    ldp d9, d8, [sp], 16
    ldp x28, x27, [sp], 16
    ldp x26, x25, [sp], 16
    ldp x24, x23, [sp], 16
    ldp x22, x21, [sp], 16
    ldp x20, x19, [sp], 16
    ldp x29, x30, [sp], 16

    ret
    "
);

// X19: the function to call.
// X20: the data argument to pass to the function.
asm_func!(
    "portcullis_context_start",
    "
    mov x0, x20
    blr x19
    brk #1
    "
);

/// Writes a frame that `portcullis_context_switch` restores into a call to
/// `func(data)` through the start trampoline.
pub(crate) fn initial_frame(
    stack: &mut GuardedStack,
    start: usize,
    func: usize,
    data: usize,
) {
    // An empty frame record terminates backtraces taken on this stack, and
    // keeps the stack pointer 16 bytes aligned.
    stack.push(0);
    stack.push(0);
    stack.push(start); // x30
    stack.push(0); // x29
    stack.push(func); // x19
    stack.push(data); // x20

    // x21 up to and including x28, then d8 up to and including d15.
    for _ in 0..16 {
        stack.push(0);
    }
}
