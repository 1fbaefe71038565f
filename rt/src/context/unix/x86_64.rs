use crate::stack::GuardedStack;

// RDI: a pointer to store the current stack pointer in.
// RSI: a pointer to the stack pointer to restore.
asm_func!(
    "portcullis_context_switch",
    "
    push rbp
    push rbx
    push r12
    push r13
    push r14
    push r15

    // Swap the stack pointers
    mov [rdi], rsp
    mov rsp, [rsi]

    pop r15
    pop r14
    pop r13
    pop r12
    pop rbx
    pop rbp

    ret
    "
);

// R12: the function to call.
// R13: the data argument to pass to the function.
asm_func!(
    "portcullis_context_start",
    "
    mov rdi, r13
    and rsp, -16
    call r12
    ud2
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
    // A null return address terminates backtraces taken on this stack.
    stack.push(0);
    stack.push(start);
    stack.push(0); // rbp
    stack.push(0); // rbx
    stack.push(func); // r12
    stack.push(data); // r13
    stack.push(0); // r14
    stack.push(0); // r15
}
