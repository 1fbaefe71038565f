#![macro_use]

/// Defines a global function written in assembly.
///
/// # Examples
///
///     asm_func!("portcullis_example", "ret");
macro_rules! asm_func {
    ($name: expr, $($body: tt)*) => {
        std::arch::global_asm!(concat!(
            ".global ", $name, "\n",
            $name, ":\n",
            $($body)*
        ));
    }
}
