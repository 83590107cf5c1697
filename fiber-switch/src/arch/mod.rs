// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Per-architecture context switch primitives.
//!
//! Every architecture provides the same three operations around one shared
//! representation: a suspended context is a small frame at the published
//! stack pointer, holding the resume PC and the callee-saved registers that
//! LLVM reserves (and which therefore cannot be handled as asm clobbers).
//! All other callee-saved registers are spilled by the compiler around the
//! `asm!` block, so repeated switches in one function pay for the spills
//! only once.
//!
//! - `init_stack` synthesizes such a frame on a fresh stack. Its resume PC
//!   is the architecture's `stack_init_trampoline` and its register slots
//!   smuggle the launch function and an opaque object pointer, so the first
//!   switch into the stack bootstraps the fiber with both in hand.
//! - `switch` publishes the current context through `save` and adopts the
//!   destination context. The argument word rides in the ABI's
//!   first-argument register and reappears untouched as the return value of
//!   the destination's own suspended `switch` (or as the launch argument).
//!   The store through `save` is a bare stack-pointer write; it reads back
//!   as `Some` because `Option<StackPointer>` shares the `usize` layout
//!   with `None` as zero.
//! - `switch_and_drop` adopts the destination without saving the current
//!   context; the abandoned stack may be unmapped immediately afterwards.

cfg_if::cfg_if! {
    if #[cfg(target_arch = "riscv64")] {
        mod riscv64;
        pub use riscv64::*;
    } else if #[cfg(target_arch = "aarch64")] {
        mod aarch64;
        pub use aarch64::*;
    } else if #[cfg(all(target_arch = "x86_64", not(windows)))] {
        mod x86_64;
        pub use x86_64::*;
    } else if #[cfg(all(target_arch = "x86_64", windows))] {
        mod x86_64_windows;
        pub use x86_64_windows::*;
    } else {
        compile_error!("unsupported target architecture");
    }
}
