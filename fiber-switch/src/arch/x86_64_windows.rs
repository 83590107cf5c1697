//! ## Stack layout
//!
//! Windows keeps the bounds of the current stack in the Thread Environment
//! Block, and the kernel consults them for guard page handling and stack
//! growth, so a context here is the x86_64 frame widened by the TEB stack
//! fields. A suspended fiber stores at the published stack pointer:
//!
//! ```text
//! +----------------------+
//! | Saved RBP            |  <- sp + 56
//! +----------------------+
//! | Saved RBX            |  <- sp + 48
//! +----------------------+
//! | GuaranteedStackBytes |  <- sp + 40
//! +----------------------+
//! | DeallocationStack    |  <- sp + 32
//! +----------------------+
//! | StackLimit           |  <- sp + 24
//! +----------------------+
//! | StackBase            |  <- sp + 16
//! +----------------------+
//! | ExceptionList        |  <- sp + 8
//! +----------------------+
//! | Resume PC            |  <- sp
//! +----------------------+
//! ```
//!
//! A freshly initialized stack carries the same frame with the TEB slots
//! filled from the stack's own bounds, the end-of-chain `ExceptionList`
//! value, and the launch function / object pointer smuggled through the RBP
//! and RBX slots.
//!
//! The switch bodies use SysV argument registers and `clobber_abi("sysv64")`
//! even though this is a Windows target: that clobber set covers RSI, RDI
//! and XMM6-XMM15, which the Microsoft ABI preserves, so the compiler spills
//! them and the assembly only handles RBX, RBP and the TEB fields. The
//! trampoline moves the arguments into Microsoft ABI registers before
//! entering the launch function.

use crate::Word;
use crate::stack::{FiberStack, StackPointer};
use crate::utils::push;
use core::arch::{asm, naked_asm};

pub const STACK_ALIGNMENT: usize = 16;

#[inline]
pub unsafe fn init_stack<T>(
    stack: &dyn FiberStack,
    func: unsafe extern "C-unwind" fn(arg: Word, obj: *mut T) -> !,
    obj: *mut T,
) -> StackPointer {
    // Safety: ensured by caller
    unsafe {
        let mut sp = stack.top().get();
        let teb = stack.teb_fields();

        // Launch function, restored into RBP by the first switch in.
        push(&mut sp, Some(func as usize));
        // Object pointer, restored into RBX.
        push(&mut sp, Some(obj as usize));

        // TEB stack fields for the new stack.
        push(&mut sp, Some(teb.GuaranteedStackBytes));
        push(&mut sp, Some(teb.StackBottomPlusGuard));
        push(&mut sp, Some(teb.StackBottom));
        push(&mut sp, Some(teb.StackTop));
        // End-of-chain ExceptionList. Not used on Win64 but it *is* used by
        // Wine.
        push(&mut sp, Some(usize::MAX));

        // Resume PC.
        push(&mut sp, Some(stack_init_trampoline as usize));

        StackPointer::new_unchecked(sp)
    }
}

#[unsafe(naked)]
unsafe extern "C" fn stack_init_trampoline() {
    naked_asm! {
        ".balign 16",
        ".seh_proc stack_init_trampoline",
        ".seh_endprologue",
        // switch() restored our synthetic frame before jumping here:
        // - RSP points at the stack top, 16-byte aligned.
        // - The TEB stack fields already describe this stack.
        // - RDI carries the argument word from the first switch.
        // - RBX carries the object pointer.
        // - RBP carries the launch function.
        //
        // The launch function is `extern "C"`, which on this target means
        // the Microsoft ABI: arguments in RCX/RDX and 32 bytes of shadow
        // space above the return address.
        "mov rcx, rdi",
        "mov rdx, rbx",
        "mov rax, rbp",
        // Terminate the frame pointer chain so a backtrace stops at the
        // stack top instead of wandering into another fiber's stack.
        "xor ebp, ebp",
        "xor ebx, ebx",
        // Shadow space plus a null return address; the launch function
        // never returns.
        "sub rsp, 32",
        "push rbp",
        "jmp rax",
        // Keep the SEH epilog scanner from running off the function.
        "int3",
        ".seh_endproc",
    }
}

/// Suspend the current context and resume the one published at `dst`.
#[inline]
pub unsafe fn switch(arg: Word, dst: StackPointer, save: *mut Option<StackPointer>) -> Word {
    let ret;

    // Safety: inline assembly
    unsafe {
        asm! {
            // Save RBX and RBP. Ideally these would be plain clobbers but
            // they are LLVM reserved registers and must be spilled by hand.
            "push rbp",
            "push rbx",

            // Save the TEB stack fields.
            "push qword ptr gs:[0x1748]", // GuaranteedStackBytes
            "push qword ptr gs:[0x1478]", // DeallocationStack
            "push qword ptr gs:[0x10]",   // StackLimit
            "push qword ptr gs:[0x8]",    // StackBase
            "push qword ptr gs:[0x0]",    // ExceptionList

            // Push the resume PC for whoever switches back to us.
            "lea rax, [rip + 2f]",
            "push rax",

            // Publish our saved context.
            "mov [rsi], rsp",

            // Adopt the destination context: restore its TEB fields and
            // reserved registers and jump to its resume PC.
            "mov rsp, rdx",
            "pop rax",
            "pop qword ptr gs:[0x0]",    // ExceptionList
            "pop qword ptr gs:[0x8]",    // StackBase
            "pop qword ptr gs:[0x10]",   // StackLimit
            "pop qword ptr gs:[0x1478]", // DeallocationStack
            "pop qword ptr gs:[0x1748]", // GuaranteedStackBytes
            "pop rbx",
            "pop rbp",
            "jmp rax",

            // Control reappears here when some fiber switches back to this
            // context, with registers and TEB fields already restored by
            // its switch code.
            "2:",

            // RDI carries the transferred word in both directions; the
            // switch path never touches it.
            inlateout("rdi") arg => ret,
            in("rsi") save,
            in("rdx") dst.get(),
            // Mark the remaining callee-saved registers as clobbered. The
            // sysv64 set additionally covers RSI, RDI and XMM6-XMM15, which
            // this target's ABI preserves.
            lateout("r12") _, lateout("r13") _, lateout("r14") _, lateout("r15") _,
            clobber_abi("sysv64"),
        }
    }

    ret
}

/// Terminal form of [`switch`]: the current context is not saved and its
/// stack is never touched again.
#[inline(always)]
pub unsafe fn switch_and_drop(arg: Word, dst: StackPointer) -> ! {
    // Safety: inline assembly
    unsafe {
        asm! {
            "mov rsp, rdx",
            "pop rax",
            "pop qword ptr gs:[0x0]",    // ExceptionList
            "pop qword ptr gs:[0x8]",    // StackBase
            "pop qword ptr gs:[0x10]",   // StackLimit
            "pop qword ptr gs:[0x1478]", // DeallocationStack
            "pop qword ptr gs:[0x1748]", // GuaranteedStackBytes
            "pop rbx",
            "pop rbp",
            "jmp rax",

            in("rdi") arg,
            in("rdx") dst.get(),
            options(noreturn),
        }
    }
}
