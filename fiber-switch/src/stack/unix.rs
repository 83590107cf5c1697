// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::stack::{FiberStack, MIN_STACK_SIZE, StackPointer};
use std::io::Error;
use std::ptr;

/// An mmap-backed stack with a guard page below it, so that overflow faults
/// instead of silently corrupting adjacent memory.
pub struct DefaultFiberStack {
    top: StackPointer,
    mmap_len: usize,
    valgrind_id: u64,
}

impl DefaultFiberStack {
    /// Creates a new stack which has at least the given capacity.
    ///
    /// # Errors
    ///
    /// Returns the OS error if the mapping cannot be created or protected.
    ///
    /// # Panics
    ///
    /// Panics if the mapping size overflows `usize`.
    pub fn new(size: usize) -> std::io::Result<Self> {
        // Apply minimum stack size.
        let size = size.max(MIN_STACK_SIZE);

        // Add a guard page to the requested size and round the size up to
        // a page boundary.
        let page_size = page_size();
        let mmap_len = size
            .checked_add(page_size + page_size - 1)
            .expect("integer overflow while calculating stack size")
            & !(page_size - 1);

        // OpenBSD requires MAP_STACK on anything that is used as a stack.
        cfg_if::cfg_if! {
            if #[cfg(target_os = "openbsd")] {
                let map_flags = libc::MAP_ANONYMOUS | libc::MAP_PRIVATE | libc::MAP_STACK;
            } else {
                let map_flags = libc::MAP_ANONYMOUS | libc::MAP_PRIVATE;
            }
        }

        // Safety: anonymous mapping with a null hint; the region is only
        // handed out through this type.
        unsafe {
            // Reserve some address space for the stack.
            let mmap = libc::mmap(ptr::null_mut(), mmap_len, libc::PROT_NONE, map_flags, -1, 0);
            if mmap == libc::MAP_FAILED {
                return Err(Error::last_os_error());
            }

            // Create the result here. If the mprotect call fails then this
            // will be dropped and the memory will be unmapped.
            let out = Self {
                top: StackPointer::new(mmap as usize + mmap_len)
                    .expect("mmap returned a mapping ending at the null page"),
                mmap_len,
                valgrind_id: valgrind_stack_register(mmap as usize, mmap as usize + mmap_len),
            };

            // Make everything except the lowest page writable; that page
            // stays PROT_NONE as the guard.
            if libc::mprotect(
                mmap.cast::<u8>().add(page_size).cast(),
                mmap_len - page_size,
                libc::PROT_READ | libc::PROT_WRITE,
            ) != 0
            {
                return Err(Error::last_os_error());
            }

            Ok(out)
        }
    }
}

impl Drop for DefaultFiberStack {
    fn drop(&mut self) {
        // De-register the stack first.
        valgrind_stack_deregister(self.valgrind_id);

        // Safety: the mapping was created in `new` with exactly this length
        // and is unmapped only here.
        unsafe {
            let mmap = self.top.get() - self.mmap_len;
            let ret = libc::munmap(mmap as *mut libc::c_void, self.mmap_len);
            debug_assert_eq!(ret, 0);
        }
    }
}

// Safety: the mapping is exclusively owned and `top` is page-aligned, which
// satisfies STACK_ALIGNMENT on every supported target.
unsafe impl FiberStack for DefaultFiberStack {
    fn top(&self) -> StackPointer {
        self.top
    }

    fn bottom(&self) -> StackPointer {
        StackPointer::new(self.top.get() - self.mmap_len)
            .expect("stack mapping starts at the null page")
    }
}

fn page_size() -> usize {
    // Safety: sysconf(_SC_PAGESIZE) has no preconditions.
    let pagesize = unsafe { libc::sysconf(libc::_SC_PAGESIZE) } as usize;
    assert!(pagesize.is_power_of_two());
    pagesize
}

// Valgrind must be told when a mapping is used as a stack, otherwise it gets
// confused when the stack pointer moves to a different address range. The
// client requests below are magic instruction sequences that Valgrind
// recognizes and real hardware executes as NOPs.

const VG_STACK_REGISTER: u64 = 0x1501;
const VG_STACK_DEREGISTER: u64 = 0x1502;

/// Registers the mapping as a stack with Valgrind; the returned id is passed
/// to [`valgrind_stack_deregister`] before the mapping goes away. Returns a
/// dummy id when not running under Valgrind (or on riscv64, which Valgrind
/// does not support).
fn valgrind_stack_register(bottom: usize, top: usize) -> u64 {
    valgrind_request([VG_STACK_REGISTER, bottom as u64, top as u64, 0, 0, 0])
}

fn valgrind_stack_deregister(id: u64) {
    valgrind_request([VG_STACK_DEREGISTER, id, 0, 0, 0, 0]);
}

cfg_if::cfg_if! {
    if #[cfg(target_arch = "x86_64")] {
        fn valgrind_request(args: [u64; 6]) -> u64 {
            let result;
            // Safety: executes as a NOP outside of Valgrind; `args` outlives
            // the asm block.
            unsafe {
                core::arch::asm!(
                    "rol rdi, 3",
                    "rol rdi, 13",
                    "rol rdi, 61",
                    "rol rdi, 51",
                    "xchg rbx, rbx",
                    inout("rdx") 0u64 => result,
                    in("rax") args.as_ptr(),
                    options(nostack),
                );
            }
            result
        }
    } else if #[cfg(target_arch = "aarch64")] {
        fn valgrind_request(args: [u64; 6]) -> u64 {
            let result;
            // Safety: executes as a NOP outside of Valgrind; `args` outlives
            // the asm block.
            unsafe {
                core::arch::asm!(
                    "ror x12, x12, #3",
                    "ror x12, x12, #13",
                    "ror x12, x12, #61",
                    "ror x12, x12, #51",
                    "orr x10, x10, x10",
                    inout("x3") 0u64 => result,
                    in("x4") args.as_ptr(),
                    options(nostack),
                );
            }
            result
        }
    } else {
        // Valgrind has no riscv64 support; nothing to announce.
        fn valgrind_request(_args: [u64; 6]) -> u64 {
            0
        }
    }
}
