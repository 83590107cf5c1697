//! Per-fiber stack provisioning.

cfg_if::cfg_if! {
    if #[cfg(unix)] {
        mod unix;
        pub use unix::DefaultFiberStack;
    } else if #[cfg(windows)] {
        mod windows;
        pub use windows::DefaultFiberStack;
    } else {
        compile_error!("unsupported target platform");
    }
}

pub(crate) type StackPointer = core::num::NonZeroUsize;

/// Minimum size of a stack, excluding guard pages.
pub const MIN_STACK_SIZE: usize = 4096;

/// Default size of a fiber stack, excluding guard pages.
pub const DEFAULT_STACK_SIZE: usize = 128 * 1024;

pub use crate::arch::STACK_ALIGNMENT;

/// A memory region usable as a fiber stack.
///
/// # Safety
///
/// `top` and `bottom` must delimit a region that stays valid and exclusively
/// owned for the lifetime of the value, with `top` aligned to
/// [`STACK_ALIGNMENT`].
pub unsafe trait FiberStack {
    /// Returns the highest address (start address) of the stack.
    fn top(&self) -> StackPointer;

    /// Returns the lowest address (maximum limit) of the stack, including
    /// any guard pages.
    fn bottom(&self) -> StackPointer;

    /// On Windows, certain fields must be updated in the Thread Environment
    /// Block when switching to another stack. This function returns the
    /// values that must be assigned for this stack.
    #[cfg(windows)]
    fn teb_fields(&self) -> StackTebFields;
}

/// Fields in the Thread Environment Block (TEB) which must be updated when
/// switching to a different stack. These are the same fields that are
/// updated by the `SwitchToFiber` function in the Windows API.
#[cfg(windows)]
#[derive(Clone, Copy, Debug)]
#[allow(non_snake_case, reason = "field names match the TEB documentation")]
pub struct StackTebFields {
    pub StackTop: usize,
    pub StackBottom: usize,
    pub StackBottomPlusGuard: usize,
    pub GuaranteedStackBytes: usize,
}
