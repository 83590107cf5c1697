//! Symmetric stackful coroutines (fibers) for a single OS thread.
//!
//! This crate provides a cooperatively scheduled execution substrate in which
//! multiple independent call stacks coexist within one thread and transfer
//! control to one another *explicitly*: every transfer names its destination
//! and carries exactly one machine [`Word`]. There is no scheduler. Any fiber
//! may switch to any other, which makes these symmetric [`coroutines`] rather
//! than the asymmetric resume/yield pairs found in e.g. [`corosensei`].
//!
//! The register-level switch machinery is adapted from the corosensei family
//! of stack switchers: the suspended context lives as a small frame on the
//! fiber's own stack and only the stack pointer is published, so a switch is
//! a handful of moves plus a jump.
//!
//! # Model
//!
//! [`fiber_main`] establishes the *root context* for the host thread and runs
//! a program under it. The program may then [`fiber_alloc`] dormant fibers
//! and [`fiber_switch`] into them. A fiber's entry point receives the first
//! transferred word and the handle of whoever started it; when the entry
//! point returns (or calls [`fiber_switch_return`]) the fiber becomes
//! finished and control transfers back to its most recent resumer, carrying
//! the returned word.
//!
//! Handles are plain words: copyable, hashable, stable until [`fiber_free`].
//! They are deliberately `!Send`, since a fiber is bound to the thread that
//! allocated it.
//!
//! [`coroutines`]: https://en.wikipedia.org/wiki/Coroutine
//! [`corosensei`]: https://github.com/Amanieu/corosensei

mod arch;
pub mod stack;
mod utils;

use crate::stack::{DEFAULT_STACK_SIZE, DefaultFiberStack, StackPointer};
use core::cell::Cell;
use core::ptr::{self, NonNull};
use std::io;
use std::panic::{self, AssertUnwindSafe};

/// The unit of transfer: one machine-pointer-sized value.
///
/// Richer data travels by pointer, cast to and from `Word`; the lifetime of
/// the pointee is the application's concern.
pub type Word = usize;

/// A fiber entry point.
///
/// `arg` is the word carried by the first switch into the fiber and `caller`
/// identifies the fiber (or root context) that performed it. The returned
/// word is delivered to the fiber's most recent resumer through an implicit
/// terminal transfer.
pub type FiberEntry = fn(arg: Word, caller: FiberHandle) -> Word;

/// A program run under the root context by [`fiber_main`].
pub type FiberProgram = fn(argc: Word, argv: Word) -> Word;

/// An opaque, copyable identifier for a fiber.
///
/// Exactly one word wide, including its `Option` (the niche makes
/// `Option<FiberHandle>` free); `None` plays the role of the "no caller"
/// sentinel. Two handles compare equal iff they identify the same fiber, and
/// a handle's value never changes between [`fiber_alloc`] and [`fiber_free`].
///
/// Handles are `!Send`: a fiber must only ever be named from the OS thread
/// that allocated it.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct FiberHandle(NonNull<FiberRecord>);

static_assertions::assert_eq_size!(FiberHandle, usize);
static_assertions::assert_eq_size!(Option<FiberHandle>, usize);

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum State {
    /// Allocated, never switched into. The saved context is the synthetic
    /// bootstrap frame.
    Fresh,
    /// Switched out; the saved context resumes inside `fiber_switch`.
    Suspended,
    /// Currently executing. At most one record per thread is in this state.
    Running,
    /// The entry point returned or the fiber performed a terminal transfer.
    Finished,
}

struct FiberRecord {
    /// Owned stack memory. `None` exactly for the root context, whose stack
    /// belongs to the host thread.
    stack: Option<DefaultFiberStack>,
    /// Stack pointer at which the suspended register frame lives. `None`
    /// while `Running` and once `Finished`.
    saved_sp: Option<StackPointer>,
    /// User entry point. `None` for the root context.
    entry: Option<FiberEntry>,
    state: State,
    /// Most recent fiber to switch into this one; the target of the implicit
    /// terminal transfer when the entry point returns.
    last_caller: Option<FiberHandle>,
    /// Registered rendezvous location: when this fiber is next resumed, the
    /// resumer's handle is stored here before user code continues. Points
    /// into the suspended `fiber_switch` frame, so it is valid exactly while
    /// the fiber is `Suspended`. Null until the fiber first suspends.
    wake_slot: *mut FiberHandle,
    /// The root record of the `fiber_main` invocation this fiber belongs to.
    /// Handles must never cross invocations.
    root: *const FiberRecord,
}

thread_local! {
    /// The fiber (or root) currently executing on this thread. `None`
    /// outside of `fiber_main`.
    static CURRENT: Cell<Option<FiberHandle>> = const { Cell::new(None) };
}

/// Establishes the root context for the calling thread and runs `prog`
/// under it, passing `argc` and `argv` through verbatim.
///
/// This is the only entry into the runtime; it guarantees a root context
/// exists before any [`fiber_alloc`]. `prog` runs directly on the host
/// thread's own stack. Returns `prog`'s result.
///
/// Fibers still alive when `prog` returns are leaked; free them first.
///
/// # Panics
///
/// Panics if a `fiber_main` invocation is already active on this thread.
pub fn fiber_main(prog: FiberProgram, argc: Word, argv: Word) -> Word {
    assert!(
        CURRENT.get().is_none(),
        "fiber_main is already running on this thread"
    );

    let root = Box::into_raw(Box::new(FiberRecord {
        stack: None,
        saved_sp: None,
        entry: None,
        state: State::Running,
        last_caller: None,
        wake_slot: ptr::null_mut(),
        root: ptr::null(),
    }));
    // The root record identifies its own invocation.
    //
    // Safety: `root` was just leaked out of a Box and is not aliased.
    unsafe {
        (*root).root = root;
    }

    // Clear CURRENT and release the root record even if `prog` unwinds.
    struct RootGuard(*mut FiberRecord);
    impl Drop for RootGuard {
        fn drop(&mut self) {
            CURRENT.set(None);
            // Safety: the root record is created above and released only
            // here; fibers hold it as a raw stamp, never as a reference.
            drop(unsafe { Box::from_raw(self.0) });
            log::trace!("root context torn down");
        }
    }
    let _guard = RootGuard(root);

    // Safety: `Box::into_raw` never returns null.
    CURRENT.set(Some(FiberHandle(unsafe { NonNull::new_unchecked(root) })));
    log::trace!("root context established");

    prog(argc, argv)
}

/// Allocates a dormant fiber with the default stack size
/// ([`DEFAULT_STACK_SIZE`](stack::DEFAULT_STACK_SIZE)).
///
/// The entry point does not run; the first [`fiber_switch`] into the handle
/// starts it. Returns `None` if the stack cannot be allocated.
///
/// # Panics
///
/// Panics when called outside of [`fiber_main`].
pub fn fiber_alloc(entry: FiberEntry) -> Option<FiberHandle> {
    fiber_alloc_with_stack_size(entry, DEFAULT_STACK_SIZE).ok()
}

/// Like [`fiber_alloc`], with an explicit stack size in bytes.
///
/// The size is rounded up to at least
/// [`MIN_STACK_SIZE`](stack::MIN_STACK_SIZE) and to a page boundary; a guard
/// page below the stack converts overflow into a fault.
///
/// # Errors
///
/// Returns the underlying allocator error if the stack mapping fails.
///
/// # Panics
///
/// Panics when called outside of [`fiber_main`].
pub fn fiber_alloc_with_stack_size(
    entry: FiberEntry,
    stack_size: usize,
) -> io::Result<FiberHandle> {
    let current = CURRENT
        .get()
        .expect("fiber_alloc called outside of fiber_main");
    // Safety: the current record is always live.
    let root = unsafe { (*current.0.as_ptr()).root };

    let stack = DefaultFiberStack::new(stack_size)?;
    let record = Box::into_raw(Box::new(FiberRecord {
        stack: Some(stack),
        saved_sp: None,
        entry: Some(entry),
        state: State::Fresh,
        last_caller: None,
        wake_slot: ptr::null_mut(),
        root,
    }));

    // Synthesize the bootstrap frame so that the first switch into this
    // fiber lands in `fiber_launch` with the record pointer in hand.
    //
    // Safety: `record` was just leaked out of a Box; the stack it owns
    // outlives the borrow taken here.
    unsafe {
        let sp = {
            let stack = (*record)
                .stack
                .as_ref()
                .expect("freshly allocated fiber owns a stack");
            arch::init_stack(stack, fiber_launch, record)
        };
        (*record).saved_sp = Some(sp);
    }

    // Safety: `Box::into_raw` never returns null.
    let handle = FiberHandle(unsafe { NonNull::new_unchecked(record) });
    log::trace!("allocated fiber {handle:?} with a {stack_size} byte stack");
    Ok(handle)
}

/// Releases a fiber's stack and bookkeeping.
///
/// Legal in the fresh, suspended, and finished states. Freeing a fresh fiber
/// never invokes its entry point; freeing a suspended fiber abandons
/// whatever its stack holds without unwinding it.
///
/// # Safety
///
/// `h` must identify a live fiber of the active `fiber_main` invocation and
/// must not be used again afterwards (by any copy of the handle).
///
/// # Panics
///
/// Panics when called outside of `fiber_main`, when `h` is the currently
/// running fiber or the root context, or when `h` belongs to a different
/// `fiber_main` invocation.
pub unsafe fn fiber_free(h: FiberHandle) {
    let current = CURRENT
        .get()
        .expect("fiber_free called outside of fiber_main");
    assert!(
        h != current,
        "attempt to free the currently running fiber"
    );
    // Safety: `current` is always live; `h` is live and unaliased per this
    // function's contract.
    unsafe {
        assert!(
            ptr::eq((*h.0.as_ptr()).root, (*current.0.as_ptr()).root),
            "handle belongs to a different fiber_main invocation"
        );
        assert!(
            (*h.0.as_ptr()).state != State::Running,
            "attempt to free a running fiber"
        );
        assert!(
            (*h.0.as_ptr()).stack.is_some(),
            "attempt to free the root context"
        );
        let record = Box::from_raw(h.0.as_ptr());
        log::trace!("freed fiber {h:?} in state {:?}", record.state);
        drop(record);
    }
}

/// Transfers control to `dst`, delivering `value`.
///
/// The current fiber suspends inside this call with `self_slot` registered
/// as its rendezvous location: when it is next resumed, by whichever fiber
/// and through whichever of the transfer operations, the resumer's handle is
/// written into `*self_slot` before this call returns, and the word that
/// resumer transferred is the return value. "Switch to whoever woke me" is
/// therefore a loop over a single variable.
///
/// A fresh `dst` starts executing its entry point with `value` as `arg` and
/// the current fiber's handle as `caller`; a suspended `dst` resumes inside
/// its own `fiber_switch` call.
///
/// # Safety
///
/// `dst` must identify a fiber that has not been freed. `self_slot` must
/// remain writable until the current fiber is resumed (it lives in the
/// caller's frame, which the suspended stack keeps intact).
///
/// # Panics
///
/// Panics when called outside of `fiber_main`, when `dst` is the currently
/// running fiber or is finished, or when `dst` belongs to a different
/// `fiber_main` invocation.
pub unsafe fn fiber_switch(dst: FiberHandle, value: Word, self_slot: &mut FiberHandle) -> Word {
    let current = CURRENT
        .get()
        .expect("fiber_switch called outside of fiber_main");
    assert!(
        dst != current,
        "attempt to switch to the currently running fiber"
    );

    let cur = current.0.as_ptr();
    let dst_ptr = dst.0.as_ptr();

    // Safety: `current` is always live; `dst` is live per this function's
    // contract and distinct from `current` per the assert above.
    unsafe {
        assert!(
            ptr::eq((*dst_ptr).root, (*cur).root),
            "handle belongs to a different fiber_main invocation"
        );
        let dst_state = (*dst_ptr).state;
        let dst_sp = match dst_state {
            State::Fresh | State::Suspended => (*dst_ptr)
                .saved_sp
                .take()
                .expect("suspended fiber lost its saved context"),
            State::Running => panic!("attempt to switch to a running fiber"),
            State::Finished => panic!("attempt to switch to a finished fiber"),
        };

        // Register our rendezvous location and hand the destination our
        // identity: through its own registered slot if it is suspended, or
        // as the entry point's `caller` argument if it has yet to start.
        (*cur).wake_slot = ptr::from_mut(self_slot);
        if dst_state == State::Suspended {
            *(*dst_ptr).wake_slot = current;
        }
        (*dst_ptr).last_caller = Some(current);

        (*cur).state = State::Suspended;
        (*dst_ptr).state = State::Running;
        CURRENT.set(Some(dst));

        // By the time this returns, some other fiber has switched back to
        // us and already restored our bookkeeping; nothing to update here.
        arch::switch(value, dst_sp, &raw mut (*cur).saved_sp)
    }
}

/// Terminal transfer: marks the current fiber finished and transfers to
/// `dst`, delivering `value`. Never returns.
///
/// Equivalent to returning `value` from the entry point when `dst` is the
/// most recent resumer. The finished fiber's stack is not touched again by
/// the runtime; freeing it from the other side is legal immediately.
///
/// # Safety
///
/// `dst` must identify a fiber that has not been freed.
///
/// # Panics
///
/// Panics under the same conditions as [`fiber_switch`], and additionally
/// when invoked from the root context (the root returns by returning from
/// the program given to `fiber_main`).
pub unsafe fn fiber_switch_return(dst: FiberHandle, value: Word) -> ! {
    let current = CURRENT
        .get()
        .expect("fiber_switch_return called outside of fiber_main");
    assert!(
        dst != current,
        "attempt to switch to the currently running fiber"
    );

    let cur = current.0.as_ptr();
    let dst_ptr = dst.0.as_ptr();

    // Safety: as in `fiber_switch`.
    unsafe {
        assert!(
            (*cur).stack.is_some(),
            "attempt to terminally transfer out of the root context"
        );
        assert!(
            ptr::eq((*dst_ptr).root, (*cur).root),
            "handle belongs to a different fiber_main invocation"
        );
        let dst_state = (*dst_ptr).state;
        let dst_sp = match dst_state {
            State::Fresh | State::Suspended => (*dst_ptr)
                .saved_sp
                .take()
                .expect("suspended fiber lost its saved context"),
            State::Running => panic!("attempt to switch to a running fiber"),
            State::Finished => panic!("attempt to switch to a finished fiber"),
        };

        if dst_state == State::Suspended {
            *(*dst_ptr).wake_slot = current;
        }
        (*dst_ptr).last_caller = Some(current);

        (*cur).state = State::Finished;
        (*dst_ptr).state = State::Running;
        CURRENT.set(Some(dst));

        arch::switch_and_drop(value, dst_sp)
    }
}

/// Returns whether `h` has finished executing.
///
/// A finished fiber may be freed but must not be switched to. Completion is
/// otherwise only observable by convention (a sentinel word), so this is the
/// queryable alternative.
///
/// # Safety
///
/// `h` must identify a fiber that has not been freed.
pub unsafe fn fiber_is_finished(h: FiberHandle) -> bool {
    // Safety: `h` is live per this function's contract.
    unsafe { (*h.0.as_ptr()).state == State::Finished }
}

/// First code executed on a fresh fiber's own stack, entered through the
/// per-architecture bootstrap trampoline.
unsafe extern "C-unwind" fn fiber_launch(arg: Word, record: *mut FiberRecord) -> ! {
    // Safety: `record` is the live record of the fiber whose stack we are
    // running on; `last_caller` was set by the switch that started us.
    let (entry, caller) = unsafe {
        let entry = (*record).entry.expect("fiber record without an entry point");
        let caller = (*record)
            .last_caller
            .expect("fresh fiber resumed without a caller");
        (entry, caller)
    };

    // The frame below us is synthetic and cannot be unwound through, so a
    // panicking entry point takes the process down instead of corrupting
    // the stack. The default panic hook has already reported the payload.
    let result = match panic::catch_unwind(AssertUnwindSafe(|| entry(arg, caller))) {
        Ok(result) => result,
        Err(_) => {
            log::error!("fiber entry point panicked; aborting");
            std::process::abort();
        }
    };

    // Deliver the result to the most recent resumer, which need not be the
    // fiber that started us.
    //
    // Safety: the record stays live for as long as this fiber can run.
    let dst = unsafe { (*record).last_caller }.expect("finished fiber has no caller to return to");
    // Safety: `dst` resumed us, so it is live and suspended.
    unsafe { fiber_switch_return(dst, result) }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn echo_twice(arg: Word, caller: FiberHandle) -> Word {
        let mut peer = caller;
        // Safety: `peer` identifies the live fiber that resumed us.
        let second = unsafe { fiber_switch(peer, arg + 1, &mut peer) };
        second + 1
    }

    fn round_trip_prog(_argc: Word, _argv: Word) -> Word {
        let mut f = fiber_alloc(echo_twice).expect("failed to allocate fiber");
        let first = f;
        // Safety: `f` is fresh.
        let v = unsafe { fiber_switch(f, 10, &mut f) };
        assert_eq!(v, 11);
        assert_eq!(f, first, "handle value is stable across transfers");
        // Safety: `f` is suspended.
        let v = unsafe { fiber_switch(f, 20, &mut f) };
        assert_eq!(v, 21);
        // Safety: `f` is finished and never used again.
        unsafe {
            assert!(fiber_is_finished(f));
            fiber_free(f);
        }
        0
    }

    #[test]
    fn round_trip() {
        assert_eq!(fiber_main(round_trip_prog, 0, 0), 0);
    }

    fn observer(arg: Word, caller: FiberHandle) -> Word {
        // While we run, our resumer must be suspended and we must be the
        // running fiber: at most one context runs at a time.
        let me = CURRENT.get().expect("no current fiber inside an entry point");
        // Safety: both records are live.
        unsafe {
            assert_eq!((*caller.0.as_ptr()).state, State::Suspended);
            assert_eq!((*me.0.as_ptr()).state, State::Running);
        }
        arg
    }

    fn states_prog(_argc: Word, _argv: Word) -> Word {
        let f = fiber_alloc(observer).expect("failed to allocate fiber");
        // Safety: the record is live until the free below.
        unsafe {
            assert_eq!((*f.0.as_ptr()).state, State::Fresh);
            let mut slot = f;
            fiber_switch(f, 7, &mut slot);
            assert_eq!((*f.0.as_ptr()).state, State::Finished);
            fiber_free(f);
        }
        0
    }

    #[test]
    fn lifecycle_states() {
        assert_eq!(fiber_main(states_prog, 0, 0), 0);
    }

    fn fresh_free_prog(_argc: Word, _argv: Word) -> Word {
        let f = fiber_alloc(observer).expect("failed to allocate fiber");
        // Safety: `f` is fresh; freeing must not invoke the entry point.
        unsafe { fiber_free(f) };
        0
    }

    #[test]
    fn free_without_starting() {
        assert_eq!(fiber_main(fresh_free_prog, 0, 0), 0);
    }

    #[test]
    fn handle_is_word_sized() {
        assert_eq!(size_of::<FiberHandle>(), size_of::<usize>());
        assert_eq!(size_of::<Option<FiberHandle>>(), size_of::<usize>());
    }
}
