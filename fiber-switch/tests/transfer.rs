//! End-to-end transfer behavior: round trips, interleaving, the filter
//! pipeline, terminal transfers, and stack exercise.

use fiber_switch::{
    FiberHandle, Word, fiber_alloc, fiber_alloc_with_stack_size, fiber_free, fiber_is_finished,
    fiber_main, fiber_switch, fiber_switch_return,
};
use proptest::prelude::*;
use std::cell::{Cell, RefCell};

// ---------------------------------------------------------------------------
// Single switch and back.

fn pong(arg: Word, caller: FiberHandle) -> Word {
    assert_eq!(arg, 42, "entry point sees the first-switch word");
    let mut peer = caller;
    // Safety: `peer` names the live fiber that woke us.
    let resumed_with = unsafe { fiber_switch(peer, 100, &mut peer) };
    assert_eq!(resumed_with, 7, "in-body switch returns the re-switch word");
    resumed_with
}

fn switch_and_back_prog(_argc: Word, _argv: Word) -> Word {
    let mut f = fiber_alloc(pong).expect("failed to allocate fiber");
    let original = f;

    // Safety: `f` is fresh here, suspended afterwards, and freed only once
    // finished.
    unsafe {
        let back = fiber_switch(f, 42, &mut f);
        assert_eq!(back, 100);
        assert_eq!(f, original, "rendezvous slot re-names the same fiber");

        let last = fiber_switch(f, 7, &mut f);
        assert_eq!(last, 7, "terminal transfer delivers the returned word");
        assert!(fiber_is_finished(f));
        fiber_free(f);
    }
    0
}

#[test]
fn switch_and_back() {
    assert_eq!(fiber_main(switch_and_back_prog, 0, 0), 0);
}

// ---------------------------------------------------------------------------
// Two fibers interleaving characters, hello/world style.

thread_local! {
    static OUT: RefCell<String> = const { RefCell::new(String::new()) };
    static WORLD_DONE: Cell<bool> = const { Cell::new(false) };
}

fn world(arg: Word, caller: FiberHandle) -> Word {
    const S: &[u8] = b"el ol";
    let mut peer = caller;
    let mut i = arg;
    loop {
        OUT.with_borrow_mut(|out| out.push(S[i] as char));
        i += 1;
        // Safety: `peer` names the live fiber that last woke us.
        i = unsafe { fiber_switch(peer, i, &mut peer) };
        if i >= S.len() {
            break;
        }
    }
    WORLD_DONE.set(true);
    // Safety: as above. We are freed while suspended in this switch.
    unsafe { fiber_switch(peer, i, &mut peer) };
    0
}

fn hello(arg: Word, caller: FiberHandle) -> Word {
    const S: &[u8] = b"hlowrd";
    let mut world_fiber = fiber_alloc(world).expect("failed to allocate world fiber");
    let mut i = arg;
    loop {
        OUT.with_borrow_mut(|out| out.push(S[i] as char));
        // Safety: fresh on the first pass, suspended after.
        i = unsafe { fiber_switch(world_fiber, i, &mut world_fiber) };
        if WORLD_DONE.get() {
            break;
        }
    }
    // Safety: the world fiber is suspended and never resumed again.
    unsafe { fiber_free(world_fiber) };
    // Safety: `caller` is the suspended root context.
    unsafe { fiber_switch_return(caller, i) }
}

fn interleave_prog(_argc: Word, _argv: Word) -> Word {
    OUT.with_borrow_mut(String::clear);
    WORLD_DONE.set(false);

    let mut hello_fiber = fiber_alloc(hello).expect("failed to allocate hello fiber");
    // Safety: `hello_fiber` is fresh, then finished via terminal transfer.
    unsafe {
        fiber_switch(hello_fiber, 0, &mut hello_fiber);
        assert!(fiber_is_finished(hello_fiber));
        fiber_free(hello_fiber);
    }
    OUT.with_borrow_mut(|out| out.push('\n'));
    OUT.with_borrow(|out| Word::from(out.as_str() == "hello world\n"))
}

#[test]
fn interleaved_print() {
    assert_eq!(fiber_main(interleave_prog, 0, 0), 1);
}

// ---------------------------------------------------------------------------
// Lazily grown pipeline of prime filters.

fn filter(arg: Word, caller: FiberHandle) -> Word {
    let my_prime = arg;
    let mut peer = caller;
    // Safety: `peer` names the live fiber that last woke us.
    let mut candidate = unsafe { fiber_switch(peer, 0, &mut peer) };
    while candidate > 0 {
        let divisible = Word::from(candidate % my_prime == 0);
        // Safety: as above.
        candidate = unsafe { fiber_switch(peer, divisible, &mut peer) };
    }
    0
}

fn sieve_prog(max_primes: Word, out: Word) -> Word {
    // Safety: the test passes a pointer to a Vec it owns across fiber_main.
    let primes = unsafe { &mut *(out as *mut Vec<Word>) };
    let mut filters: Vec<FiberHandle> = Vec::new();
    let mut candidate: Word = 2;

    while primes.len() < max_primes {
        let mut divisible = 0;
        for f in &mut filters {
            // Safety: every filter is suspended between candidates.
            divisible = unsafe { fiber_switch(*f, candidate, f) };
            if divisible != 0 {
                break;
            }
        }
        if divisible == 0 {
            primes.push(candidate);
            let mut filter_fiber = fiber_alloc(filter).expect("failed to allocate filter fiber");
            // Safety: fresh; the seed switch returns once acknowledged.
            unsafe { fiber_switch(filter_fiber, candidate, &mut filter_fiber) };
            filters.push(filter_fiber);
        }
        candidate += 1;
    }

    for f in &mut filters {
        // Safety: suspended; the sentinel `0` finishes the filter, after
        // which freeing it is legal.
        unsafe {
            fiber_switch(*f, 0, f);
            assert!(fiber_is_finished(*f));
            fiber_free(*f);
        }
    }
    primes.len()
}

#[test]
fn sieve_pipeline() {
    let mut primes: Vec<Word> = Vec::new();
    let computed = fiber_main(sieve_prog, 10, &raw mut primes as Word);
    assert_eq!(computed, 10);
    assert_eq!(primes, [2, 3, 5, 7, 11, 13, 17, 19, 23, 29]);
}

// ---------------------------------------------------------------------------
// Entry return routes through the terminal transfer.

fn add_one(arg: Word, _caller: FiberHandle) -> Word {
    arg + 1
}

fn return_as_terminal_prog(_argc: Word, _argv: Word) -> Word {
    let mut f = fiber_alloc(add_one).expect("failed to allocate fiber");
    // Safety: `f` is fresh, then finished, then freed exactly once.
    unsafe {
        let r = fiber_switch(f, 41, &mut f);
        assert_eq!(r, 42);
        assert!(fiber_is_finished(f));
        fiber_free(f);
    }
    0
}

#[test]
fn return_as_terminal() {
    assert_eq!(fiber_main(return_as_terminal_prog, 0, 0), 0);
}

// ---------------------------------------------------------------------------
// The rendezvous slot names the resumer, consistently across wake-ups.

thread_local! {
    static FIRST_CALLER: Cell<Option<FiberHandle>> = const { Cell::new(None) };
    static ENTRY_RUNS: Cell<usize> = const { Cell::new(0) };
}

fn caller_witness(arg: Word, caller: FiberHandle) -> Word {
    ENTRY_RUNS.set(ENTRY_RUNS.get() + 1);
    FIRST_CALLER.set(Some(caller));
    let mut peer = caller;
    // Safety: `peer` names the live fiber that woke us.
    let v = unsafe { fiber_switch(peer, arg, &mut peer) };
    // The same fiber resumed us both times, so the slot must re-name it.
    assert_eq!(Some(peer), FIRST_CALLER.get());
    v
}

fn rendezvous_prog(_argc: Word, _argv: Word) -> Word {
    FIRST_CALLER.set(None);
    ENTRY_RUNS.set(0);

    let mut f = fiber_alloc(caller_witness).expect("failed to allocate fiber");
    // Safety: `f` is fresh, then suspended, then finished.
    unsafe {
        fiber_switch(f, 5, &mut f);
        fiber_switch(f, 6, &mut f);
        assert!(fiber_is_finished(f));
        fiber_free(f);
    }
    assert_eq!(ENTRY_RUNS.get(), 1, "entry point runs exactly once");
    0
}

#[test]
fn rendezvous_names_the_resumer() {
    assert_eq!(fiber_main(rendezvous_prog, 0, 0), 0);
}

// ---------------------------------------------------------------------------
// Deep recursion within a documented bound of an explicit stack size.

fn descend(depth: usize) -> usize {
    let mut frame = [0u8; 256];
    frame[0] = u8::from(depth & 0x01 == 1);
    std::hint::black_box(&mut frame);
    if depth == 0 {
        0
    } else {
        descend(depth - 1) + usize::from(frame[0])
    }
}

fn deep_recursion(arg: Word, _caller: FiberHandle) -> Word {
    descend(arg)
}

fn deep_recursion_prog(_argc: Word, _argv: Word) -> Word {
    // 100 frames of ~300 bytes stays within half of a 64 KiB stack.
    let mut f = fiber_alloc_with_stack_size(deep_recursion, 64 * 1024)
        .expect("failed to allocate fiber");
    // Safety: `f` is fresh, then finished.
    unsafe {
        let odd_depths = fiber_switch(f, 100, &mut f);
        assert_eq!(odd_depths, 50);
        fiber_free(f);
    }
    0
}

#[test]
fn recursion_within_stack_bound() {
    assert_eq!(fiber_main(deep_recursion_prog, 0, 0), 0);
}

// ---------------------------------------------------------------------------
// Words survive transfer bit-for-bit, and a fiber suspended mid-loop can be
// freed without ever finishing.

fn echo(arg: Word, caller: FiberHandle) -> Word {
    let mut peer = caller;
    let mut v = arg;
    loop {
        // Safety: `peer` names the live fiber that last woke us.
        v = unsafe { fiber_switch(peer, v, &mut peer) };
    }
}

fn fidelity_prog(len: Word, ptr: Word) -> Word {
    // Safety: the proptest harness passes a pointer to a slice it owns
    // across fiber_main.
    let words = unsafe { std::slice::from_raw_parts(ptr as *const Word, len) };
    let mut f = fiber_alloc(echo).expect("failed to allocate fiber");
    let mut mismatches = 0;
    for &w in words {
        // Safety: `f` is fresh on the first pass, suspended after.
        let back = unsafe { fiber_switch(f, w, &mut f) };
        if back != w {
            mismatches += 1;
        }
    }
    // Safety: `f` is suspended in its echo loop; freeing abandons it.
    unsafe { fiber_free(f) };
    mismatches
}

proptest! {
    #[test]
    fn word_fidelity(words in proptest::collection::vec(any::<usize>(), 1..64)) {
        let mismatches = fiber_main(fidelity_prog, words.len(), words.as_ptr() as Word);
        prop_assert_eq!(mismatches, 0);
    }
}
