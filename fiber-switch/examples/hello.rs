//! Cooperative printing of "hello world".
//!
//! The root context starts `hello`, which allocates `world`; the two fibers
//! then bounce control back and forth, each printing one character per
//! round trip, interleaving their halves of the string.

use fiber_switch::{
    FiberHandle, Word, fiber_alloc, fiber_free, fiber_main, fiber_switch, fiber_switch_return,
};
use std::cell::Cell;
use std::io::{self, Write};
use std::process::ExitCode;

thread_local! {
    static WORLD_DONE: Cell<bool> = const { Cell::new(false) };
}

fn world(arg: Word, caller: FiberHandle) -> Word {
    const S: &[u8] = b"el ol";
    let mut peer = caller;
    let mut i = arg;

    loop {
        print!("{}", S[i] as char);
        i += 1;
        // Safety: `peer` always names the live fiber that last woke us.
        i = unsafe { fiber_switch(peer, i, &mut peer) };
        if i >= S.len() {
            break;
        }
    }

    WORLD_DONE.set(true);
    // Safety: `peer` is suspended, waiting for this final round trip.
    unsafe { fiber_switch(peer, i, &mut peer) };
    0
}

fn hello(arg: Word, caller: FiberHandle) -> Word {
    const S: &[u8] = b"hlowrd";
    let mut world_fiber = fiber_alloc(world).expect("failed to allocate world fiber");
    let mut i = arg;

    loop {
        print!("{}", S[i] as char);
        // Safety: `world_fiber` is fresh on the first pass, suspended after.
        i = unsafe { fiber_switch(world_fiber, i, &mut world_fiber) };
        if WORLD_DONE.get() {
            break;
        }
    }
    // Safety: `world` is suspended in its final switch; freeing abandons it.
    unsafe { fiber_free(world_fiber) };
    // Letting the entry point return would be equivalent; the explicit
    // terminal transfer spells out where control goes.
    //
    // Safety: `caller` is the suspended root context.
    unsafe { fiber_switch_return(caller, i) }
}

fn prog(_argc: Word, _argv: Word) -> Word {
    let mut hello_fiber = fiber_alloc(hello).expect("failed to allocate hello fiber");

    // Safety: `hello_fiber` is fresh; the slot is rewritten to whoever
    // transfers back, which is again the hello fiber.
    unsafe { fiber_switch(hello_fiber, 0, &mut hello_fiber) };

    println!();
    io::stdout().flush().expect("failed to flush stdout");

    // Safety: the hello fiber performed its terminal transfer; it is
    // finished and never used again.
    unsafe { fiber_free(hello_fiber) };

    0
}

fn main() -> ExitCode {
    env_logger::init();
    ExitCode::from(u8::try_from(fiber_main(prog, 0, 0)).unwrap_or(1))
}
