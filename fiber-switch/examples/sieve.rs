//! Cooperative calculation of primes.
//!
//! A chain of filter fibers, one per prime found so far, each seeded with
//! its prime. Every candidate is routed through the chain; a filter answers
//! each candidate with a divisibility word, and a candidate that survives
//! the whole chain is a new prime and gets a filter of its own.
//!
//! Winding a filter down by switching a `0` candidate to it is a convention
//! between this program's fibers, not something the runtime interprets.

use fiber_switch::{
    FiberHandle, Word, fiber_alloc, fiber_free, fiber_main, fiber_switch, fiber_switch_return,
};
use std::io::{self, Write};
use std::process::ExitCode;

const MAX_PRIMES_LIMIT: Word = 203_280_220;

struct RunArgs {
    quiet: bool,
    max_primes: usize,
}

fn filter(arg: Word, caller: FiberHandle) -> Word {
    let my_prime = arg;
    let mut peer = caller;

    // Acknowledge the seed, then answer candidates until the wind-down
    // sentinel arrives.
    //
    // Safety: `peer` always names the live fiber that last woke us.
    let mut candidate = unsafe { fiber_switch(peer, 0, &mut peer) };
    while candidate > 0 {
        let divisible = Word::from(candidate % my_prime == 0);
        // Safety: as above.
        candidate = unsafe { fiber_switch(peer, divisible, &mut peer) };
    }
    0
}

fn run(arg: Word, caller: FiberHandle) -> Word {
    // Safety: `arg` is the pointer to the `RunArgs` that `prog` keeps alive
    // across this fiber's whole run.
    let args = unsafe { &*(arg as *const RunArgs) };

    let mut filters: Vec<FiberHandle> = Vec::new();
    let mut candidate: Word = 2;

    while filters.len() < args.max_primes {
        let mut divisible = 0;

        for f in &mut filters {
            // Safety: every filter in the chain is suspended, waiting for a
            // candidate.
            divisible = unsafe { fiber_switch(*f, candidate, f) };
            if divisible != 0 {
                break;
            }
        }

        if divisible == 0 {
            if !args.quiet {
                print!("{candidate} ");
            }
            let mut filter_fiber = fiber_alloc(filter).expect("failed to allocate filter fiber");
            // Seed the new filter with its prime.
            //
            // Safety: `filter_fiber` is fresh.
            unsafe { fiber_switch(filter_fiber, candidate, &mut filter_fiber) };
            filters.push(filter_fiber);
        }
        candidate += 1;
    }

    if !args.quiet {
        println!();
    }
    println!("Computed {} primes.", filters.len());

    // Wind the chain down and release it.
    for f in &mut filters {
        // Safety: each filter is suspended; the `0` makes it fall out of
        // its loop and finish.
        unsafe {
            fiber_switch(*f, 0, f);
            fiber_free(*f);
        }
    }

    // Safety: `caller` is the suspended root context.
    unsafe { fiber_switch_return(caller, 0) }
}

fn print_input_error() {
    eprintln!("error: input must be a positive integer in the interval [1, {MAX_PRIMES_LIMIT}]");
}

fn prog(_argc: Word, argv: Word) -> Word {
    // Safety: `main` passes a pointer to its argument vector, which stays
    // alive for the duration of `fiber_main`.
    let argv = unsafe { &*(argv as *const Vec<String>) };

    // A second argument other than "-q" is ignored rather than rejected; a
    // three-argument invocation always takes its count from the third.
    let quiet = argv.len() == 3 && argv[1] == "-q";
    let n_idx = if argv.len() == 2 { 1 } else { 2 };
    if argv.len() < 2 || argv.len() > 3 {
        println!("usage: {} [-q] <n>", argv[0]);
        return 1;
    }

    let input = &argv[n_idx];
    if input.is_empty() || !input.bytes().all(|b| b.is_ascii_digit()) {
        print_input_error();
        return 1;
    }
    let max_primes = match input.parse::<usize>() {
        Ok(n) if (1..=MAX_PRIMES_LIMIT).contains(&n) => n,
        _ => {
            print_input_error();
            return 1;
        }
    };

    let args = RunArgs { quiet, max_primes };
    let mut run_fiber = fiber_alloc(run).expect("failed to allocate run fiber");
    // Safety: `run_fiber` is fresh; `args` outlives it.
    let result = unsafe { fiber_switch(run_fiber, &raw const args as Word, &mut run_fiber) };
    // Safety: the run fiber performed its terminal transfer; it is finished.
    unsafe { fiber_free(run_fiber) };

    io::stdout().flush().expect("failed to flush stdout");
    result
}

fn main() -> ExitCode {
    env_logger::init();
    let argv: Vec<String> = std::env::args().collect();
    let result = fiber_main(prog, argv.len(), &raw const argv as Word);
    ExitCode::from(u8::try_from(result).unwrap_or(1))
}
