//! Basic effex example
//!
//! Builds a small program lazily, then runs it: sequencing with `effect!`,
//! typed failures with retry, a finalizer, and logging inside a span.
//!
//! # Environment Variables
//!
//! - `EFFEX_LOG=debug` - Log filter directives (e.g. `effex_runtime=trace,info`)
//! - `EFFEX_WORKERS=4` - Worker threads for the default runtime

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use effex::{effect, Cause, Effect, Schedule};

// EFFEX_LOG=debug cargo run -p effex-basic
fn main() {
    println!("=== effex Basic Example ===\n");

    effex::init_logging();

    // Fails twice, then succeeds
    let calls = Arc::new(AtomicU32::new(0));
    let c = Arc::clone(&calls);
    let flaky: Effect<u32, String> = Effect::try_sync(
        move || {
            let n = c.fetch_add(1, Ordering::SeqCst) + 1;
            if n < 3 {
                Err(format!("attempt {} refused", n))
            } else {
                Ok(n * 10)
            }
        },
        |e: String| e,
    );

    let program: Effect<u32, String> = effect! {
        bind Effect::log("starting");
        let fetched = bind flaky.clone().retry(Schedule::recurs(5).intersect(Schedule::exponential(Duration::from_millis(5), 2.0)));
        bind Effect::log(format!("fetched {}", fetched));
        let doubled = bind Effect::succeed(fetched).map(|n| n * 2);
        Effect::succeed(doubled + 2)
    }
    .with_log_span("basic")
    .ensuring(Effect::sync(|| println!("finalizer ran")));

    println!("Program built; calls so far: {}", calls.load(Ordering::SeqCst));

    match effex::run_blocking(program) {
        Ok(Ok(n)) => println!("Result: {} after {} calls", n, calls.load(Ordering::SeqCst)),
        Ok(Err(cause)) => println!("Program {}", cause),
        Err(e) => println!("Could not start: {}", e),
    }

    // Typed failures surface as values; defects never reach typed handlers
    let failing: Effect<u32, String> = Effect::fail("no such user".to_string());
    let recovered = failing.catch_all(|e| Effect::<u32, String>::sync(move || e.len() as u32));
    println!("Recovered: {:?}", effex::run_blocking(recovered));

    let buggy: Effect<u32, String> = Effect::sync(|| panic!("bug"));
    match effex::run_blocking(buggy.catch_all(|_| Effect::<u32, String>::succeed(0))) {
        Ok(Err(Cause::Die(defect))) => println!("Defect passed the handler: {}", defect),
        other => println!("Unexpected: {:?}", other),
    }

    println!("\n=== Example Complete ===");
}
