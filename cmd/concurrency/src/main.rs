//! Structured concurrency example
//!
//! Bounded fan-out with `all`, a `race` between replicas, a `timeout`, and a
//! forked background fiber that is interrupted while its finalizer still runs.
//!
//! # Environment Variables
//!
//! - `EFFEX_LOG=debug` - Log filter directives
//! - `EFFEX_WORKERS=4` - Worker threads

use std::time::{Duration, Instant};

use effex::{AllOptions, Effect, Fiber, Ref, Runtime, RuntimeConfig};

fn fetch(id: u64) -> Effect<String, String> {
    let latency = Duration::from_millis(10 + (id * 7) % 30);
    Effect::<(), String>::sleep(latency)
        .zip_right(Effect::sync(move || format!("item-{}", id)))
        .with_log_span("fetch")
}

fn replica(name: &'static str, latency_ms: u64) -> Effect<&'static str, String> {
    Effect::<(), String>::sleep(Duration::from_millis(latency_ms))
        .zip_right(Effect::succeed(name))
        .ensuring(Effect::log(format!("replica {} done", name)))
}

// EFFEX_LOG=debug cargo run -p effex-concurrency
fn main() {
    println!("=== effex Concurrency Example ===\n");

    effex::init_logging();

    let config = RuntimeConfig::from_env().thread_name_prefix("demo");
    let rt = match Runtime::new(config) {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("Failed to start runtime: {}", e);
            std::process::exit(1);
        }
    };
    println!("Runtime: {:?}\n", rt);

    // Fan-out, at most 4 requests in flight, results in input order
    let start = Instant::now();
    let batch = Effect::for_each(0..12u64, fetch, AllOptions::bounded(4));
    match rt.run_blocking(batch) {
        Ok(Ok(items)) => println!("Fetched {} items in {:?}: {:?}", items.len(), start.elapsed(), items),
        other => println!("Batch failed: {:?}", other),
    }

    // First replica to answer wins; the others are interrupted
    let fastest = Effect::race_all(vec![replica("eu", 40), replica("us", 15), replica("ap", 80)]);
    println!("Fastest replica: {:?}", rt.run_blocking(fastest));

    let slow = replica("archive", 5_000).timeout(Duration::from_millis(50));
    println!("Timed out: {:?}", rt.run_blocking(slow));

    // Background heartbeat, interrupted by its parent
    let beats = Ref::unsafe_make(0u32);
    let heartbeat = beats
        .update::<String, _>(|n| n + 1)
        .zip_right(Effect::<(), String>::sleep(Duration::from_millis(10)))
        .repeat(effex::Schedule::forever())
        .ensuring(Effect::log("heartbeat stopped"));
    let program: Effect<u32, String> = heartbeat.fork().flat_map({
        let beats = beats.clone();
        move |fiber: Fiber<(), String>| {
            Effect::<(), String>::sleep(Duration::from_millis(55))
                .zip_right(fiber.interrupt())
                .zip_right(beats.get())
        }
    });
    match rt.run_blocking(program) {
        Ok(Ok(n)) => println!("Heartbeats before interrupt: {}", n),
        other => println!("Heartbeat failed: {:?}", other),
    }

    rt.shutdown();
    println!("\n=== Example Complete ===");
}
