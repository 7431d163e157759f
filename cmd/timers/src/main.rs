//! Timer demo
//!
//! One-shot, recurring, and condition timers, plus fiber sleep.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;
use weft::{kinfo, Runtime};

fn main() {
    println!("=== weft timer example ===\n");

    let rt = Runtime::new(2, "timers").expect("runtime startup failed");
    let start = Instant::now();

    rt.io().timers().add_timer(
        200,
        move || {
            println!("[{:>4}ms] one-shot fired", start.elapsed().as_millis());
        },
        false,
    );

    let ticks = Arc::new(AtomicUsize::new(0));
    let t = ticks.clone();
    let recurring = rt.io().timers().add_timer(
        100,
        move || {
            let n = t.fetch_add(1, Ordering::SeqCst) + 1;
            println!("[{:>4}ms] recurring tick {}", start.elapsed().as_millis(), n);
        },
        true,
    );

    // Condition timer: fires only while the watched value is alive.
    let gate = Arc::new(());
    rt.io().timers().add_condition_timer(
        150,
        move || {
            println!("[{:>4}ms] condition timer fired", start.elapsed().as_millis());
        },
        Arc::downgrade(&gate),
        false,
    );
    // Drop the gate before the deadline; this one stays silent.
    let silenced = Arc::new(());
    let weak = Arc::downgrade(&silenced);
    rt.io().timers().add_condition_timer(
        150,
        move || {
            println!("this should never print");
        },
        weak,
        false,
    );
    drop(silenced);

    rt.block_on(move || {
        println!("[{:>4}ms] fiber sleeping 500ms", start.elapsed().as_millis());
        weft::sleep_ms(500);
        println!("[{:>4}ms] fiber awake", start.elapsed().as_millis());
    });

    recurring.cancel();
    kinfo!("recurring timer cancelled after {} ticks", ticks.load(Ordering::SeqCst));
    println!("\n=== example complete ===");
}
