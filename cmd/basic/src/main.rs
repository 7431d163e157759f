//! Basic weft example
//!
//! Spawns a batch of fibers over a small worker pool and shows
//! cooperative yielding.
//!
//! # Environment Variables
//!
//! - `WEFT_LOG_LEVEL=debug` - Set log level (off, error, warn, info, debug, trace)
//! - `WEFT_FLUSH_EPRINT=1` - Flush debug output immediately

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use weft::{kdebug, kinfo, Runtime};

// WEFT_LOG_LEVEL=debug cargo run -p weft-basic
fn main() {
    println!("=== weft basic example ===\n");

    let rt = Runtime::new(4, "basic").expect("runtime startup failed");
    let completed = Arc::new(AtomicUsize::new(0));

    kinfo!("spawning fibers...");
    for i in 1..=4 {
        let c = completed.clone();
        rt.spawn(move || {
            kdebug!("[fiber {}] started", i);
            for j in 0..3 {
                kdebug!("[fiber {}] iteration {}", i, j);
                weft::yield_now();
            }
            kdebug!("[fiber {}] finished", i);
            c.fetch_add(1, Ordering::SeqCst);
        });
        println!("spawned fiber {}", i);
    }

    println!("\nwaiting for 4 fibers to complete...\n");
    let start = std::time::Instant::now();
    let timeout = std::time::Duration::from_secs(10);
    while completed.load(Ordering::SeqCst) < 4 {
        if start.elapsed() > timeout {
            println!("WARNING: timeout!");
            break;
        }
        std::thread::sleep(std::time::Duration::from_millis(10));
    }

    kinfo!("{} fiber(s) completed", completed.load(Ordering::SeqCst));
    println!("\n=== example complete ===");
}
