//! End-to-end runtime behavior.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use weft::{FiberState, Fiber, IoManager, Runtime};

fn wait_until(pred: impl Fn() -> bool, ms: u64) -> bool {
    let deadline = Instant::now() + Duration::from_millis(ms);
    while Instant::now() < deadline {
        if pred() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(1));
    }
    pred()
}

#[test]
fn block_on_returns_value() {
    let rt = Runtime::new(2, "it-block").unwrap();
    let v = rt.block_on(|| 40 + 2);
    assert_eq!(v, 42);
}

#[test]
fn spawned_fibers_all_run() {
    let rt = Runtime::new(4, "it-spawn").unwrap();
    let count = Arc::new(AtomicUsize::new(0));
    for _ in 0..200 {
        let c = count.clone();
        rt.spawn(move || {
            c.fetch_add(1, Ordering::SeqCst);
        });
    }
    assert!(wait_until(|| count.load(Ordering::SeqCst) == 200, 5000));
}

#[test]
fn sleep_ms_parks_without_blocking_workers() {
    // One worker. If sleep blocked the thread, the short task behind
    // the sleeper could not finish first.
    let rt = Runtime::new(1, "it-sleep").unwrap();
    let order = Arc::new(AtomicUsize::new(0));

    let o = order.clone();
    let slept_at = Arc::new(AtomicUsize::new(0));
    let s = slept_at.clone();
    rt.spawn(move || {
        weft::sleep_ms(80);
        s.store(o.fetch_add(1, Ordering::SeqCst) + 1, Ordering::SeqCst);
    });
    let o = order.clone();
    let quick_at = Arc::new(AtomicUsize::new(0));
    let q = quick_at.clone();
    rt.spawn(move || {
        q.store(o.fetch_add(1, Ordering::SeqCst) + 1, Ordering::SeqCst);
    });

    assert!(wait_until(|| order.load(Ordering::SeqCst) == 2, 5000));
    assert_eq!(quick_at.load(Ordering::SeqCst), 1);
    assert_eq!(slept_at.load(Ordering::SeqCst), 2);
}

#[test]
fn recurring_timer_keeps_cadence() {
    let rt = Runtime::new(1, "it-recur").unwrap();
    let ticks = Arc::new(AtomicUsize::new(0));
    let t = ticks.clone();
    let start = Instant::now();
    let timer = rt.io().timers().add_timer(
        25,
        move || {
            t.fetch_add(1, Ordering::SeqCst);
        },
        true,
    );

    assert!(wait_until(|| ticks.load(Ordering::SeqCst) >= 4, 5000));
    let elapsed = start.elapsed();
    // Four ticks at 25ms each cannot land much before 100ms.
    assert!(elapsed >= Duration::from_millis(90), "{:?}", elapsed);

    // Recurring timers must be cancelled or shutdown waits on them.
    timer.cancel();
}

#[test]
fn yield_now_interleaves_fibers() {
    let rt = Runtime::new(1, "it-yield").unwrap();
    let log = Arc::new(std::sync::Mutex::new(Vec::new()));

    // Enqueue both fibers from inside the pool so they land in the
    // queue together before either runs.
    let log_outer = log.clone();
    rt.spawn(move || {
        for id in 0..2usize {
            let log = log_outer.clone();
            weft::spawn(move || {
                for round in 0..3 {
                    log.lock().unwrap().push((id, round));
                    weft::yield_now();
                }
            });
        }
    });
    assert!(wait_until(|| log.lock().unwrap().len() == 6, 5000));
    let log = log.lock().unwrap();
    // On a single worker, yielding must interleave the two fibers
    // rather than running one to completion.
    let ids: Vec<usize> = log.iter().map(|&(id, _)| id).collect();
    assert_eq!(ids, vec![0, 1, 0, 1, 0, 1]);
}

#[test]
fn panicking_fiber_does_not_take_down_the_pool() {
    let rt = Runtime::new(1, "it-panic").unwrap();
    rt.spawn(|| {
        panic!("intentional test panic");
    });
    // The worker must survive and keep serving work.
    let v = rt.block_on(|| "still alive");
    assert_eq!(v, "still alive");
}

#[test]
fn use_caller_pool_drains_on_stop() {
    let io = IoManager::new(1, true, "it-caller").unwrap();
    io.start().unwrap();

    let count = Arc::new(AtomicUsize::new(0));
    for _ in 0..5 {
        let c = count.clone();
        io.schedule(move || {
            c.fetch_add(1, Ordering::SeqCst);
        });
    }
    // No OS worker was spawned; stop runs the queue on this thread.
    io.stop().unwrap();
    assert_eq!(count.load(Ordering::SeqCst), 5);
}

#[test]
fn fiber_state_visible_from_outside() {
    let rt = Runtime::new(1, "it-state").unwrap();
    let fiber = Fiber::new(|| {
        weft::yield_now();
    })
    .unwrap();
    assert_eq!(fiber.state(), FiberState::Init);
    rt.io().schedule_fiber(fiber.clone());
    assert!(wait_until(|| fiber.state() == FiberState::Term, 5000));
}

#[test]
fn shutdown_is_idempotent() {
    let rt = Runtime::new(2, "it-shutdown").unwrap();
    rt.shutdown().unwrap();
    rt.shutdown().unwrap();
    // Drop runs stop a third time.
}
