//! Tests for the thread bridge: scheduling onto the runtime from plain
//! threads and offloading blocking work from async code.
#![allow(unused_imports, dead_code)]

use curfew::{call_soon_threadsafe, run_in_thread, BridgeError, CancelReason, Operation};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;

fn isolated() -> curfew::OperationBuilder {
    Operation::builder().register_globally(false)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn thread_schedules_work_onto_runtime() {
    let handle = Handle::current();
    let ran = Arc::new(AtomicBool::new(false));

    let flag = Arc::clone(&ran);
    std::thread::spawn(move || {
        call_soon_threadsafe(&handle, move || {
            flag.store(true, Ordering::SeqCst);
        });
    })
    .join()
    .unwrap();

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(ran.load(Ordering::SeqCst));
}

#[tokio::test]
async fn run_in_thread_round_trips_value() {
    let out = run_in_thread(|| {
        // Definitely off the runtime thread pool's async workers.
        std::thread::sleep(Duration::from_millis(10));
        "from a worker thread"
    })
    .await
    .unwrap();
    assert_eq!(out, "from a worker thread");
}

#[tokio::test]
async fn run_in_thread_surfaces_panics() {
    let err = run_in_thread(|| -> u32 { panic!("worker exploded") })
        .await
        .unwrap_err();
    assert!(matches!(err, BridgeError::Panicked));
}

#[tokio::test]
async fn operation_offload_is_cancellable_at_the_await() {
    let op = isolated().build();

    let started = Arc::new(AtomicBool::new(false));
    let finished = Arc::new(AtomicBool::new(false));

    let canceller = op.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        canceller.cancel(Some("abandon it")).await;
    });

    let start_flag = Arc::clone(&started);
    let finish_flag = Arc::clone(&finished);
    let err = op
        .run_in_thread(move || {
            start_flag.store(true, Ordering::SeqCst);
            // Compute-bound work: cooperative cancellation cannot preempt
            // this, only abandon the await.
            std::thread::sleep(Duration::from_millis(300));
            finish_flag.store(true, Ordering::SeqCst);
            42
        })
        .await
        .unwrap_err();

    assert!(err.is_cancelled());
    assert_eq!(err.reason(), Some(CancelReason::Manual));
    assert!(started.load(Ordering::SeqCst));
    // The result was discarded, not the work.
    assert!(!finished.load(Ordering::SeqCst));
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert!(finished.load(Ordering::SeqCst));
}

#[tokio::test]
async fn operation_offload_checks_token_first() {
    let op = isolated().build();
    op.token().cancel_sync(CancelReason::Manual, Some("already over"));

    let ran = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&ran);
    let err = op
        .run_in_thread(move || {
            flag.store(true, Ordering::SeqCst);
        })
        .await
        .unwrap_err();

    assert!(err.is_cancelled());
    assert!(!ran.load(Ordering::SeqCst));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn worker_thread_can_check_a_token_cooperatively() {
    let op = isolated().build();
    let token = op.token().clone();

    let canceller = op.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        canceller.cancel(Some("stop counting")).await;
    });

    let iterations = op
        .run(async move {
            run_in_thread(move || {
                let mut n = 0u64;
                loop {
                    if n % 1000 == 0 && token.check().is_err() {
                        return n;
                    }
                    n += 1;
                    std::hint::black_box(n);
                    std::thread::sleep(Duration::from_micros(10));
                }
            })
            .await
            .unwrap()
        })
        .await;

    // Either the offloaded loop noticed the token and returned, or the
    // scope was cancelled at the await; both mean delivery worked.
    match iterations {
        Ok(n) => assert!(n > 0),
        Err(err) => assert_eq!(err.reason(), Some(CancelReason::Manual)),
    }
}
