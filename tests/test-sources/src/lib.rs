//! Tests for cancellation sources and their composition, driven through
//! full operations.
#![allow(unused_imports, dead_code)]

use curfew::{
    signal, AllOfSource, AnyOfSource, CancelReason, CancelSource, CancelToken, DeadlineSource,
    Operation, OperationStatus, PredicateSource, RunError, SignalSource, TokenSource, UsageError,
};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

fn isolated() -> curfew::OperationBuilder {
    Operation::builder().register_globally(false)
}

// -- deadline ---------------------------------------------------------------

#[tokio::test]
async fn deadline_cancels_slow_body() {
    // Scenario: 100ms deadline around a 1s sleep.
    let op = isolated()
        .name("s1")
        .source(DeadlineSource::after(Duration::from_millis(100)))
        .build();

    let err = op
        .run(async {
            tokio::time::sleep(Duration::from_secs(1)).await;
        })
        .await
        .unwrap_err();

    assert_eq!(err.reason(), Some(CancelReason::Timeout));
    assert_eq!(op.status(), OperationStatus::Cancelled);
    assert_eq!(op.reason(), Some(CancelReason::Timeout));
}

#[tokio::test]
async fn zero_deadline_cancels_at_first_suspension() {
    let op = isolated()
        .source(DeadlineSource::after(Duration::ZERO))
        .build();

    let reached_end = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&reached_end);

    let err = op
        .run(async move {
            tokio::task::yield_now().await;
            flag.store(true, Ordering::SeqCst);
        })
        .await
        .unwrap_err();

    assert_eq!(err.reason(), Some(CancelReason::Timeout));
    assert!(!reached_end.load(Ordering::SeqCst));
}

#[tokio::test]
async fn fast_body_beats_deadline() {
    let op = isolated()
        .source(DeadlineSource::after(Duration::from_secs(10)))
        .build();

    let out = op.run(async { "quick" }).await.unwrap();

    assert_eq!(out, "quick");
    assert_eq!(op.status(), OperationStatus::Completed);
    assert!(!op.is_cancelled());
}

#[test]
fn negative_deadline_errors_at_construction() {
    assert!(matches!(
        DeadlineSource::after_secs(-0.5),
        Err(UsageError::NegativeTimeout(_))
    ));
}

#[tokio::test]
async fn deadline_is_recorded_on_the_operation() {
    let op = isolated()
        .source(DeadlineSource::after(Duration::from_secs(5)))
        .build();

    assert!(op.deadline().is_none());
    op.run(async {}).await.unwrap();
    assert!(op.deadline().is_some());
}

// -- predicate --------------------------------------------------------------

#[test]
fn predicate_zero_interval_errors_at_construction() {
    assert!(matches!(
        PredicateSource::new(|| true, Duration::ZERO),
        Err(UsageError::ZeroInterval)
    ));
}

#[tokio::test]
async fn predicate_cancels_when_condition_met() {
    let counter = Arc::new(AtomicUsize::new(0));
    let watched = Arc::clone(&counter);

    let op = isolated()
        .source(
            PredicateSource::new(
                move || watched.load(Ordering::SeqCst) >= 10,
                Duration::from_millis(10),
            )
            .unwrap()
            .named("counter"),
        )
        .build();

    let ticker = Arc::clone(&counter);
    let err = op
        .run(async move {
            loop {
                tokio::time::sleep(Duration::from_millis(5)).await;
                ticker.fetch_add(1, Ordering::SeqCst);
            }
        })
        .await
        .unwrap_err();

    assert_eq!(err.reason(), Some(CancelReason::Condition));
    assert!(op.message().unwrap().contains("counter"));
}

#[tokio::test]
async fn predicate_error_does_not_cancel() {
    // A panicking predicate is reported to on_error and the operation
    // continues without it.
    let errors = Arc::new(AtomicUsize::new(0));
    let seen = Arc::clone(&errors);

    let op = isolated()
        .source(
            PredicateSource::new(|| panic!("broken check"), Duration::from_millis(10)).unwrap(),
        )
        .build();
    op.on_error(move |_snapshot, _message| {
        seen.fetch_add(1, Ordering::SeqCst);
    });

    let out = op
        .run(async {
            tokio::time::sleep(Duration::from_millis(80)).await;
            "survived"
        })
        .await
        .unwrap();

    assert_eq!(out, "survived");
    assert_eq!(op.status(), OperationStatus::Completed);
    assert!(errors.load(Ordering::SeqCst) >= 1);
}

#[tokio::test]
async fn sustained_predicate_ignores_transient_true() {
    // Goes true for a single check, then false again: must not fire.
    let tick = Arc::new(AtomicUsize::new(0));
    let watched = Arc::clone(&tick);

    let op = isolated()
        .source(
            PredicateSource::new(
                move || watched.load(Ordering::SeqCst) == 2,
                Duration::from_millis(10),
            )
            .unwrap()
            .sustained_for(Duration::from_millis(50)),
        )
        .build();

    let ticker = Arc::clone(&tick);
    let out = op
        .run(async move {
            for _ in 0..20 {
                tokio::time::sleep(Duration::from_millis(10)).await;
                ticker.fetch_add(1, Ordering::SeqCst);
            }
            "done"
        })
        .await
        .unwrap();

    assert_eq!(out, "done");
    assert!(!op.is_cancelled());
}

// -- token ------------------------------------------------------------------

#[tokio::test]
async fn external_token_cancels_operation() {
    // Scenario: task A runs under a token, task B cancels it after 100ms.
    let token = CancelToken::new();
    let op = isolated().name("s2").token(token.clone()).build();

    let canceller = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        token.cancel(CancelReason::Manual, Some("stop")).await;
    });

    let err = op
        .run(async {
            tokio::time::sleep(Duration::from_secs(10)).await;
        })
        .await
        .unwrap_err();

    canceller.await.unwrap();
    assert_eq!(err.reason(), Some(CancelReason::Manual));
    assert_eq!(op.reason(), Some(CancelReason::Manual));
    assert_eq!(op.message().as_deref(), Some("stop"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn os_thread_cancels_operation() {
    // Scenario: cancel_sync from a plain thread reaches the running scope.
    let token = CancelToken::new();
    let op = isolated().token(token.clone()).build();

    std::thread::spawn(move || {
        std::thread::sleep(Duration::from_millis(100));
        token.cancel_sync(CancelReason::Manual, Some("user"));
    });

    let err = op
        .run(async {
            tokio::time::sleep(Duration::from_secs(10)).await;
        })
        .await
        .unwrap_err();

    assert_eq!(err.reason(), Some(CancelReason::Manual));
    assert_eq!(op.message().as_deref(), Some("user"));
}

#[tokio::test]
async fn token_source_observes_without_owning() {
    let external = CancelToken::new();
    let op = isolated()
        .source(TokenSource::new(external.clone()))
        .build();

    let canceller = tokio::spawn({
        let external = external.clone();
        async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            external.cancel(CancelReason::Manual, Some("done with it")).await;
        }
    });

    let err = op
        .run(async {
            tokio::time::sleep(Duration::from_secs(10)).await;
        })
        .await
        .unwrap_err();

    canceller.await.unwrap();
    assert_eq!(err.reason(), Some(CancelReason::Manual));
    assert!(op.message().unwrap().contains("done with it"));
}

// -- composition ------------------------------------------------------------

#[tokio::test]
async fn any_of_first_firing_source_wins() {
    // Scenario: deadline(5s) | token | SIGINT — the token fires first.
    let token = CancelToken::new();
    let any_of = AnyOfSource::new(vec![
        Box::new(DeadlineSource::after(Duration::from_secs(5))),
        Box::new(TokenSource::new(token.clone())),
        Box::new(SignalSource::interrupt()),
    ])
    .unwrap();

    let op = isolated().name("s4").source(any_of).build();

    let canceller = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        token.cancel(CancelReason::Manual, Some("winner")).await;
    });

    let err = op
        .run(async {
            tokio::time::sleep(Duration::from_secs(30)).await;
        })
        .await
        .unwrap_err();

    canceller.await.unwrap();
    assert_eq!(err.reason(), Some(CancelReason::Manual));
    assert_eq!(op.status(), OperationStatus::Cancelled);
}

#[tokio::test]
async fn all_of_requires_every_source() {
    // Scenario: deadline(300ms) & predicate that turns true around 100ms.
    // The operation keeps running until both have fired.
    let counter = Arc::new(AtomicUsize::new(0));
    let watched = Arc::clone(&counter);

    let all_of = AllOfSource::new(vec![
        Box::new(DeadlineSource::after(Duration::from_millis(300))),
        Box::new(
            PredicateSource::new(
                move || watched.load(Ordering::SeqCst) >= 10,
                Duration::from_millis(20),
            )
            .unwrap(),
        ),
    ])
    .unwrap();

    let op = isolated().name("s5").source(all_of).build();

    let started = std::time::Instant::now();
    let ticker = Arc::clone(&counter);
    let err = op
        .run(async move {
            loop {
                tokio::time::sleep(Duration::from_millis(10)).await;
                ticker.fetch_add(1, Ordering::SeqCst);
            }
        })
        .await
        .unwrap_err();

    // Cancelled only once the deadline (the later of the two) fired.
    assert!(started.elapsed() >= Duration::from_millis(250));
    assert_eq!(err.reason(), Some(CancelReason::Condition));
    assert!(op.message().unwrap().contains("all 2 sources triggered"));
}

#[tokio::test]
async fn losing_sources_are_deactivated_without_firing() {
    let token = CancelToken::new();
    let op = isolated()
        .source(DeadlineSource::after(Duration::from_millis(30)))
        .source(TokenSource::new(token.clone()))
        .build();

    let err = op
        .run(async {
            tokio::time::sleep(Duration::from_secs(10)).await;
        })
        .await
        .unwrap_err();

    assert_eq!(err.reason(), Some(CancelReason::Timeout));

    // The token source was deactivated on exit: a late external fire does
    // not rewrite the operation's reason.
    token.cancel(CancelReason::Manual, Some("late")).await;
    assert_eq!(op.reason(), Some(CancelReason::Timeout));
}

#[cfg(unix)]
#[tokio::test]
async fn signal_cancels_operation() {
    let op = isolated()
        .source(SignalSource::new([signal::SIGUSR1]))
        .build();

    let raiser = tokio::spawn(async {
        tokio::time::sleep(Duration::from_millis(100)).await;
        // SAFETY: delivering a signal we registered interest in.
        unsafe {
            raise(signal::SIGUSR1);
        }
    });

    let err = op
        .run(async {
            tokio::time::sleep(Duration::from_secs(10)).await;
        })
        .await
        .unwrap_err();

    raiser.await.unwrap();
    assert_eq!(err.reason(), Some(CancelReason::Signal));
    assert!(op.message().unwrap().contains("10"));
}

#[cfg(unix)]
extern "C" {
    fn raise(signum: i32) -> i32;
}
