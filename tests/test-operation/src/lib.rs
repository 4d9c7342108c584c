//! Tests for the operation scope: lifecycle, callbacks, ambient context,
//! shielding, wrapping, and combination.
#![allow(unused_imports, dead_code)]

use curfew::{
    current_operation, CancelReason, CancelToken, DeadlineSource, Operation, OperationStatus,
    RunError, UsageError,
};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

fn isolated() -> curfew::OperationBuilder {
    Operation::builder().register_globally(false)
}

// -- lifecycle --------------------------------------------------------------

#[tokio::test]
async fn status_walks_pending_running_completed() {
    let op = isolated().build();
    assert_eq!(op.status(), OperationStatus::Pending);

    let observer = op.clone();
    let out = op
        .run(async move {
            assert_eq!(observer.status(), OperationStatus::Running);
            "ok"
        })
        .await
        .unwrap();

    assert_eq!(out, "ok");
    assert_eq!(op.status(), OperationStatus::Completed);
}

#[tokio::test]
async fn lifecycle_callbacks_fire_in_order() {
    let op = isolated().build();
    let events = Arc::new(Mutex::new(Vec::new()));

    let e = Arc::clone(&events);
    op.on_start(move |s| e.lock().unwrap().push(format!("start:{}", s.status)));
    let e = Arc::clone(&events);
    op.on_complete(move |s| e.lock().unwrap().push(format!("complete:{}", s.status)));
    let e = Arc::clone(&events);
    op.on_cancel(move |s| e.lock().unwrap().push(format!("cancel:{}", s.status)));

    op.run(async {}).await.unwrap();

    assert_eq!(
        *events.lock().unwrap(),
        vec!["start:running", "complete:completed"]
    );
}

#[tokio::test]
async fn cancel_fires_on_cancel_not_on_complete() {
    let op = isolated().build();
    let events = Arc::new(Mutex::new(Vec::new()));

    let e = Arc::clone(&events);
    op.on_complete(move |_| e.lock().unwrap().push("complete"));
    let e = Arc::clone(&events);
    op.on_cancel(move |_| e.lock().unwrap().push("cancel"));

    let canceller = op.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        canceller.cancel(Some("stop")).await;
    });

    let _ = op
        .run(async {
            tokio::time::sleep(Duration::from_secs(10)).await;
        })
        .await;

    assert_eq!(*events.lock().unwrap(), vec!["cancel"]);
    assert_eq!(op.status(), OperationStatus::Cancelled);
}

#[tokio::test]
async fn run_result_failure_path() {
    let op = isolated().build();
    let errors = Arc::new(Mutex::new(Vec::new()));
    let e = Arc::clone(&errors);
    op.on_error(move |_s, message| e.lock().unwrap().push(message.to_owned()));

    let out: Result<(), String> = op
        .run_result(async { Err("disk on fire".to_owned()) })
        .await
        .unwrap();

    assert_eq!(out, Err("disk on fire".to_owned()));
    assert_eq!(op.status(), OperationStatus::Failed);
    assert_eq!(*errors.lock().unwrap(), vec!["disk on fire"]);
}

#[tokio::test]
async fn body_result_ok_completes() {
    let op = isolated().build();
    let out: Result<u32, String> = op.run_result(async { Ok(7u32) }).await.unwrap();
    assert_eq!(out, Ok(7));
    assert_eq!(op.status(), OperationStatus::Completed);
}

#[tokio::test]
async fn double_entry_fails_fast() {
    let op = isolated().build();
    op.run(async {}).await.unwrap();

    assert!(matches!(
        op.run(async {}).await.unwrap_err(),
        RunError::Usage(UsageError::AlreadyEntered(_))
    ));
}

#[tokio::test]
async fn cleanup_in_body_runs_on_cancellation() {
    struct SetOnDrop(Arc<AtomicBool>);
    impl Drop for SetOnDrop {
        fn drop(&mut self) {
            self.0.store(true, Ordering::SeqCst);
        }
    }

    let cleaned = Arc::new(AtomicBool::new(false));
    let op = isolated()
        .source(DeadlineSource::after(Duration::from_millis(30)))
        .build();

    let guard_flag = Arc::clone(&cleaned);
    let _ = op
        .run(async move {
            let _guard = SetOnDrop(guard_flag);
            tokio::time::sleep(Duration::from_secs(10)).await;
        })
        .await;

    assert!(cleaned.load(Ordering::SeqCst));
}

// -- progress ---------------------------------------------------------------

#[tokio::test]
async fn progress_callbacks_in_registration_order() {
    let op = isolated().build();
    let order = Arc::new(Mutex::new(Vec::new()));

    for i in 0..3 {
        let order = Arc::clone(&order);
        op.on_progress(move |update| {
            order.lock().unwrap().push((i, update.message.clone()));
        });
    }

    let reporter = op.clone();
    op.run(async move {
        reporter.report_progress("halfway", None).await.unwrap();
    })
    .await
    .unwrap();

    let order = order.lock().unwrap();
    assert_eq!(order.len(), 3);
    assert_eq!(order[0].0, 0);
    assert_eq!(order[1].0, 1);
    assert_eq!(order[2].0, 2);
}

#[tokio::test]
async fn progress_is_a_cancellation_checkpoint() {
    let op = isolated().build();
    let delivered = Arc::new(AtomicUsize::new(0));
    let d = Arc::clone(&delivered);
    op.on_progress(move |_| {
        d.fetch_add(1, Ordering::SeqCst);
    });

    let reporter = op.clone();
    let err = op
        .run(async move {
            reporter.report_progress("one", None).await.unwrap();
            reporter
                .token()
                .cancel(CancelReason::Manual, Some("mid-body"))
                .await;
            // The checkpoint fires before callbacks: this report delivers
            // nothing and returns the cancellation.
            let err = reporter.report_progress("two", None).await.unwrap_err();
            assert_eq!(err.reason(), CancelReason::Manual);
            tokio::time::sleep(Duration::from_secs(10)).await;
        })
        .await
        .unwrap_err();

    assert_eq!(err.reason(), Some(CancelReason::Manual));
    assert_eq!(delivered.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn progress_then_cancel_delivers_before_on_cancel() {
    let op = isolated().build();
    let events = Arc::new(Mutex::new(Vec::new()));

    let e = Arc::clone(&events);
    op.on_progress(move |_| e.lock().unwrap().push("progress"));
    let e = Arc::clone(&events);
    op.on_cancel(move |_| e.lock().unwrap().push("cancel"));

    let worker = op.clone();
    let _ = op
        .run(async move {
            worker.report_progress("tick", None).await.unwrap();
            worker.cancel(Some("done")).await;
            tokio::time::sleep(Duration::from_secs(10)).await;
        })
        .await;

    assert_eq!(*events.lock().unwrap(), vec!["progress", "cancel"]);
}

#[tokio::test]
async fn async_progress_callbacks_are_awaited() {
    let op = isolated().build();
    let count = Arc::new(AtomicUsize::new(0));
    let c = Arc::clone(&count);
    op.on_progress_async(move |update| {
        let c = Arc::clone(&c);
        async move {
            tokio::task::yield_now().await;
            assert_eq!(update.message, "tick");
            c.fetch_add(1, Ordering::SeqCst);
        }
    });

    let reporter = op.clone();
    op.run(async move {
        reporter.report_progress("tick", None).await.unwrap();
    })
    .await
    .unwrap();

    assert_eq!(count.load(Ordering::SeqCst), 1);
}

// -- ambient context --------------------------------------------------------

#[tokio::test]
async fn current_operation_sees_innermost_scope() {
    assert!(current_operation().is_none());

    let outer = isolated().name("outer").build();
    let inner = isolated().name("inner").build();

    let outer_id = outer.id().to_owned();
    let inner_id = inner.id().to_owned();

    outer
        .run(async move {
            assert_eq!(current_operation().unwrap().id(), outer_id);

            inner
                .run(async move {
                    assert_eq!(current_operation().unwrap().id(), inner_id);
                })
                .await
                .unwrap();

            assert_eq!(current_operation().unwrap().id(), outer_id);
        })
        .await
        .unwrap();

    assert!(current_operation().is_none());
}

#[tokio::test]
async fn concurrent_tasks_do_not_share_ambient_scope() {
    let a = isolated().name("a").build();
    let b = isolated().name("b").build();

    let a_id = a.id().to_owned();
    let b_id = b.id().to_owned();

    let task_a = tokio::spawn(async move {
        a.run(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            current_operation().unwrap().id().to_owned()
        })
        .await
        .unwrap()
    });
    let task_b = tokio::spawn(async move {
        b.run(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            current_operation().unwrap().id().to_owned()
        })
        .await
        .unwrap()
    });

    assert_eq!(task_a.await.unwrap(), a_id);
    assert_eq!(task_b.await.unwrap(), b_id);
}

// -- shielding --------------------------------------------------------------

#[tokio::test]
async fn shield_defers_cancellation_delivery() {
    let op = isolated().build();
    let shielded_section_finished = Arc::new(AtomicBool::new(false));

    let canceller = op.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        canceller.cancel(Some("stop")).await;
    });

    let worker = op.clone();
    let finished = Arc::clone(&shielded_section_finished);
    let err = op
        .run(async move {
            {
                let _guard = worker.shield();
                assert_eq!(worker.status(), OperationStatus::Shielded);
                // Cancellation arrives mid-shield but must not interrupt this.
                tokio::time::sleep(Duration::from_millis(100)).await;
                finished.store(true, Ordering::SeqCst);
            }
            // Delivery resumes after the guard drops.
            tokio::time::sleep(Duration::from_secs(10)).await;
        })
        .await
        .unwrap_err();

    assert_eq!(err.reason(), Some(CancelReason::Manual));
    assert!(shielded_section_finished.load(Ordering::SeqCst));
    assert_eq!(op.status(), OperationStatus::Cancelled);
}

#[tokio::test]
async fn shield_status_reverts_on_release() {
    let op = isolated().build();
    let observer = op.clone();
    op.run(async move {
        let guard = observer.shield();
        assert_eq!(observer.status(), OperationStatus::Shielded);
        drop(guard);
        assert_eq!(observer.status(), OperationStatus::Running);
    })
    .await
    .unwrap();
}

#[tokio::test]
async fn token_stays_observable_inside_shield() {
    let op = isolated().build();
    let worker = op.clone();

    let err = op
        .run(async move {
            let _guard = worker.shield();
            worker
                .token()
                .cancel(CancelReason::Manual, Some("requested"))
                .await;
            // Shielded code may honor the token voluntarily.
            assert!(worker.token().check().is_err());
            drop(_guard);
            tokio::time::sleep(Duration::from_secs(10)).await;
        })
        .await
        .unwrap_err();

    assert_eq!(err.reason(), Some(CancelReason::Manual));
}

// -- wrap / combine / run_in_thread ----------------------------------------

#[tokio::test]
async fn wrap_guards_each_invocation() {
    let op = isolated().build();
    let calls = Arc::new(AtomicUsize::new(0));

    let counter = Arc::clone(&calls);
    let guarded = op.wrap(move || counter.fetch_add(1, Ordering::SeqCst));

    assert!(guarded().is_ok());
    assert!(guarded().is_ok());

    op.token().cancel_sync(CancelReason::Manual, None);
    assert!(guarded().is_err());
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn combine_cancels_when_either_fires() {
    let a = isolated().name("a").build();
    let b = isolated().name("b").build();
    let combined = a.combine(&b);

    let b_token = b.token().clone();
    let canceller = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(30)).await;
        b_token
            .cancel(CancelReason::Timeout, Some("b expired"))
            .await;
    });

    let err = combined
        .run(async {
            tokio::time::sleep(Duration::from_secs(10)).await;
        })
        .await
        .unwrap_err();

    canceller.await.unwrap();
    assert_eq!(err.reason(), Some(CancelReason::Timeout));
}

#[tokio::test]
async fn run_in_thread_returns_value() {
    let op = isolated().build();
    let worker = op.clone();
    let out = op
        .run(async move { worker.run_in_thread(|| 21 * 2).await.unwrap() })
        .await
        .unwrap();
    assert_eq!(out, 42);
}

#[tokio::test]
async fn run_in_thread_refuses_after_cancellation() {
    let op = isolated().build();
    op.token().cancel_sync(CancelReason::Manual, None);

    let err = op.run_in_thread(|| 1).await.unwrap_err();
    assert!(err.is_cancelled());
}

#[tokio::test]
async fn completed_operation_keeps_its_output_despite_late_cancel() {
    let op = isolated().build();
    let out = op.run(async { "value" }).await.unwrap();
    assert_eq!(out, "value");

    // Cancelling after exit does not rewrite history.
    op.cancel(Some("too late")).await;
    assert_eq!(op.status(), OperationStatus::Completed);
}
