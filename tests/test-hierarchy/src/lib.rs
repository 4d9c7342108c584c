//! Tests for parent→child cancellation propagation.
#![allow(unused_imports, dead_code)]

use curfew::{
    CancelReason, Operation, OperationFilter, OperationStatus, Registry, RunError, UsageError,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

fn isolated() -> curfew::OperationBuilder {
    Operation::builder().register_globally(false)
}

#[tokio::test]
async fn parent_cancel_reaches_children() {
    let parent = isolated().name("p").build();
    let c1 = isolated().name("c1").parent(&parent).build();
    let c2 = isolated().name("c2").parent(&parent).build();

    let c1_handle = c1.clone();
    let c2_handle = c2.clone();
    let parent_handle = parent.clone();

    let err = parent
        .run(async move {
            let child_task_1 = tokio::spawn(async move {
                c1_handle
                    .run(async {
                        tokio::time::sleep(Duration::from_secs(30)).await;
                    })
                    .await
            });
            let child_task_2 = tokio::spawn(async move {
                c2_handle
                    .run(async {
                        tokio::time::sleep(Duration::from_secs(30)).await;
                    })
                    .await
            });

            // Let both children enter, then stop the whole tree.
            tokio::time::sleep(Duration::from_millis(50)).await;
            parent_handle.cancel(Some("p-stop")).await;

            let (r1, r2) = tokio::join!(child_task_1, child_task_2);
            assert!(r1.unwrap().is_err());
            assert!(r2.unwrap().is_err());

            tokio::time::sleep(Duration::from_secs(30)).await;
        })
        .await
        .unwrap_err();

    assert_eq!(err.reason(), Some(CancelReason::Manual));

    assert_eq!(parent.status(), OperationStatus::Cancelled);
    assert_eq!(parent.reason(), Some(CancelReason::Manual));
    assert_eq!(parent.message().as_deref(), Some("p-stop"));

    for child in [c1, c2] {
        assert_eq!(child.status(), OperationStatus::Cancelled);
        assert_eq!(child.reason(), Some(CancelReason::Parent));
    }
}

#[tokio::test]
async fn grandchildren_are_cancelled_too() {
    let root = isolated().name("root").build();
    let mid = isolated().name("mid").parent(&root).build();
    let leaf = isolated().name("leaf").parent(&mid).build();

    let mid_handle = mid.clone();
    let leaf_handle = leaf.clone();
    let root_handle = root.clone();

    let _ = root
        .run(async move {
            tokio::spawn(async move {
                mid_handle
                    .run(async move {
                        leaf_handle
                            .run(async {
                                tokio::time::sleep(Duration::from_secs(30)).await;
                            })
                            .await
                    })
                    .await
            });

            tokio::time::sleep(Duration::from_millis(50)).await;
            root_handle.cancel(None).await;
            tokio::time::sleep(Duration::from_secs(30)).await;
        })
        .await;

    leaf.wait_done().await;
    assert_eq!(leaf.reason(), Some(CancelReason::Parent));
    assert_eq!(mid.reason(), Some(CancelReason::Parent));
}

#[tokio::test]
async fn child_exit_detaches_from_parent() {
    let parent = isolated().build();
    let child = isolated().parent(&parent).build();

    let child_handle = child.clone();
    let parent_observer = parent.clone();
    parent
        .run(async move {
            child_handle.run(async {}).await.unwrap();
            // The finished child is gone from the live-child list.
            assert!(parent_observer.children().is_empty());
        })
        .await
        .unwrap();

    assert_eq!(child.status(), OperationStatus::Completed);
    assert_eq!(parent.status(), OperationStatus::Completed);
}

#[tokio::test]
async fn parent_exit_cancels_stragglers() {
    // A child still running when the parent scope exits is cancelled and
    // awaited within the shutdown budget.
    let parent = isolated()
        .shutdown_budget(Duration::from_secs(2))
        .build();
    let child = isolated().parent(&parent).build();

    let child_handle = child.clone();
    parent
        .run(async move {
            tokio::spawn(async move {
                child_handle
                    .run(async {
                        tokio::time::sleep(Duration::from_secs(30)).await;
                    })
                    .await
            });
            tokio::time::sleep(Duration::from_millis(50)).await;
            // Parent body returns while the child is still running.
        })
        .await
        .unwrap();

    assert_eq!(child.status(), OperationStatus::Cancelled);
    assert_eq!(child.reason(), Some(CancelReason::Parent));
}

#[tokio::test]
async fn child_under_unentered_parent_is_rejected() {
    let parent = isolated().build();
    let child = isolated().parent(&parent).build();

    let err = child.run(async {}).await.unwrap_err();
    assert!(matches!(
        err,
        RunError::Usage(UsageError::ParentNotRunning(_))
    ));
}

#[tokio::test]
async fn shielded_child_finishes_section_before_observing_parent_cancel() {
    let parent = isolated().build();
    let child = isolated().parent(&parent).build();

    let section_done = Arc::new(AtomicBool::new(false));

    let parent_handle = parent.clone();
    let child_handle = child.clone();
    let flag = Arc::clone(&section_done);

    let _ = parent
        .run(async move {
            let child_task = tokio::spawn(async move {
                let worker = child_handle.clone();
                child_handle
                    .run(async move {
                        {
                            let _guard = worker.shield();
                            tokio::time::sleep(Duration::from_millis(150)).await;
                            flag.store(true, Ordering::SeqCst);
                        }
                        tokio::time::sleep(Duration::from_secs(30)).await;
                    })
                    .await
            });

            tokio::time::sleep(Duration::from_millis(50)).await;
            parent_handle.cancel(Some("stop the tree")).await;

            let child_result = child_task.await.unwrap();
            assert!(child_result.is_err());
            tokio::time::sleep(Duration::from_secs(30)).await;
        })
        .await;

    // The shielded section ran to completion despite the earlier cancel.
    assert!(section_done.load(Ordering::SeqCst));
    assert_eq!(child.reason(), Some(CancelReason::Parent));
    assert_eq!(child.status(), OperationStatus::Cancelled);
}

#[tokio::test]
async fn child_cancel_does_not_propagate_upward() {
    let parent = isolated().build();
    let child = isolated().parent(&parent).build();

    let child_handle = child.clone();
    let canceller = child.clone();
    parent
        .run(async move {
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(30)).await;
                canceller.cancel(Some("just the child")).await;
            });
            let result = child_handle
                .run(async {
                    tokio::time::sleep(Duration::from_secs(30)).await;
                })
                .await;
            assert!(result.is_err());
        })
        .await
        .unwrap();

    assert_eq!(child.status(), OperationStatus::Cancelled);
    assert_eq!(child.reason(), Some(CancelReason::Manual));
    assert_eq!(parent.status(), OperationStatus::Completed);
    assert!(!parent.is_cancelled());
}
