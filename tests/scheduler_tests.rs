//! End-to-end scenarios for the one-shot job scheduler.


use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use cluster_lite::{
    get_scheduler, ClusterError, JobOnceMetadata, JobOnceScheduler, MemoryKvStore,
};
use tokio::time::{sleep, timeout};

use test_harness::{
    assert_eventually, counting_callback, failing_callback, fast_scheduler_config,
    recording_callback,
};

fn in_ms(ms: i64) -> DateTime<Utc> {
    Utc::now() + chrono::Duration::milliseconds(ms)
}

#[tokio::test]
async fn test_single_job_fires_once() {
    let kv = Arc::new(MemoryKvStore::new());
    let scheduler = JobOnceScheduler::with_config(kv.clone(), fast_scheduler_config());
    let (callback, count) = counting_callback();
    scheduler.add_callback(callback).await;
    scheduler.start().await.unwrap();

    scheduler.schedule_once("a", in_ms(100)).await.unwrap();
    assert!(kv.contains("once_a"));

    assert_eventually(
        || async { count.load(Ordering::SeqCst) == 1 && !kv.contains("once_a") },
        Duration::from_millis(300),
        "job should fire once and its record should be deleted",
    )
    .await;

    sleep(Duration::from_millis(200)).await;
    assert_eq!(count.load(Ordering::SeqCst), 1, "job must not fire again");
    assert!(!scheduler.is_active("a").await);
}

#[tokio::test]
async fn test_job_fires_with_its_key() {
    let kv = Arc::new(MemoryKvStore::new());
    let scheduler = JobOnceScheduler::with_config(kv.clone(), fast_scheduler_config());
    let log = Arc::new(Mutex::new(Vec::new()));
    scheduler
        .add_callback(recording_callback("cb", Arc::clone(&log)))
        .await;
    scheduler.start().await.unwrap();

    scheduler.schedule_once("report", in_ms(50)).await.unwrap();

    assert_eventually(
        || async { log.lock().unwrap().as_slice() == ["cb:report"] },
        Duration::from_secs(1),
        "callback should receive the job key",
    )
    .await;
}

#[tokio::test]
async fn test_cancel_before_fire() {
    let kv = Arc::new(MemoryKvStore::new());
    let config = fast_scheduler_config();
    let scheduler = JobOnceScheduler::with_config(kv.clone(), config.clone());
    let (callback, count) = counting_callback();
    scheduler.add_callback(callback).await;
    scheduler.start().await.unwrap();

    scheduler.schedule_once("b", in_ms(100)).await.unwrap();
    timeout(Duration::from_secs(2), scheduler.close("b"))
        .await
        .expect("close should join the runner promptly")
        .unwrap();

    assert!(!kv.contains("once_b"));
    assert!(!scheduler.is_active("b").await);

    sleep(config.fail_wait * 2 + config.jitter).await;
    assert_eq!(count.load(Ordering::SeqCst), 0, "cancelled job must not fire");
}

#[tokio::test]
async fn test_schedule_existing_key_fails() {
    let kv = Arc::new(MemoryKvStore::new());
    let scheduler = JobOnceScheduler::with_config(kv.clone(), fast_scheduler_config());
    let (callback, count) = counting_callback();
    scheduler.add_callback(callback).await;
    scheduler.start().await.unwrap();

    scheduler.schedule_once("c", in_ms(150)).await.unwrap();
    let original = kv.raw_get("once_c").unwrap();

    let result = scheduler.schedule_once("c", in_ms(10_000)).await;
    assert!(matches!(result, Err(ClusterError::AlreadyExists(_))));
    assert_eq!(
        kv.raw_get("once_c").unwrap(),
        original,
        "failed schedule must not modify the record"
    );

    // The original job still fires once, at its original time.
    assert_eventually(
        || async { count.load(Ordering::SeqCst) == 1 && !kv.contains("once_c") },
        Duration::from_millis(500),
        "original job should fire once",
    )
    .await;
}

#[tokio::test]
async fn test_bootstrap_from_existing_records() {
    let kv = Arc::new(MemoryKvStore::new());

    for key in ["r1", "r2", "r3"] {
        let metadata = JobOnceMetadata {
            key: key.to_string(),
            run_at: in_ms(100),
        };
        kv.set_raw(
            &format!("once_{}", key),
            &serde_json::to_vec(&metadata).unwrap(),
        );
    }

    let scheduler = JobOnceScheduler::with_config(kv.clone(), fast_scheduler_config());
    let log = Arc::new(Mutex::new(Vec::new()));
    scheduler
        .add_callback(recording_callback("cb", Arc::clone(&log)))
        .await;
    scheduler.start().await.unwrap();

    assert_eventually(
        || async {
            !kv.contains("once_r1") && !kv.contains("once_r2") && !kv.contains("once_r3")
        },
        Duration::from_secs(1),
        "all recovered jobs should run and be deleted",
    )
    .await;

    sleep(Duration::from_millis(100)).await;
    let mut fired = log.lock().unwrap().clone();
    fired.sort();
    assert_eq!(fired, vec!["cb:r1", "cb:r2", "cb:r3"]);
}

#[tokio::test]
async fn test_exhausted_reads_cancel_the_job() {
    let kv = Arc::new(MemoryKvStore::new());
    let scheduler = JobOnceScheduler::with_config(kv.clone(), fast_scheduler_config());
    let (callback, count) = counting_callback();
    scheduler.add_callback(callback).await;
    scheduler.start().await.unwrap();

    scheduler.schedule_once("d", in_ms(100)).await.unwrap();
    kv.set_failing_with_prefix(Some("once_"));

    assert_eventually(
        || async { !scheduler.is_active("d").await },
        Duration::from_secs(2),
        "runner should give up after repeated failed reads",
    )
    .await;

    assert_eq!(count.load(Ordering::SeqCst), 0, "job must not fire");
    assert!(!kv.contains("once_d"), "record is cleaned up on giving up");
}

#[tokio::test]
async fn test_double_close_is_a_no_op() {
    let kv = Arc::new(MemoryKvStore::new());
    let scheduler = JobOnceScheduler::with_config(kv.clone(), fast_scheduler_config());
    let (callback, count) = counting_callback();
    scheduler.add_callback(callback).await;
    scheduler.start().await.unwrap();

    let job = scheduler.schedule_once("dup", in_ms(100)).await.unwrap();

    for _ in 0..2 {
        timeout(Duration::from_secs(2), scheduler.close("dup"))
            .await
            .expect("close should return promptly")
            .unwrap();
    }
    // Closing through a retained handle is just as safe, even afterwards.
    for _ in 0..2 {
        timeout(Duration::from_secs(2), job.close())
            .await
            .expect("handle close should return promptly");
    }

    assert!(!kv.contains("once_dup"));
    assert_eq!(count.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_close_removes_job_from_listing() {
    let kv = Arc::new(MemoryKvStore::new());
    let scheduler = JobOnceScheduler::with_config(kv.clone(), fast_scheduler_config());
    let (callback, _count) = counting_callback();
    scheduler.add_callback(callback).await;
    scheduler.start().await.unwrap();

    scheduler.schedule_once("keep", in_ms(10_000)).await.unwrap();
    scheduler.schedule_once("drop", in_ms(10_000)).await.unwrap();

    scheduler.close("drop").await.unwrap();

    let listed = scheduler.list_scheduled().await.unwrap();
    let keys: Vec<&str> = listed.iter().map(|m| m.key.as_str()).collect();
    assert!(keys.contains(&"keep"));
    assert!(!keys.contains(&"drop"));

    scheduler.close("keep").await.unwrap();
}

#[tokio::test]
async fn test_close_and_reschedule_same_key() {
    let kv = Arc::new(MemoryKvStore::new());
    let scheduler = JobOnceScheduler::with_config(kv.clone(), fast_scheduler_config());
    let (callback, count) = counting_callback();
    scheduler.add_callback(callback).await;
    scheduler.start().await.unwrap();

    scheduler.schedule_once("f", in_ms(100)).await.unwrap();
    scheduler.close("f").await.unwrap();
    assert!(!kv.contains("once_f"));

    scheduler.schedule_once("f", in_ms(100)).await.unwrap();

    assert_eventually(
        || async { count.load(Ordering::SeqCst) == 1 && !kv.contains("once_f") },
        Duration::from_secs(1),
        "rescheduled job should fire once",
    )
    .await;
}

#[tokio::test]
async fn test_close_without_local_runner_deletes_record() {
    let kv = Arc::new(MemoryKvStore::new());
    let scheduler = JobOnceScheduler::with_config(kv.clone(), fast_scheduler_config());
    let (callback, _count) = counting_callback();
    scheduler.add_callback(callback).await;
    scheduler.start().await.unwrap();

    // Simulate a peer node's job this node has not polled yet.
    let metadata = JobOnceMetadata {
        key: "peer".to_string(),
        run_at: in_ms(10_000),
    };
    kv.set_raw("once_peer", &serde_json::to_vec(&metadata).unwrap());

    timeout(Duration::from_secs(2), scheduler.close("peer"))
        .await
        .expect("close of a non-local job should not block on a runner")
        .unwrap();
    assert!(!kv.contains("once_peer"));
}

#[tokio::test]
async fn test_poller_discovers_peer_jobs() {
    let kv = Arc::new(MemoryKvStore::new());
    let scheduler = JobOnceScheduler::with_config(kv.clone(), fast_scheduler_config());
    let (callback, count) = counting_callback();
    scheduler.add_callback(callback).await;
    scheduler.start().await.unwrap();

    // Written after start, so only the poller can find it.
    let metadata = JobOnceMetadata {
        key: "late".to_string(),
        run_at: in_ms(50),
    };
    kv.set_raw("once_late", &serde_json::to_vec(&metadata).unwrap());

    assert_eventually(
        || async { count.load(Ordering::SeqCst) == 1 && !kv.contains("once_late") },
        Duration::from_secs(2),
        "poller should pick up the peer job and fire it",
    )
    .await;
}

#[tokio::test]
async fn test_callback_error_is_isolated_and_record_deleted() {
    let kv = Arc::new(MemoryKvStore::new());
    let scheduler = JobOnceScheduler::with_config(kv.clone(), fast_scheduler_config());
    let (counting, count) = counting_callback();
    scheduler.add_callback(failing_callback()).await;
    scheduler.add_callback(counting).await;
    scheduler.start().await.unwrap();

    scheduler.schedule_once("g", in_ms(50)).await.unwrap();

    assert_eventually(
        || async { count.load(Ordering::SeqCst) == 1 && !kv.contains("once_g") },
        Duration::from_secs(1),
        "a failing callback must not block later callbacks or record deletion",
    )
    .await;

    sleep(Duration::from_millis(200)).await;
    assert_eq!(count.load(Ordering::SeqCst), 1, "no retry storm on callback errors");
}

#[tokio::test]
async fn test_callbacks_run_in_registration_order() {
    let kv = Arc::new(MemoryKvStore::new());
    let scheduler = JobOnceScheduler::with_config(kv.clone(), fast_scheduler_config());
    let log = Arc::new(Mutex::new(Vec::new()));
    scheduler
        .add_callback(recording_callback("first", Arc::clone(&log)))
        .await;
    scheduler
        .add_callback(recording_callback("second", Arc::clone(&log)))
        .await;
    scheduler.start().await.unwrap();

    scheduler.schedule_once("h", in_ms(50)).await.unwrap();

    assert_eventually(
        || async { log.lock().unwrap().len() == 2 },
        Duration::from_secs(1),
        "both callbacks should fire",
    )
    .await;
    assert_eq!(log.lock().unwrap().as_slice(), ["first:h", "second:h"]);
}

#[tokio::test]
async fn test_remove_callback() {
    let kv = Arc::new(MemoryKvStore::new());
    let scheduler = JobOnceScheduler::with_config(kv.clone(), fast_scheduler_config());
    let (removed, removed_count) = counting_callback();
    let (kept, kept_count) = counting_callback();
    let removed_id = scheduler.add_callback(removed).await;
    scheduler.add_callback(kept).await;
    scheduler.start().await.unwrap();

    assert!(scheduler.remove_callback(removed_id).await);
    assert!(!scheduler.remove_callback(removed_id).await);

    scheduler.schedule_once("i", in_ms(50)).await.unwrap();

    assert_eventually(
        || async { kept_count.load(Ordering::SeqCst) == 1 },
        Duration::from_secs(1),
        "remaining callback should fire",
    )
    .await;
    assert_eq!(removed_count.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_past_run_at_fires_immediately() {
    let kv = Arc::new(MemoryKvStore::new());
    let scheduler = JobOnceScheduler::with_config(kv.clone(), fast_scheduler_config());
    let (callback, count) = counting_callback();
    scheduler.add_callback(callback).await;
    scheduler.start().await.unwrap();

    scheduler.schedule_once("past", in_ms(-1_000)).await.unwrap();

    assert_eventually(
        || async { count.load(Ordering::SeqCst) == 1 && !kv.contains("once_past") },
        Duration::from_millis(500),
        "overdue job should fire as soon as it is scheduled",
    )
    .await;
}

#[tokio::test]
async fn test_many_jobs_each_fire_once() {
    let kv = Arc::new(MemoryKvStore::new());
    let scheduler = JobOnceScheduler::with_config(kv.clone(), fast_scheduler_config());
    let log = Arc::new(Mutex::new(Vec::new()));
    scheduler
        .add_callback(recording_callback("cb", Arc::clone(&log)))
        .await;
    scheduler.start().await.unwrap();

    let keys: Vec<String> = (0..20).map(|i| format!("job_{}", i)).collect();
    for key in &keys {
        scheduler.schedule_once(key, in_ms(100)).await.unwrap();
    }

    assert_eventually(
        || async { log.lock().unwrap().len() == keys.len() },
        Duration::from_secs(2),
        "every job should fire",
    )
    .await;

    sleep(Duration::from_millis(200)).await;
    let mut fired = log.lock().unwrap().clone();
    fired.sort();
    let mut expected: Vec<String> = keys.iter().map(|k| format!("cb:{}", k)).collect();
    expected.sort();
    assert_eq!(fired, expected, "each job fires exactly once");
    for key in &keys {
        assert!(!kv.contains(&format!("once_{}", key)));
        assert!(!scheduler.is_active(key).await);
    }
}

#[tokio::test]
async fn test_start_requires_callbacks() {
    let kv = Arc::new(MemoryKvStore::new());
    let scheduler = JobOnceScheduler::with_config(kv, fast_scheduler_config());
    assert!(matches!(
        scheduler.start().await,
        Err(ClusterError::IllegalState(_))
    ));
}

#[tokio::test]
async fn test_start_twice_fails() {
    let kv = Arc::new(MemoryKvStore::new());
    let scheduler = JobOnceScheduler::with_config(kv, fast_scheduler_config());
    let (callback, _count) = counting_callback();
    scheduler.add_callback(callback).await;

    scheduler.start().await.unwrap();
    assert!(matches!(
        scheduler.start().await,
        Err(ClusterError::IllegalState(_))
    ));
}

#[tokio::test]
async fn test_schedule_before_start_fails() {
    let kv = Arc::new(MemoryKvStore::new());
    let scheduler = JobOnceScheduler::with_config(kv, fast_scheduler_config());
    let (callback, _count) = counting_callback();
    scheduler.add_callback(callback).await;

    assert!(matches!(
        scheduler.schedule_once("early", in_ms(100)).await,
        Err(ClusterError::IllegalState(_))
    ));
}

#[tokio::test]
async fn test_get_scheduler_returns_same_instance() {
    let first = get_scheduler(Arc::new(MemoryKvStore::new()));
    let second = get_scheduler(Arc::new(MemoryKvStore::new()));
    assert!(Arc::ptr_eq(&first, &second));
}
