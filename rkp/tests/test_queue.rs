use rkp::queue::{ExponentialBackoff, WorkQueue};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::timeout;

fn new_queue() -> Arc<WorkQueue<String>> {
    Arc::new(WorkQueue::new(ExponentialBackoff::new(
        Duration::from_millis(10),
        Duration::from_millis(200),
    )))
}

#[tokio::test]
async fn test_enqueues_during_flight_coalesce_into_one_redelivery() {
    let queue = new_queue();
    queue.enqueue("pvc-1".to_string()).await;
    let key = queue.get().await.unwrap();
    assert_eq!(key, "pvc-1");

    for _ in 0..10 {
        queue.enqueue("pvc-1".to_string()).await;
    }
    // still in flight, nothing to hand out
    assert_eq!(queue.len().await, 0);

    queue.done(&key).await;
    assert_eq!(queue.len().await, 1);
    let again = timeout(Duration::from_secs(1), queue.get())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(again, "pvc-1");
    queue.done(&again).await;

    assert!(
        timeout(Duration::from_millis(100), queue.get()).await.is_err(),
        "only one redelivery expected"
    );
}

#[tokio::test]
async fn test_same_key_never_processed_concurrently() {
    let queue = new_queue();
    let in_flight = Arc::new(Mutex::new(HashSet::new()));
    let processed = Arc::new(Mutex::new(0usize));

    let mut workers = Vec::new();
    for _ in 0..4 {
        let queue = queue.clone();
        let in_flight = in_flight.clone();
        let processed = processed.clone();
        workers.push(tokio::spawn(async move {
            while let Some(key) = queue.get().await {
                assert!(
                    in_flight.lock().await.insert(key.clone()),
                    "{key} handed to two workers"
                );
                tokio::time::sleep(Duration::from_millis(5)).await;
                in_flight.lock().await.remove(&key);
                *processed.lock().await += 1;
                queue.done(&key).await;
            }
        }));
    }

    for round in 0..20 {
        for claim in ["pvc-a", "pvc-b", "pvc-c"] {
            queue.enqueue(claim.to_string()).await;
        }
        if round % 5 == 0 {
            tokio::time::sleep(Duration::from_millis(3)).await;
        }
    }
    tokio::time::sleep(Duration::from_millis(200)).await;
    queue.shutdown();
    for worker in workers {
        worker.await.unwrap();
    }

    let processed = *processed.lock().await;
    assert!(processed >= 3, "each claim processed at least once");
    assert!(processed < 60, "storms are coalesced, got {processed}");
}

#[tokio::test]
async fn test_rate_limited_requeue_backs_off_and_resets() {
    let queue = new_queue();
    let key = "pvc-1".to_string();

    let mut delays = Vec::new();
    for _ in 0..6 {
        delays.push(queue.enqueue_rate_limited(key.clone()).await);
        let got = timeout(Duration::from_secs(2), queue.get())
            .await
            .unwrap()
            .unwrap();
        queue.done(&got).await;
    }
    assert_eq!(delays[0], Duration::from_millis(10));
    assert!(delays.windows(2).all(|w| w[0] <= w[1]));
    assert_eq!(*delays.last().unwrap(), Duration::from_millis(200));
    assert_eq!(queue.num_requeues(&key).await, 6);

    queue.forget(&key).await;
    assert_eq!(
        queue.enqueue_rate_limited(key.clone()).await,
        Duration::from_millis(10)
    );
}

#[tokio::test]
async fn test_delayed_item_arrives_after_delay() {
    let queue = new_queue();
    let start = tokio::time::Instant::now();
    queue
        .enqueue_after("pvc-late".to_string(), Duration::from_millis(80))
        .await;
    queue.enqueue("pvc-now".to_string()).await;

    assert_eq!(queue.get().await.as_deref(), Some("pvc-now"));
    assert_eq!(queue.get().await.as_deref(), Some("pvc-late"));
    assert!(start.elapsed() >= Duration::from_millis(80));
}
