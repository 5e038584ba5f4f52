use std::sync::Arc;
use std::time::Duration;

use autoproperty::BatchRequest;
use autoproperty::ExternalRequest;
use autoproperty::PropertyRef;
use futures::future::join_all;

use crate::common::enable_logger;
use crate::common::server;
use crate::common::settings_graph;
use crate::common::CounterProperty;

const TASKS: u64 = 16;
const ROUNDS: u64 = 5;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_increments_are_serialized_per_key() {
    enable_logger();
    let server = server("concurrent_counter");
    let counter = Arc::new(CounterProperty::new("counter", Duration::from_millis(2)));
    let counter_ref: PropertyRef<u64, i64> = counter.clone();

    let tasks = (0..TASKS).map(|task| {
        let server = server.clone();
        let counter_ref = counter_ref.clone();
        tokio::spawn(async move {
            for _ in 0..ROUNDS {
                let mut batch = BatchRequest::new();
                // Every task hits the shared key and one of its own.
                let shared = batch.push(ExternalRequest::modify(&counter_ref, 0, 1));
                let own = batch.push(ExternalRequest::modify(&counter_ref, 100 + task, 1));
                let response = server.request(&batch).await.unwrap();
                assert!(response.get(&shared).unwrap().is_successful());
                assert!(response.get(&own).unwrap().is_successful());
            }
        })
    });
    for result in join_all(tasks).await {
        result.unwrap();
    }

    assert_eq!(counter.value(0), (TASKS * ROUNDS) as i64);
    for task in 0..TASKS {
        assert_eq!(counter.value(100 + task), ROUNDS as i64);
    }
    assert_eq!(counter.overlapping_writes(), 0);
    assert_eq!(server.lock_manager().held_count(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_readers_through_cache() {
    enable_logger();
    let server = server("concurrent_readers");
    let graph = settings_graph("readers", Some(Duration::from_millis(5)));

    let readers = (0..TASKS).map(|task| {
        let server = server.clone();
        let view = graph.view.clone();
        async move {
            let key = (task % 4).to_string();
            let response = server
                .request_one(ExternalRequest::read(&view, key))
                .await
                .unwrap();
            (task % 4, response.into_value())
        }
    });
    for (key, value) in join_all(readers).await {
        assert_eq!(value, Some(key as i64 * 10));
    }

    // At most one store read per key, however the batches interleaved.
    assert!(graph.store.stats().reads() <= 4);
}
