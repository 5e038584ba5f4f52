use std::time::Duration;

use autoproperty::metrics_text;
use autoproperty::BatchRequest;
use autoproperty::ExternalRequest;
use autoproperty::SimplePropertyOperator;

use crate::common::enable_logger;
use crate::common::server;
use crate::common::settings_graph;

#[tokio::test]
async fn test_converter_over_cache_over_store() {
    enable_logger();
    let server = server("graph_basic");
    let graph = settings_graph("basic", None);

    let mut batch = BatchRequest::new();
    let three = batch.push(ExternalRequest::read(&graph.view, "3".to_string()));
    let missing = batch.push(ExternalRequest::read(&graph.view, "42".to_string()));
    let invalid = batch.push(ExternalRequest::read(&graph.view, "three".to_string()));
    let response = server.request(&batch).await.unwrap();

    assert_eq!(response.get(&three).unwrap().value(), Some(&30));
    assert!(response.get(&missing).unwrap().is_successful());
    assert_eq!(response.get(&missing).unwrap().value(), None);
    assert!(!response.get(&invalid).unwrap().is_successful());

    // Served from the cache this time.
    let again = server
        .request_one(ExternalRequest::read(&graph.view, "3".to_string()))
        .await
        .unwrap();
    assert_eq!(again.value(), Some(&30));
    assert_eq!(graph.store.stats().reads(), 2);
}

#[tokio::test]
async fn test_writes_invalidate_every_layer() {
    enable_logger();
    let server = server("graph_write");
    let graph = settings_graph("write", Some(Duration::from_millis(5)));
    let operator = SimplePropertyOperator::new(server.clone(), graph.view.clone()).unwrap();

    assert_eq!(operator.read("1".to_string()).await.unwrap(), Some(10));
    assert!(operator.write("1".to_string(), 11, None).await.unwrap());
    assert_eq!(graph.store.get(&1), Some("11".to_string()));
    assert_eq!(operator.read("1".to_string()).await.unwrap(), Some(11));

    // An edit behind the server's back shows up once the source is bumped.
    graph.store.store().insert(1, "12".to_string());
    assert_eq!(operator.read("1".to_string()).await.unwrap(), Some(11));
    server.increment_version(&graph.store_ref, 1).unwrap();
    assert_eq!(operator.read("1".to_string()).await.unwrap(), Some(12));

    server.shutdown().await.unwrap();
    assert!(metrics_text().contains("batches_submitted"));
}

#[tokio::test]
async fn test_cache_is_shared_between_views() {
    let server = server("graph_shared");
    let graph = settings_graph("shared", None);

    let raw = server
        .request_one(ExternalRequest::read(&graph.cache, 5))
        .await
        .unwrap();
    assert_eq!(raw.value(), Some(&"50".to_string()));
    let typed = server
        .request_one(ExternalRequest::read(&graph.view, "5".to_string()))
        .await
        .unwrap();
    assert_eq!(typed.value(), Some(&50));
    assert_eq!(graph.store.stats().reads(), 1);
}
