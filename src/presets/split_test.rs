use std::sync::Arc;

use super::*;
use crate::test_utils::as_ref;
use crate::test_utils::read_value;
use crate::test_utils::test_server;
use crate::ExternalRequest;
use crate::KvProperty;
use crate::LockType;
use crate::PropertyRef;

type Source = MapSourceProperty<u64, String>;

fn split(name: &str) -> (Arc<Source>, Arc<Source>, PropertyRef<u64, String>) {
    let reads = Arc::new(MapSourceProperty::with_values(
        format!("{}-reads", name),
        [(1u64, "replica".to_string())],
    ));
    let writes = Arc::new(MapSourceProperty::with_values(
        format!("{}-writes", name),
        [(1u64, "primary".to_string())],
    ));
    let split: PropertyRef<u64, String> = Arc::new(SplitProperty::new(name, as_ref(&reads), as_ref(&writes)));
    (reads, writes, split)
}

#[tokio::test]
async fn test_reads_and_modifies_take_different_routes() {
    let server = test_server("split_routes");
    let (reads, writes, split) = split("routes");

    assert_eq!(read_value(&server, &split, 1).await, Some("replica".to_string()));

    let response = server
        .request_one(ExternalRequest::modify(&split, 1, "updated".to_string()))
        .await
        .unwrap();
    assert!(response.is_successful());
    assert_eq!(writes.get(&1), Some("updated".to_string()));
    assert_eq!(reads.get(&1), Some("replica".to_string()));

    assert_eq!(reads.stats().reads(), 1);
    assert_eq!(reads.stats().writes(), 0);
    assert_eq!(writes.stats().reads(), 0);
    assert_eq!(writes.stats().writes(), 1);
    assert_eq!(server.lock_manager().held_count(), 0);
}

#[test]
fn test_lock_follows_route() {
    let (reads, writes, split) = split("locks");

    assert_eq!(
        split.lock_resource(&1, LockType::Write),
        KvProperty::lock_resource(writes.as_ref(), &1, LockType::Write)
    );
    assert_eq!(
        split.lock_resource(&1, LockType::Read),
        KvProperty::lock_resource(reads.as_ref(), &1, LockType::Read)
    );
}
