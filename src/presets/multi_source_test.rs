use std::collections::HashMap;
use std::sync::Arc;

use super::*;
use crate::test_utils::as_ref;
use crate::test_utils::enable_logger;
use crate::test_utils::read_value;
use crate::test_utils::test_server;
use crate::test_utils::TestProperty;
use crate::BatchRequest;
use crate::ExternalRequest;
use crate::KvProperty;
use crate::LockResource;
use crate::LockType;
use crate::ProcessCallback;
use crate::Property;
use crate::PropertyContext;
use crate::PropertyRef;
use crate::RequestId;
use crate::RequestType;
use crate::Response;
use crate::SealedRequest;

type Layer = TestProperty<u64, String>;

/// Fails every read, accepts every modify.
fn write_only(name: &str) -> Arc<Layer> {
    Arc::new(
        TestProperty::new(name).with_server(|request: &SealedRequest<u64, String>| match request.request_type() {
            RequestType::Read => Response::failed_with("miss"),
            RequestType::Modify => Response::successful(request.value().cloned()),
        }),
    )
}

/// Sends every request twice to `target` within one rearrange and answers
/// with whichever copy comes back first.
struct Doubler {
    target: PropertyRef<u64, String>,
}

impl Property for Doubler {
    type Key = u64;
    type Value = String;
    /// Forwarded id -> origin id.
    type Model = HashMap<RequestId, RequestId>;

    fn create_model(&self) -> Self::Model {
        HashMap::new()
    }

    fn lock_resource(
        &self,
        key: &u64,
        lock_type: LockType,
    ) -> LockResource {
        LockResource::path(["doubler".to_string(), key.to_string()], lock_type)
    }

    fn rearrange_requests(
        &self,
        ctx: &mut PropertyContext<'_, Self>,
    ) {
        for request in ctx.new_requests().to_vec() {
            for _ in 0..2 {
                let sent = ctx.request(&self.target, request.content().clone(), |ctx, id, response| {
                    let Some(origin) = ctx.model_mut().remove(&id) else {
                        return;
                    };
                    if ctx.ongoing_request(origin).is_some() {
                        let _ = ctx.respond(origin, response);
                    }
                });
                if let Ok(id) = sent {
                    ctx.model_mut().insert(id, request.id());
                }
            }
        }
    }

    fn process_requests(
        &self,
        _ctx: &mut PropertyContext<'_, Self>,
        callback: ProcessCallback<Self>,
    ) {
        let _ = callback.complete();
    }

    fn name(&self) -> &str {
        "doubler"
    }
}

#[tokio::test]
async fn test_read_falls_through_and_back_fills() {
    enable_logger();
    let server = test_server("multi_fall_through");
    let near = write_only("near");
    let middle = write_only("middle");
    let far = Arc::new(MapSourceProperty::with_values("far", [(1u64, "deep".to_string())]));
    let multi: PropertyRef<u64, String> = Arc::new(MultiSourceProperty::new(
        "layers",
        vec![as_ref(&near), as_ref(&middle), as_ref(&far)],
    ));

    assert_eq!(read_value(&server, &multi, 1).await, Some("deep".to_string()));
    assert_eq!(far.stats().reads(), 1);
    // One failed read plus one back-fill each.
    assert_eq!(near.counters().received(), 2);
    assert_eq!(middle.counters().received(), 2);
}

#[tokio::test]
async fn test_missing_value_is_not_back_filled() {
    let server = test_server("multi_no_backfill");
    let near = write_only("near-empty");
    let far: Arc<MapSourceProperty<u64, String>> = Arc::new(MapSourceProperty::new("far-empty"));
    let multi: PropertyRef<u64, String> =
        Arc::new(MultiSourceProperty::new("sparse", vec![as_ref(&near), as_ref(&far)]));

    assert_eq!(read_value(&server, &multi, 1).await, None);
    assert_eq!(near.counters().received(), 1);
}

#[tokio::test]
async fn test_read_fails_when_every_source_fails() {
    let server = test_server("multi_exhausted");
    let first = write_only("first-miss");
    let second = write_only("second-miss");
    let multi: PropertyRef<u64, String> =
        Arc::new(MultiSourceProperty::new("exhausted", vec![as_ref(&first), as_ref(&second)]));

    let mut batch = BatchRequest::new();
    let a = batch.push(ExternalRequest::read(&multi, 1));
    let b = batch.push(ExternalRequest::read(&multi, 1));
    let response = server.request(&batch).await.unwrap();

    assert!(!response.get(&a).unwrap().is_successful());
    assert!(!response.get(&b).unwrap().is_successful());
    // The write lock on the first source admits the readers one at a time.
    assert_eq!(first.counters().received(), 2);
    assert_eq!(second.counters().received(), 2);
}

#[tokio::test]
async fn test_reads_of_one_key_share_a_pass_over_the_sources() {
    enable_logger();
    let server = test_server("multi_dedup");
    let first = write_only("dedup-first");
    let second = write_only("dedup-second");
    let multi = Arc::new(MultiSourceProperty::new("dedup", vec![as_ref(&first), as_ref(&second)]));
    let doubler: PropertyRef<u64, String> = Arc::new(Doubler { target: as_ref(&multi) });

    let response = server.request_one(ExternalRequest::read(&doubler, 1)).await.unwrap();
    assert!(!response.is_successful());
    assert_eq!(first.counters().received(), 1);
    assert_eq!(second.counters().received(), 1);

    let in_flight = server
        .inspect_model(&multi, |model: &MultiSourceModel<u64, String>| model.in_flight())
        .await
        .unwrap();
    assert_eq!(in_flight, Some(0));
}

#[tokio::test]
async fn test_modify_reaches_every_source() {
    let server = test_server("multi_write");
    let left = Arc::new(MapSourceProperty::<u64, String>::new("left-store"));
    let right = Arc::new(MapSourceProperty::<u64, String>::new("right-store"));
    let multi: PropertyRef<u64, String> =
        Arc::new(MultiSourceProperty::new("mirrored", vec![as_ref(&left), as_ref(&right)]));

    let response = server
        .request_one(ExternalRequest::modify(&multi, 3, "both".to_string()))
        .await
        .unwrap();
    assert!(response.is_successful());
    assert_eq!(response.value(), None);
    assert_eq!(left.get(&3), Some("both".to_string()));
    assert_eq!(right.get(&3), Some("both".to_string()));
}

#[tokio::test]
async fn test_modify_fails_if_any_source_fails() {
    let server = test_server("multi_write_failure");
    let broken = Arc::new(
        TestProperty::<u64, String>::new("rejecting")
            .with_server(|_request: &SealedRequest<u64, String>| Response::failed_with("rejected")),
    );
    let store = Arc::new(MapSourceProperty::<u64, String>::new("accepting"));
    let multi: PropertyRef<u64, String> =
        Arc::new(MultiSourceProperty::new("partial", vec![as_ref(&broken), as_ref(&store)]));

    let response = server
        .request_one(ExternalRequest::modify(&multi, 1, "x".to_string()))
        .await
        .unwrap();
    assert!(!response.is_successful());
    assert_eq!(response.message(), Some("rejected"));
    assert_eq!(store.get(&1), Some("x".to_string()));
}

#[tokio::test]
async fn test_no_sources_fails() {
    let server = test_server("multi_empty");
    let multi: PropertyRef<u64, String> = Arc::new(MultiSourceProperty::new("nothing", Vec::new()));

    let response = server.request_one(ExternalRequest::read(&multi, 1)).await.unwrap();
    assert!(!response.is_successful());
}

#[tokio::test]
async fn test_composite_tracker_follows_answering_source() {
    enable_logger();
    let server = test_server("multi_tracker");
    let near = write_only("tracked-near");
    let far = Arc::new(MapSourceProperty::with_values("tracked-far", [(1u64, "v1".to_string())]));
    let far_ref = as_ref(&far);
    let multi: PropertyRef<u64, String> =
        Arc::new(MultiSourceProperty::new("tracked", vec![as_ref(&near), far_ref.clone()]));
    let cache: PropertyRef<u64, String> = Arc::new(MemoryCacheProperty::new("tracked-cache", multi));

    assert_eq!(read_value(&server, &cache, 1).await, Some("v1".to_string()));
    assert_eq!(read_value(&server, &cache, 1).await, Some("v1".to_string()));
    assert_eq!(far.stats().reads(), 1);

    far.store().insert(1, "v2".to_string());
    server.increment_version(&far_ref, 1).unwrap();
    assert_eq!(read_value(&server, &cache, 1).await, Some("v2".to_string()));
    assert_eq!(far.stats().reads(), 2);
}

#[test]
fn test_lock_covers_every_source() {
    let near = write_only("lock-near");
    let far = Arc::new(MapSourceProperty::<u64, String>::new("lock-far"));
    let multi = MultiSourceProperty::new("locked", vec![as_ref(&near), as_ref(&far)]);

    let mut expected = LockResource::path(["lock-near", "1"], LockType::Write);
    expected.merge(&LockResource::path(["lock-far", "1"], LockType::Read));
    assert_eq!(KvProperty::lock_resource(&multi, &1, LockType::Read), expected);
    assert_eq!(multi.sources().len(), 2);
}
