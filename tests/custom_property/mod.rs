use std::collections::HashMap;
use std::sync::Arc;

use autoproperty::ExternalRequest;
use autoproperty::LockResource;
use autoproperty::LockType;
use autoproperty::MapSourceProperty;
use autoproperty::ProcessCallback;
use autoproperty::Property;
use autoproperty::PropertyContext;
use autoproperty::PropertyRef;
use autoproperty::RequestId;
use autoproperty::RequestType;
use autoproperty::Response;

use crate::common::enable_logger;
use crate::common::server;

/// Answers reads of missing keys with a default value.
struct WithDefault {
    source: PropertyRef<u64, String>,
    default: String,
}

impl Property for WithDefault {
    type Key = u64;
    type Value = String;
    /// Source request id -> caller request id.
    type Model = HashMap<RequestId, RequestId>;

    fn create_model(&self) -> Self::Model {
        HashMap::new()
    }

    fn lock_resource(
        &self,
        key: &u64,
        lock_type: LockType,
    ) -> LockResource {
        self.source.lock_resource(key, lock_type)
    }

    fn rearrange_requests(
        &self,
        ctx: &mut PropertyContext<'_, Self>,
    ) {
        for request in ctx.new_requests().to_vec() {
            let sent = ctx.request(&self.source, request.content().clone(), |ctx, id, response| {
                let Some(origin) = ctx.model_mut().remove(&id) else {
                    return;
                };
                let is_read = ctx
                    .ongoing_request(origin)
                    .is_some_and(|request| request.request_type() == RequestType::Read);
                let response = if is_read && response.is_successful() && response.value().is_none() {
                    let default = ctx.property().default.clone();
                    response.with_value(Some(default))
                } else {
                    response
                };
                let _ = ctx.respond(origin, response);
            });
            match sent {
                Ok(source_id) => {
                    ctx.model_mut().insert(source_id, request.id());
                }
                Err(_) => {
                    let _ = ctx.respond(request.id(), Response::failed());
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
        "with-default"
    }
}

#[tokio::test]
async fn test_property_defined_outside_the_crate() {
    enable_logger();
    let server = server("custom_property");
    let store = Arc::new(MapSourceProperty::with_values("custom-store", [(1u64, "set".to_string())]));
    let property: PropertyRef<u64, String> = Arc::new(WithDefault {
        source: store.clone(),
        default: "unset".to_string(),
    });

    let set = server.request_one(ExternalRequest::read(&property, 1)).await.unwrap();
    assert_eq!(set.value(), Some(&"set".to_string()));

    let unset = server.request_one(ExternalRequest::read(&property, 2)).await.unwrap();
    assert_eq!(unset.value(), Some(&"unset".to_string()));

    let written = server
        .request_one(ExternalRequest::modify(&property, 2, "now set".to_string()))
        .await
        .unwrap();
    assert!(written.is_successful());
    assert_eq!(store.get(&2), Some("now set".to_string()));
    assert_eq!(property.property_name(), "with-default");
}
