use tracing::warn;

use crate::LockResource;
use crate::LockType;
use crate::ProcessCallback;
use crate::Property;
use crate::PropertyContext;
use crate::PropertyRef;
use crate::PropertyValue;
use crate::RequestKey;
use crate::RequestType;
use crate::Response;

/// Sends reads to one property and modifies to another.
pub struct SplitProperty<K: RequestKey, V: PropertyValue> {
    name: String,
    read_source: PropertyRef<K, V>,
    modify_source: PropertyRef<K, V>,
}

impl<K: RequestKey, V: PropertyValue> SplitProperty<K, V> {
    pub fn new(
        name: impl Into<String>,
        read_source: PropertyRef<K, V>,
        modify_source: PropertyRef<K, V>,
    ) -> Self {
        Self {
            name: name.into(),
            read_source,
            modify_source,
        }
    }
}

impl<K: RequestKey, V: PropertyValue> Property for SplitProperty<K, V> {
    type Key = K;
    type Value = V;
    type Model = ();

    fn create_model(&self) {}

    fn lock_resource(
        &self,
        key: &K,
        lock_type: LockType,
    ) -> LockResource {
        match lock_type {
            LockType::Write => self.modify_source.lock_resource(key, lock_type),
            LockType::Read | LockType::None => self.read_source.lock_resource(key, lock_type),
        }
    }

    fn rearrange_requests(
        &self,
        ctx: &mut PropertyContext<'_, Self>,
    ) {
        for request in ctx.new_requests().to_vec() {
            let target = match request.request_type() {
                RequestType::Read => &self.read_source,
                RequestType::Modify => &self.modify_source,
            };
            if let Err(e) = ctx.redirect(request.id(), target) {
                warn!("{}: redirect of {} failed: {}", self.name, request.id(), e);
                let _ = ctx.respond(request.id(), Response::failed());
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
        &self.name
    }
}
