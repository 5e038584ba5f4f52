use std::collections::HashMap;

use tracing::debug;
use tracing::error;
use tracing::trace;

use crate::LockResource;
use crate::LockType;
use crate::ProcessCallback;
use crate::Property;
use crate::PropertyContext;
use crate::PropertyRef;
use crate::PropertyValue;
use crate::RequestId;
use crate::RequestKey;
use crate::RequestType;
use crate::Response;
use crate::CACHE_LOOKUPS;

/// Read-through, write-through cache over a source of the same types.
///
/// Concurrent reads of one key share a single source read. Cached responses
/// are dropped lazily once their tracker moves on.
pub struct MemoryCacheProperty<K: RequestKey, V: PropertyValue> {
    name: String,
    source: PropertyRef<K, V>,
}

struct CacheEntry<V> {
    response: Option<Response<V>>,
    /// Readers waiting on the in-flight source read, oldest first.
    pending: Vec<RequestId>,
}

impl<V> Default for CacheEntry<V> {
    fn default() -> Self {
        Self {
            response: None,
            pending: Vec::new(),
        }
    }
}

enum SourceRequest<K, V> {
    Read(K),
    Write { origin: RequestId, key: K, value: Option<V> },
}

pub struct MemoryCacheModel<K, V> {
    entries: HashMap<K, CacheEntry<V>>,
    in_flight: HashMap<RequestId, SourceRequest<K, V>>,
}

impl<K: RequestKey, V: PropertyValue> MemoryCacheModel<K, V> {
    /// Whether a fresh response for `key` is cached.
    #[cfg(test)]
    pub(crate) fn is_cached(
        &self,
        key: &K,
    ) -> bool {
        self.entries
            .get(key)
            .and_then(|entry| entry.response.as_ref())
            .is_some_and(|response| !response.is_stale())
    }

    #[cfg(test)]
    pub(crate) fn in_flight(&self) -> usize {
        self.in_flight.len()
    }
}

impl<K: RequestKey, V: PropertyValue> MemoryCacheProperty<K, V> {
    pub fn new(
        name: impl Into<String>,
        source: PropertyRef<K, V>,
    ) -> Self {
        Self {
            name: name.into(),
            source,
        }
    }

    fn on_read_response(
        ctx: &mut PropertyContext<'_, Self>,
        id: RequestId,
        response: Response<V>,
    ) {
        let Some(SourceRequest::Read(key)) = ctx.model_mut().in_flight.remove(&id) else {
            error!("{}: read response {} matches no source read", ctx.property().name, id);
            return;
        };
        let entry = ctx.model_mut().entries.entry(key.clone()).or_default();
        let waiting = std::mem::take(&mut entry.pending);
        if response.is_successful() {
            entry.response = Some(response.clone());
            ctx.notify_observers(&key, response.value());
        } else {
            debug!(
                "{}: source read of {:?} failed, failing {} readers",
                ctx.property().name,
                key,
                waiting.len()
            );
        }
        for reader in waiting {
            let _ = ctx.respond(reader, response.clone());
        }
    }

    fn on_write_response(
        ctx: &mut PropertyContext<'_, Self>,
        id: RequestId,
        response: Response<V>,
    ) {
        let Some(SourceRequest::Write { origin, key, value }) = ctx.model_mut().in_flight.remove(&id) else {
            error!("{}: write response {} matches no source write", ctx.property().name, id);
            return;
        };
        let response = if response.is_successful() {
            // The caller sees what it wrote, whatever the source echoed.
            ctx.notify_observers(&key, value.as_ref());
            response.with_value(value)
        } else {
            response.with_value(None)
        };
        let _ = ctx.respond(origin, response);
    }

    fn record_lookup(
        ctx: &PropertyContext<'_, Self>,
        result: &str,
    ) {
        CACHE_LOOKUPS.with_label_values(&[ctx.server_name(), result]).inc();
    }
}

impl<K: RequestKey, V: PropertyValue> Property for MemoryCacheProperty<K, V> {
    type Key = K;
    type Value = V;
    type Model = MemoryCacheModel<K, V>;

    fn create_model(&self) -> Self::Model {
        MemoryCacheModel {
            entries: HashMap::new(),
            in_flight: HashMap::new(),
        }
    }

    fn lock_resource(
        &self,
        key: &K,
        lock_type: LockType,
    ) -> LockResource {
        self.source.lock_resource(key, lock_type)
    }

    fn rearrange_requests(
        &self,
        ctx: &mut PropertyContext<'_, Self>,
    ) {
        for request in ctx.new_requests().to_vec() {
            let key = request.key().clone();
            match request.request_type() {
                RequestType::Read => {
                    let entry = ctx.model_mut().entries.entry(key.clone()).or_default();
                    if entry.response.as_ref().is_some_and(Response::is_stale) {
                        trace!("{}: cached {:?} is stale", self.name, key);
                        entry.response = None;
                    }
                    if let Some(response) = entry.response.clone() {
                        Self::record_lookup(ctx, "hit");
                        let _ = ctx.respond(request.id(), response);
                        continue;
                    }
                    if !entry.pending.is_empty() {
                        entry.pending.push(request.id());
                        Self::record_lookup(ctx, "merged");
                        continue;
                    }
                    Self::record_lookup(ctx, "miss");
                    match ctx.request(&self.source, request.content().clone(), Self::on_read_response) {
                        Ok(source_id) => {
                            let model = ctx.model_mut();
                            model.in_flight.insert(source_id, SourceRequest::Read(key.clone()));
                            model.entries.entry(key).or_default().pending.push(request.id());
                        }
                        Err(_) => {
                            let _ = ctx.respond(request.id(), Response::failed());
                        }
                    }
                }
                RequestType::Modify => {
                    match ctx.request(&self.source, request.content().clone(), Self::on_write_response) {
                        Ok(source_id) => {
                            ctx.model_mut().in_flight.insert(
                                source_id,
                                SourceRequest::Write {
                                    origin: request.id(),
                                    key,
                                    value: request.value().cloned(),
                                },
                            );
                        }
                        Err(_) => {
                            let _ = ctx.respond(request.id(), Response::failed());
                        }
                    }
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
        &self.name
    }
}
