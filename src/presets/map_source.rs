use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::runtime::Handle;
use tracing::trace;

use crate::utils::async_task::spawn_task;
use crate::LockResource;
use crate::LockType;
use crate::ProcessCallback;
use crate::Property;
use crate::PropertyContext;
use crate::PropertyValue;
use crate::RequestId;
use crate::RequestKey;
use crate::RequestType;

/// Counters of requests a [`MapSourceProperty`] served.
#[derive(Debug, Default)]
pub struct MapSourceStats {
    reads: AtomicU64,
    writes: AtomicU64,
    process_calls: AtomicU64,
}

impl MapSourceStats {
    pub fn reads(&self) -> u64 {
        self.reads.load(Ordering::Acquire)
    }

    pub fn writes(&self) -> u64 {
        self.writes.load(Ordering::Acquire)
    }

    pub fn process_calls(&self) -> u64 {
        self.process_calls.load(Ordering::Acquire)
    }
}

/// In-memory source backed by a concurrent map.
///
/// The map outlives property resets and can be edited from outside the
/// server to simulate external changes; pair such edits with
/// `PropertyServer::increment_version`.
pub struct MapSourceProperty<K: RequestKey, V: PropertyValue> {
    name: String,
    store: Arc<DashMap<K, V>>,
    latency: Option<Duration>,
    stats: Arc<MapSourceStats>,
}

impl<K: RequestKey, V: PropertyValue> MapSourceProperty<K, V> {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            store: Arc::new(DashMap::new()),
            latency: None,
            stats: Arc::new(MapSourceStats::default()),
        }
    }

    pub fn with_values<I>(
        name: impl Into<String>,
        values: I,
    ) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
    {
        let source = Self::new(name);
        for (key, value) in values {
            source.store.insert(key, value);
        }
        source
    }

    /// Serves requests from a spawned task after `latency`.
    pub fn with_latency(
        mut self,
        latency: Duration,
    ) -> Self {
        self.latency = Some(latency);
        self
    }

    pub fn store(&self) -> &Arc<DashMap<K, V>> {
        &self.store
    }

    pub fn stats(&self) -> &Arc<MapSourceStats> {
        &self.stats
    }

    pub fn get(
        &self,
        key: &K,
    ) -> Option<V> {
        self.store.get(key).map(|entry| entry.value().clone())
    }

    fn serve(
        ctx: &mut PropertyContext<'_, Self>,
        id: RequestId,
    ) {
        let Some(request) = ctx.ongoing_request(id).cloned() else {
            trace!("{}: {} was answered elsewhere", ctx.property().name, id);
            return;
        };
        let property = ctx.property().clone();
        let key = request.key();
        let value = match request.request_type() {
            RequestType::Read => {
                property.stats.reads.fetch_add(1, Ordering::AcqRel);
                property.get(key)
            }
            RequestType::Modify => {
                property.stats.writes.fetch_add(1, Ordering::AcqRel);
                match request.value() {
                    Some(value) => {
                        property.store.insert(key.clone(), value.clone());
                    }
                    None => {
                        property.store.remove(key);
                    }
                }
                request.value().cloned()
            }
        };
        let response = ctx.tracked_response(key, value);
        let _ = ctx.respond(id, response);
    }
}

impl<K: RequestKey, V: PropertyValue> Property for MapSourceProperty<K, V> {
    type Key = K;
    type Value = V;
    type Model = ();

    fn create_model(&self) {}

    fn lock_resource(
        &self,
        key: &K,
        lock_type: LockType,
    ) -> LockResource {
        LockResource::path([self.name.clone(), key.key_string().into_owned()], lock_type)
    }

    fn rearrange_requests(
        &self,
        _ctx: &mut PropertyContext<'_, Self>,
    ) {
    }

    fn process_requests(
        &self,
        ctx: &mut PropertyContext<'_, Self>,
        callback: ProcessCallback<Self>,
    ) {
        self.stats.process_calls.fetch_add(1, Ordering::AcqRel);
        let ids: Vec<RequestId> = ctx.ongoing_requests().iter().map(|request| request.id()).collect();

        let Some(latency) = self.latency else {
            for id in ids {
                Self::serve(ctx, id);
            }
            let _ = callback.complete();
            return;
        };

        let task_name = format!("{}-delayed-response", self.name);
        spawn_task(&Handle::current(), &task_name, move || async move {
            tokio::time::sleep(latency).await;
            callback.post_on_server_thread(true, move |ctx| {
                for id in ids {
                    Self::serve(ctx, id);
                }
            })
        });
    }

    fn name(&self) -> &str {
        &self.name
    }
}
