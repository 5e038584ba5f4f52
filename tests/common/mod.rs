use std::collections::HashMap;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use autoproperty::BrokerConfig;
use autoproperty::ConvertError;
use autoproperty::ConverterProperty;
use autoproperty::LockResource;
use autoproperty::LockType;
use autoproperty::MapSourceProperty;
use autoproperty::MemoryCacheProperty;
use autoproperty::ProcessCallback;
use autoproperty::Property;
use autoproperty::PropertyContext;
use autoproperty::PropertyRef;
use autoproperty::PropertyServer;
use autoproperty::RequestId;
use autoproperty::RequestType;
use autoproperty::Response;
use parking_lot::Mutex;

static LOGGER_INIT: once_cell::sync::Lazy<()> = once_cell::sync::Lazy::new(|| {
    let _ = env_logger::builder().is_test(true).try_init();
});

pub fn enable_logger() {
    *LOGGER_INIT;
    println!("setup logger for integration test.");
}

pub fn server(name: &str) -> PropertyServer {
    PropertyServer::new(BrokerConfig::named(name)).expect("server should start")
}

/// `"<n>"` -> number view over a cached `u32 -> text` store.
pub struct SettingsGraph {
    pub store: Arc<MapSourceProperty<u32, String>>,
    pub store_ref: PropertyRef<u32, String>,
    pub cache: PropertyRef<u32, String>,
    pub view: PropertyRef<String, i64>,
}

pub fn settings_graph(
    name: &str,
    latency: Option<Duration>,
) -> SettingsGraph {
    let mut store = MapSourceProperty::with_values(
        format!("{}-store", name),
        (0u32..8).map(|key| (key, (key * 10).to_string())),
    );
    if let Some(latency) = latency {
        store = store.with_latency(latency);
    }
    let store = Arc::new(store);
    let store_ref: PropertyRef<u32, String> = store.clone();
    let cache: PropertyRef<u32, String> = Arc::new(MemoryCacheProperty::new(format!("{}-cache", name), store_ref.clone()));
    let view: PropertyRef<String, i64> = Arc::new(ConverterProperty::new(
        format!("{}-view", name),
        cache.clone(),
        |key: &String| key.parse::<u32>().map_err(|e| ConvertError::Key(e.to_string())),
        |value: Option<&i64>| Ok(value.map(|v| v.to_string())),
        |response: Response<String>| {
            let parsed = response.value().map(|text| text.parse::<i64>()).transpose();
            match parsed {
                Ok(value) => Ok(response.with_value(value)),
                Err(e) => Err(ConvertError::Value(e.to_string())),
            }
        },
    ));
    SettingsGraph {
        store,
        store_ref,
        cache,
        view,
    }
}

/// Counter store whose modify adds to the current value.
///
/// Work is finished on a spawned task. Every process invocation checks that
/// no key has two modifies in flight at once.
pub struct CounterProperty {
    name: String,
    latency: Duration,
    values: Mutex<HashMap<u64, i64>>,
    overlapping_writes: AtomicUsize,
}

impl CounterProperty {
    pub fn new(
        name: &str,
        latency: Duration,
    ) -> Self {
        Self {
            name: name.to_string(),
            latency,
            values: Mutex::new(HashMap::new()),
            overlapping_writes: AtomicUsize::new(0),
        }
    }

    pub fn value(
        &self,
        key: u64,
    ) -> i64 {
        self.values.lock().get(&key).copied().unwrap_or_default()
    }

    pub fn overlapping_writes(&self) -> usize {
        self.overlapping_writes.load(Ordering::SeqCst)
    }

    fn serve(
        ctx: &mut PropertyContext<'_, Self>,
        ids: Vec<RequestId>,
    ) {
        for id in ids {
            let Some(request) = ctx.ongoing_request(id).cloned() else {
                continue;
            };
            let value = {
                let mut values = ctx.property().values.lock();
                let current = values.entry(*request.key()).or_default();
                if request.request_type() == RequestType::Modify {
                    *current += request.value().copied().unwrap_or_default();
                }
                *current
            };
            let response = ctx.tracked_response(request.key(), Some(value));
            let _ = ctx.respond(id, response);
        }
    }
}

impl Property for CounterProperty {
    type Key = u64;
    type Value = i64;
    type Model = ();

    fn create_model(&self) -> Self::Model {}

    fn lock_resource(
        &self,
        key: &u64,
        lock_type: LockType,
    ) -> LockResource {
        LockResource::path([self.name.clone(), key.to_string()], lock_type)
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
        let requests = ctx.ongoing_requests();
        let mut writes: HashMap<u64, usize> = HashMap::new();
        for request in &requests {
            if request.request_type() == RequestType::Modify {
                *writes.entry(*request.key()).or_default() += 1;
            }
        }
        if writes.values().any(|count| *count > 1) {
            self.overlapping_writes.fetch_add(1, Ordering::SeqCst);
        }

        let ids: Vec<RequestId> = requests.iter().map(|request| request.id()).collect();
        let latency = self.latency;
        tokio::spawn(async move {
            tokio::time::sleep(latency).await;
            let _ = callback.post_on_server_thread(true, move |ctx| Self::serve(ctx, ids));
        });
    }

    fn name(&self) -> &str {
        &self.name
    }
}
