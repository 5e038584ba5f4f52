use std::collections::HashMap;
use std::collections::HashSet;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::runtime::Handle;

use crate::utils::async_task::spawn_task;
use crate::LockResource;
use crate::LockType;
use crate::ProcessCallback;
use crate::Property;
use crate::PropertyContext;
use crate::PropertyRef;
use crate::PropertyValue;
use crate::RequestId;
use crate::RequestKey;
use crate::Response;
use crate::SealedRequest;

pub type ServerFn<K, V> = Arc<dyn Fn(&SealedRequest<K, V>) -> Response<V> + Send + Sync>;

/// When and how a [`TestProperty`] answers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Behavior {
    /// Answer while rearranging.
    Rearrange,
    /// Answer inside `process_requests`.
    Process,
    /// Answer from a spawned task after the delay.
    Spawned(Duration),
    /// Complete the process callback without answering.
    Hang,
    /// Forward the first request of each key to the forward target and
    /// answer with its response; park later requests of that key.
    Forward,
}

#[derive(Debug, Default)]
pub struct TestCounters {
    pub received: AtomicUsize,
    pub rearrange_calls: AtomicUsize,
    pub process_calls: AtomicUsize,
}

impl TestCounters {
    pub fn received(&self) -> usize {
        self.received.load(Ordering::SeqCst)
    }

    pub fn process_calls(&self) -> usize {
        self.process_calls.load(Ordering::SeqCst)
    }
}

pub struct TestModel<K> {
    forwarded_keys: HashSet<K>,
    /// Forwarded id -> origin id.
    forwarded: HashMap<RequestId, RequestId>,
}

/// Scriptable property for driving the server in tests.
pub struct TestProperty<K: RequestKey, V: PropertyValue> {
    name: String,
    behavior: Behavior,
    server_fn: ServerFn<K, V>,
    forward_target: Mutex<Option<PropertyRef<K, V>>>,
    counters: Arc<TestCounters>,
}

impl<K: RequestKey, V: PropertyValue> TestProperty<K, V> {
    /// Echoes the request value, answering in the process phase.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            behavior: Behavior::Process,
            server_fn: Arc::new(|request: &SealedRequest<K, V>| Response::successful(request.value().cloned())),
            forward_target: Mutex::new(None),
            counters: Arc::new(TestCounters::default()),
        }
    }

    pub fn with_behavior(
        mut self,
        behavior: Behavior,
    ) -> Self {
        self.behavior = behavior;
        self
    }

    pub fn with_server<F>(
        mut self,
        server_fn: F,
    ) -> Self
    where
        F: Fn(&SealedRequest<K, V>) -> Response<V> + Send + Sync + 'static,
    {
        self.server_fn = Arc::new(server_fn);
        self
    }

    pub fn set_forward_target(
        &self,
        target: PropertyRef<K, V>,
    ) {
        *self.forward_target.lock() = Some(target);
    }

    pub fn counters(&self) -> &Arc<TestCounters> {
        &self.counters
    }

    fn answer(
        ctx: &mut PropertyContext<'_, Self>,
        ids: &[RequestId],
    ) {
        let server_fn = ctx.property().server_fn.clone();
        for id in ids {
            if let Some(request) = ctx.ongoing_request(*id).cloned() {
                let _ = ctx.respond(*id, server_fn(&request));
            }
        }
    }

    fn on_forward_response(
        ctx: &mut PropertyContext<'_, Self>,
        id: RequestId,
        response: Response<V>,
    ) {
        let Some(origin) = ctx.model_mut().forwarded.remove(&id) else {
            return;
        };
        if ctx.ongoing_request(origin).is_some() {
            let _ = ctx.respond(origin, response);
        }
    }
}

impl<K: RequestKey, V: PropertyValue> Property for TestProperty<K, V> {
    type Key = K;
    type Value = V;
    type Model = TestModel<K>;

    fn create_model(&self) -> Self::Model {
        TestModel {
            forwarded_keys: HashSet::new(),
            forwarded: HashMap::new(),
        }
    }

    fn lock_resource(
        &self,
        key: &K,
        lock_type: LockType,
    ) -> LockResource {
        LockResource::path([self.name.clone(), key.key_string().into_owned()], lock_type)
    }

    fn rearrange_requests(
        &self,
        ctx: &mut PropertyContext<'_, Self>,
    ) {
        self.counters.rearrange_calls.fetch_add(1, Ordering::SeqCst);
        let requests = ctx.new_requests().to_vec();
        self.counters.received.fetch_add(requests.len(), Ordering::SeqCst);

        match self.behavior {
            Behavior::Rearrange => {
                let ids: Vec<RequestId> = requests.iter().map(SealedRequest::id).collect();
                Self::answer(ctx, &ids);
            }
            Behavior::Forward => {
                let Some(target) = self.forward_target.lock().clone() else {
                    for request in requests {
                        let _ = ctx.respond(request.id(), Response::failed_with("no forward target"));
                    }
                    return;
                };
                for request in requests {
                    if !ctx.model_mut().forwarded_keys.insert(request.key().clone()) {
                        continue;
                    }
                    match ctx.request(&target, request.content().clone(), Self::on_forward_response) {
                        Ok(forwarded) => {
                            ctx.model_mut().forwarded.insert(forwarded, request.id());
                        }
                        Err(_) => {
                            let _ = ctx.respond(request.id(), Response::failed());
                        }
                    }
                }
            }
            Behavior::Process | Behavior::Spawned(_) | Behavior::Hang => {}
        }
    }

    fn process_requests(
        &self,
        ctx: &mut PropertyContext<'_, Self>,
        callback: ProcessCallback<Self>,
    ) {
        self.counters.process_calls.fetch_add(1, Ordering::SeqCst);
        let ids: Vec<RequestId> = ctx.ongoing_requests().iter().map(SealedRequest::id).collect();
        match self.behavior {
            Behavior::Process => {
                Self::answer(ctx, &ids);
                let _ = callback.complete();
            }
            Behavior::Spawned(delay) => {
                spawn_task(&Handle::current(), &self.name, move || async move {
                    tokio::time::sleep(delay).await;
                    callback.post_on_server_thread(true, move |ctx| Self::answer(ctx, &ids))
                });
            }
            Behavior::Rearrange | Behavior::Hang | Behavior::Forward => {
                let _ = callback.complete();
            }
        }
    }

    fn name(&self) -> &str {
        &self.name
    }
}
