use std::any::Any;
use std::collections::BTreeMap;
use std::marker::PhantomData;
use std::panic;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use tokio::sync::mpsc;
#[cfg(test)]
use tokio::sync::oneshot;
use tracing::error;
use tracing::trace;
use tracing::warn;

use super::node_factory;
use super::ControlEvent;
use super::NodeAction;
use super::ProcessPost;
use super::PropertyHandler;
use super::RequestState;
use super::ResponseSink;
use super::ServerShared;
use crate::constants::MSG_PROPERTY_RESET;
use crate::constants::MSG_RESPONSE_TYPE_MISMATCH;
use crate::LockManager;
use crate::Property;
use crate::PropertyId;
use crate::PropertyRef;
use crate::PropertyValue;
use crate::ProtocolError;
use crate::RequestContent;
use crate::RequestId;
use crate::RequestKey;
use crate::RequestType;
use crate::Response;
use crate::ResponseTrackerManager;
use crate::Result;
use crate::SealedRequest;
use crate::SystemError;
use crate::TrackerConfig;
use crate::PROPERTY_RESETS;

/// Server-side node of one property, with its types erased.
pub(crate) trait PropertyNode: Send {
    fn name(&self) -> &str;

    fn deliver(
        &mut self,
        shared: &mut ServerShared,
        id: RequestId,
        content: Arc<dyn Any + Send + Sync>,
    );

    fn rearrange(
        &mut self,
        shared: &mut ServerShared,
    );

    fn process(
        &mut self,
        shared: &mut ServerShared,
        callback: CallbackHandle,
    );

    fn handle_response(
        &mut self,
        shared: &mut ServerShared,
        handler: PropertyHandler,
        id: RequestId,
        response: Box<dyn Any + Send>,
    );

    fn run_action(
        &mut self,
        shared: &mut ServerShared,
        action: NodeAction,
    );

    /// Fails `id` if it is ongoing here. Returns whether it was.
    fn cancel_request(
        &mut self,
        shared: &mut ServerShared,
        id: RequestId,
    ) -> bool;

    fn has_ongoing_requests(&self) -> bool;

    fn increment_version(
        &mut self,
        key: Box<dyn Any + Send>,
    );
}

#[doc(hidden)]
pub struct PropertyNodeBox(pub(crate) Box<dyn PropertyNode>);

pub(crate) struct PropertyState<P: Property> {
    id: PropertyId,
    property: Arc<P>,
    model: P::Model,
    /// Delivered and not yet answered or redirected, by arrival order.
    ongoing: BTreeMap<RequestId, SealedRequest<P::Key, P::Value>>,
    /// Delivered since the last rearrange.
    new_requests: Vec<SealedRequest<P::Key, P::Value>>,
    trackers: ResponseTrackerManager<P::Key>,
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

impl<P: Property> PropertyState<P> {
    pub(crate) fn new(
        property: Arc<P>,
        config: &TrackerConfig,
    ) -> Self {
        Self {
            id: PropertyId::of(property.as_ref()),
            model: property.create_model(),
            property,
            ongoing: BTreeMap::new(),
            new_requests: Vec::new(),
            trackers: ResponseTrackerManager::new(config),
        }
    }

    /// Runs property code; a panic resets the property.
    fn guarded<F>(
        &mut self,
        shared: &mut ServerShared,
        stage: &'static str,
        f: F,
    ) -> bool
    where
        F: FnOnce(&mut Self, &mut ServerShared),
    {
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| f(self, shared)));
        match outcome {
            Ok(()) => true,
            Err(payload) => {
                if shared.take_strict_violation() {
                    panic::resume_unwind(payload);
                }
                error!(
                    "[{}] property {} panicked in {}: {}",
                    shared.name,
                    self.property.name(),
                    stage,
                    panic_message(&*payload)
                );
                self.reset(shared);
                false
            }
        }
    }

    /// Fails everything in flight and rebuilds the model.
    fn reset(
        &mut self,
        shared: &mut ServerShared,
    ) {
        PROPERTY_RESETS
            .with_label_values(&[shared.name.as_str(), self.property.name()])
            .inc();
        let ids: Vec<RequestId> = self.ongoing.keys().copied().collect();
        warn!(
            "[{}] resetting property {}, failing {} ongoing requests",
            shared.name,
            self.property.name(),
            ids.len()
        );
        for id in ids {
            let _ = PropertyContext::new(self, shared).respond(id, Response::failed_with(MSG_PROPERTY_RESET));
        }
        self.new_requests.clear();
        self.model = self.property.create_model();
    }
}

impl<P: Property> PropertyNode for PropertyState<P> {
    fn name(&self) -> &str {
        self.property.name()
    }

    fn deliver(
        &mut self,
        shared: &mut ServerShared,
        id: RequestId,
        content: Arc<dyn Any + Send + Sync>,
    ) {
        match content.downcast::<RequestContent<P::Key, P::Value>>() {
            Ok(content) => {
                let request = SealedRequest::new(id, content);
                self.ongoing.insert(id, request.clone());
                self.new_requests.push(request);
                shared.requests.set_state(id, RequestState::Forwarded);
            }
            Err(_) => {
                let _ = shared.violation::<()>(ProtocolError::TypeMismatch("request content"));
            }
        }
    }

    fn rearrange(
        &mut self,
        shared: &mut ServerShared,
    ) {
        self.guarded(shared, "rearrange", |state, shared| {
            let property = state.property.clone();
            let mut ctx = PropertyContext::new(state, shared);
            property.rearrange_requests(&mut ctx);
        });
        self.new_requests.clear();
    }

    fn process(
        &mut self,
        shared: &mut ServerShared,
        callback: CallbackHandle,
    ) {
        let typed = ProcessCallback::<P>::new(callback.clone());
        let invoked = self.guarded(shared, "process", |state, shared| {
            let property = state.property.clone();
            let mut ctx = PropertyContext::new(state, shared);
            property.process_requests(&mut ctx, typed);
        });
        if !invoked {
            callback.complete_after_failure();
        }
    }

    fn handle_response(
        &mut self,
        shared: &mut ServerShared,
        handler: PropertyHandler,
        id: RequestId,
        response: Box<dyn Any + Send>,
    ) {
        self.guarded(shared, "response handler", |state, shared| {
            handler(state, shared, id, response);
        });
    }

    fn run_action(
        &mut self,
        shared: &mut ServerShared,
        action: NodeAction,
    ) {
        self.guarded(shared, "process action", |state, shared| {
            action(state, shared);
        });
    }

    fn cancel_request(
        &mut self,
        shared: &mut ServerShared,
        id: RequestId,
    ) -> bool {
        if !self.ongoing.contains_key(&id) {
            return false;
        }
        PropertyContext::new(self, shared).cancel_request(id).is_ok()
    }

    fn has_ongoing_requests(&self) -> bool {
        !self.ongoing.is_empty()
    }

    fn increment_version(
        &mut self,
        key: Box<dyn Any + Send>,
    ) {
        match key.downcast::<P::Key>() {
            Ok(key) => self.trackers.increment_version(&key),
            Err(_) => error!("increment_version on {}: key type mismatch", self.property.name()),
        }
    }
}

/// Everything a property may do while the server runs its code.
pub struct PropertyContext<'a, P: Property> {
    state: &'a mut PropertyState<P>,
    shared: &'a mut ServerShared,
}

impl<'a, P: Property> PropertyContext<'a, P> {
    pub(crate) fn new(
        state: &'a mut PropertyState<P>,
        shared: &'a mut ServerShared,
    ) -> Self {
        Self { state, shared }
    }

    pub fn property(&self) -> &Arc<P> {
        &self.state.property
    }

    pub fn property_id(&self) -> PropertyId {
        self.state.id
    }

    pub fn server_name(&self) -> &str {
        &self.shared.name
    }

    pub fn model(&self) -> &P::Model {
        &self.state.model
    }

    pub fn model_mut(&mut self) -> &mut P::Model {
        &mut self.state.model
    }

    /// Requests delivered since the last rearrange, oldest first.
    pub fn new_requests(&self) -> &[SealedRequest<P::Key, P::Value>] {
        &self.state.new_requests
    }

    pub fn ongoing_request(
        &self,
        id: RequestId,
    ) -> Option<&SealedRequest<P::Key, P::Value>> {
        self.state.ongoing.get(&id)
    }

    /// Every unanswered incoming request, oldest first.
    pub fn ongoing_requests(&self) -> Vec<SealedRequest<P::Key, P::Value>> {
        self.state.ongoing.values().cloned().collect()
    }

    pub fn lock_manager(&self) -> &LockManager {
        &self.shared.lock_manager
    }

    /// Sends a request to `target`. `handler` runs on the server task with
    /// this property's context once `target` answers.
    pub fn request<K, V, F>(
        &mut self,
        target: &PropertyRef<K, V>,
        content: RequestContent<K, V>,
        handler: F,
    ) -> Result<RequestId>
    where
        K: RequestKey,
        V: PropertyValue,
        F: for<'c> FnOnce(&mut PropertyContext<'c, P>, RequestId, Response<V>) + Send + 'static,
    {
        let sink = ResponseSink::Property(Box::new(
            move |state: &mut dyn Any, shared: &mut ServerShared, id: RequestId, response: Box<dyn Any + Send>| {
                let Some(state) = state.downcast_mut::<PropertyState<P>>() else {
                    let _ = shared.violation::<()>(ProtocolError::TypeMismatch("property state"));
                    return;
                };
                let response = match response.downcast::<Response<V>>() {
                    Ok(response) => *response,
                    Err(_) => Response::failed_with(MSG_RESPONSE_TYPE_MISMATCH),
                };
                let mut ctx = PropertyContext::new(state, shared);
                handler(&mut ctx, id, response);
            },
        ));
        self.shared.handle_request(
            self.state.id,
            target.property_id(),
            Arc::new(content),
            node_factory(target),
            sink,
        )
    }

    /// Answers an ongoing request. Each request is answered exactly once.
    pub fn respond(
        &mut self,
        id: RequestId,
        response: Response<P::Value>,
    ) -> Result<()> {
        let Some(request) = self.state.ongoing.remove(&id) else {
            return self.shared.violation(ProtocolError::NotOngoing {
                request_id: id,
                property: self.state.property.name().to_string(),
            });
        };
        if request.request_type() == RequestType::Modify && request.option().notify && response.is_successful() {
            self.state.trackers.increment_version(request.key());
        }
        trace!("{} responds {} ({:?})", self.state.property.name(), id, response.result());
        self.shared.handle_respond(self.state.id, id, Box::new(response))
    }

    /// Hands an ongoing request over to `target`, which answers the original
    /// sender directly.
    pub fn redirect(
        &mut self,
        id: RequestId,
        target: &PropertyRef<P::Key, P::Value>,
    ) -> Result<()> {
        if !self.state.ongoing.contains_key(&id) {
            return self.shared.violation(ProtocolError::NotOngoing {
                request_id: id,
                property: self.state.property.name().to_string(),
            });
        }
        self.shared
            .handle_redirect(self.state.id, id, target.property_id(), node_factory(target))?;
        self.state.ongoing.remove(&id);
        Ok(())
    }

    pub fn cancel_request(
        &mut self,
        id: RequestId,
    ) -> Result<()> {
        self.respond(id, Response::cancelled())
    }

    pub fn trackers(&mut self) -> &mut ResponseTrackerManager<P::Key> {
        &mut self.state.trackers
    }

    /// Successful response carrying the tracker of `key`.
    pub fn tracked_response(
        &mut self,
        key: &P::Key,
        value: Option<P::Value>,
    ) -> Response<P::Value> {
        let tracker = self.state.trackers.get_or_add_tracker(key);
        Response::successful(value).with_tracker(tracker)
    }

    /// Publishes `value` to every observer registered on this property.
    pub fn notify_observers(
        &self,
        key: &P::Key,
        value: Option<&P::Value>,
    ) {
        for observer in self.shared.observers::<P::Key, P::Value>(self.state.id) {
            observer.update_value(key, value.cloned());
        }
    }
}

/// Shared completion state of one process invocation.
#[derive(Clone)]
pub(crate) struct CallbackHandle {
    property: PropertyId,
    callback_id: u64,
    completed: Arc<AtomicBool>,
    control_tx: mpsc::UnboundedSender<ControlEvent>,
}

impl CallbackHandle {
    pub(crate) fn new(
        property: PropertyId,
        callback_id: u64,
        control_tx: mpsc::UnboundedSender<ControlEvent>,
    ) -> Self {
        Self {
            property,
            callback_id,
            completed: Arc::new(AtomicBool::new(false)),
            control_tx,
        }
    }

    fn post(
        &self,
        completed: bool,
        action: Option<NodeAction>,
    ) -> Result<()> {
        let already_completed = if completed {
            self.completed.swap(true, Ordering::AcqRel)
        } else {
            self.completed.load(Ordering::Acquire)
        };
        if already_completed {
            error!(
                "process callback {} of {:?} posted after completion",
                self.callback_id, self.property
            );
            return Err(ProtocolError::CallbackCompleted.into());
        }
        self.control_tx
            .send(ControlEvent::Process(ProcessPost {
                property: self.property,
                callback_id: self.callback_id,
                completed,
                action,
            }))
            .map_err(|_| SystemError::ServerStopped.into())
    }

    /// Completes the invocation unless the property already did.
    pub(crate) fn complete_after_failure(&self) {
        if !self.completed.swap(true, Ordering::AcqRel) {
            let _ = self.control_tx.send(ControlEvent::Process(ProcessPost {
                property: self.property,
                callback_id: self.callback_id,
                completed: true,
                action: None,
            }));
        }
    }

    fn is_completed(&self) -> bool {
        self.completed.load(Ordering::Acquire)
    }
}

/// Handle a property uses to finish a process invocation, possibly from
/// another task.
///
/// Post with `completed = false` any number of times, then exactly once with
/// `completed = true`. Later posts are rejected.
pub struct ProcessCallback<P: Property> {
    handle: CallbackHandle,
    _marker: PhantomData<fn() -> P>,
}

impl<P: Property> Clone for ProcessCallback<P> {
    fn clone(&self) -> Self {
        Self {
            handle: self.handle.clone(),
            _marker: PhantomData,
        }
    }
}

impl<P: Property> ProcessCallback<P> {
    pub(crate) fn new(handle: CallbackHandle) -> Self {
        Self {
            handle,
            _marker: PhantomData,
        }
    }

    /// Runs `action` on the server task with the property's context.
    pub fn post_on_server_thread<F>(
        &self,
        completed: bool,
        action: F,
    ) -> Result<()>
    where
        F: for<'c> FnOnce(&mut PropertyContext<'c, P>) + Send + 'static,
    {
        let action: NodeAction = Box::new(move |state: &mut dyn Any, shared: &mut ServerShared| {
            match state.downcast_mut::<PropertyState<P>>() {
                Some(state) => {
                    let mut ctx = PropertyContext::new(state, shared);
                    action(&mut ctx);
                }
                None => {
                    let _ = shared.violation::<()>(ProtocolError::TypeMismatch("property state"));
                }
            }
        });
        self.handle.post(completed, Some(action))
    }

    pub fn complete(&self) -> Result<()> {
        self.handle.post(true, None)
    }

    pub fn is_completed(&self) -> bool {
        self.handle.is_completed()
    }
}

/// Hands the model of `P` to `f` on the server task and sends back the result.
#[cfg(test)]
pub(crate) fn inspect_model_action<P, R, F>(
    f: F,
    reply: oneshot::Sender<R>,
) -> NodeAction
where
    P: Property,
    R: Send + 'static,
    F: FnOnce(&P::Model) -> R + Send + 'static,
{
    Box::new(move |state: &mut dyn Any, _shared: &mut ServerShared| {
        if let Some(state) = state.downcast_mut::<PropertyState<P>>() {
            let _ = reply.send(f(&state.model));
        }
    })
}
