use std::collections::HashMap;
use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tokio::sync::watch;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::trace;
use tracing::warn;

use super::BatchEnvelope;
use super::BatchRequest;
use super::BatchResponse;
use super::BatchSlot;
use super::CallbackHandle;
use super::ControlEvent;
use super::DelayedAction;
use super::ErasedExternalRequest;
#[cfg(test)]
use super::inspect_model_action;
use super::ProcessPost;
use super::PropertyNode;
use super::ResponseSink;
use super::ServerShared;
use crate::constants::MSG_KEY_IS_EMPTY;
use crate::constants::MSG_NULL_MODIFY_VALUE;
use crate::utils::async_task::spawn_task;
use crate::BrokerConfig;
use crate::ExternalRequest;
use crate::ExternalResponse;
use crate::LockManager;
use crate::LockResource;
#[cfg(test)]
use crate::Property;
use crate::PropertyId;
use crate::PropertyRef;
use crate::PropertyValue;
use crate::ProtocolError;
use crate::RequestKey;
use crate::RequestResult;
use crate::RequestType;
use crate::Result;
use crate::SystemError;
use crate::ValueObserver;
use crate::BATCHES_SUBMITTED;
use crate::LOCK_CONTENTION;
use crate::OUTSTANDING_REQUESTS;

/// An external request waiting for its lock.
struct PendingExternal {
    request: Box<dyn ErasedExternalRequest>,
    slot: BatchSlot,
}

/// The single task that owns every property node of a server.
pub(crate) struct ServerCore {
    name: String,
    shared: ServerShared,
    nodes: HashMap<PropertyId, Box<dyn PropertyNode>>,
    pending_external: VecDeque<PendingExternal>,
    /// Property -> id of its active process invocation.
    active_callbacks: HashMap<PropertyId, u64>,
    next_callback_id: u64,
    /// Properties to invoke in the next process phase.
    pending_process: Vec<PropertyId>,

    batch_rx: mpsc::Receiver<BatchEnvelope>,
    control_tx: mpsc::UnboundedSender<ControlEvent>,
    control_rx: mpsc::UnboundedReceiver<ControlEvent>,
    lock_released: Arc<Notify>,
    shutdown_signal: watch::Receiver<()>,
}

impl ServerCore {
    pub(crate) fn new(
        config: &BrokerConfig,
        lock_manager: LockManager,
        batch_rx: mpsc::Receiver<BatchEnvelope>,
        control_tx: mpsc::UnboundedSender<ControlEvent>,
        control_rx: mpsc::UnboundedReceiver<ControlEvent>,
        shutdown_signal: watch::Receiver<()>,
    ) -> Self {
        Self {
            name: config.server.name.clone(),
            lock_released: lock_manager.release_notifier(),
            shared: ServerShared::new(config, lock_manager),
            nodes: HashMap::new(),
            pending_external: VecDeque::new(),
            active_callbacks: HashMap::new(),
            next_callback_id: 0,
            pending_process: Vec::new(),
            batch_rx,
            control_tx,
            control_rx,
            shutdown_signal,
        }
    }

    pub(crate) async fn run(mut self) -> Result<()> {
        info!("[{}] property server started", self.name);
        loop {
            tokio::select! {
                // Use biased to ensure branch order
                biased;
                // P0: shutdown received, or every handle dropped
                _ = self.shutdown_signal.changed() => {
                    warn!("[{}] shutdown signal received.", self.name);
                    self.stop();
                    return Ok(());
                }
                // P1: process callbacks and ordered control events
                Some(event) = self.control_rx.recv() => {
                    trace!("[{}] receive control event: {:?}", self.name, event);
                    self.handle_control_event(event);
                }
                // P2: new batches
                envelope = self.batch_rx.recv() => {
                    match envelope {
                        Some(envelope) => {
                            debug!("[{}] receive batch: {:?}", self.name, envelope);
                            self.handle_batch(envelope);
                        }
                        None => {
                            info!("[{}] all server handles dropped", self.name);
                            self.stop();
                            return Ok(());
                        }
                    }
                }
                // P3: a lock went away, blocked external requests may proceed
                _ = self.lock_released.notified() => {
                    trace!("[{}] lock released", self.name);
                }
            }

            self.run_routine();
            OUTSTANDING_REQUESTS
                .with_label_values(&[self.name.as_str()])
                .set(self.shared.requests.len() as i64);
        }
    }

    fn stop(&mut self) {
        let batches = self.shared.active_batches();
        if batches > 0 || !self.shared.requests.is_empty() {
            warn!(
                "[{}] stopping with {} unfinished batches and {} outstanding requests",
                self.name,
                batches,
                self.shared.requests.len()
            );
        }
        info!("[{}] property server stopped", self.name);
    }

    /// Runs rounds until nothing is left to do.
    pub(crate) fn run_routine(&mut self) {
        loop {
            while let Ok(event) = self.control_rx.try_recv() {
                self.handle_control_event(event);
            }
            self.dispatch_external_requests();

            if self.shared.delayed.is_empty() && !self.has_runnable_process() {
                if self.cancel_stalled_requests() {
                    continue;
                }
                break;
            }

            self.rearrange_requests();
            self.process_requests();
        }
    }

    fn handle_control_event(
        &mut self,
        event: ControlEvent,
    ) {
        match event {
            ControlEvent::Process(post) => self.handle_process_post(post),
            ControlEvent::IncrementVersion { property, key } => match self.nodes.get_mut(&property) {
                Some(node) => node.increment_version(key),
                None => trace!("[{}] no trackers yet for {:?}", self.name, property),
            },
            ControlEvent::RegisterObserver { property, register } => {
                debug!("[{}] register observer on {:?}", self.name, property);
                register(&mut self.shared);
            }
            #[cfg(test)]
            ControlEvent::InspectModel { property, action } => {
                if let Some(node) = self.nodes.get_mut(&property) {
                    node.run_action(&mut self.shared, action);
                }
            }
        }
    }

    fn handle_process_post(
        &mut self,
        post: ProcessPost,
    ) {
        let Some(node) = self.nodes.get_mut(&post.property) else {
            warn!("[{}] process callback for unknown property {:?}", self.name, post.property);
            return;
        };
        if let Some(action) = post.action {
            node.run_action(&mut self.shared, action);
        }
        if !post.completed {
            return;
        }
        if self.active_callbacks.get(&post.property) != Some(&post.callback_id) {
            debug!(
                "[{}] ignore stale completion {} of {}",
                self.name,
                post.callback_id,
                node.name()
            );
            return;
        }
        self.active_callbacks.remove(&post.property);

        for id in self.shared.requests.end_process(post.property) {
            warn!(
                "[{}] {} completed processing without answering {}, cancelling",
                self.name,
                node.name(),
                id
            );
            node.cancel_request(&mut self.shared, id);
        }
    }

    fn handle_batch(
        &mut self,
        envelope: BatchEnvelope,
    ) {
        BATCHES_SUBMITTED.with_label_values(&[self.name.as_str()]).inc();
        let Some(batch) = self.shared.activate_batch(envelope.requests.len(), envelope.completion) else {
            trace!("[{}] empty batch completed", self.name);
            return;
        };

        for (index, request) in envelope.requests.into_iter().enumerate() {
            let slot = BatchSlot {
                batch,
                index,
                request_type: request.request_type(),
            };
            let rejection = if request.key_string().is_empty() {
                Some(MSG_KEY_IS_EMPTY)
            } else if request.request_type() == RequestType::Modify && !request.has_value() {
                Some(MSG_NULL_MODIFY_VALUE)
            } else {
                None
            };
            match rejection {
                Some(message) => {
                    debug!("[{}] reject external request: {}", self.name, message);
                    let response = request.failed_response(message);
                    self.shared.dispatch_external(slot, None, response, RequestResult::Failed);
                }
                None => self.pending_external.push_back(PendingExternal { request, slot }),
            }
        }
    }

    /// Admits waiting external requests in arrival order.
    ///
    /// A request that conflicts with an earlier waiting one stays behind it,
    /// even if its own lock happens to be free.
    fn dispatch_external_requests(&mut self) {
        if self.pending_external.is_empty() {
            return;
        }
        let mut blocked = LockResource::default();
        let mut waiting = VecDeque::new();

        while let Some(pending) = self.pending_external.pop_front() {
            let resource = pending.request.lock_resource();
            if blocked.conflicts(&resource) {
                blocked.merge(&resource);
                waiting.push_back(pending);
                continue;
            }
            let Some(lock) = self.shared.lock_manager.try_acquire_lock(&resource) else {
                LOCK_CONTENTION.with_label_values(&[self.name.as_str()]).inc();
                blocked.merge(&resource);
                waiting.push_back(pending);
                continue;
            };
            if let Err(e) = pending.request.submit(&mut self.shared, lock.clone(), pending.slot) {
                warn!("[{}] external request rejected: {}", self.name, e);
                let response = pending.request.failed_response(&e.to_string());
                self.shared
                    .dispatch_external(pending.slot, Some(lock), response, RequestResult::Failed);
            }
        }
        self.pending_external = waiting;
    }

    fn has_runnable_process(&self) -> bool {
        self.pending_process
            .iter()
            .any(|property| !self.active_callbacks.contains_key(property))
    }

    fn mark_for_process(
        &mut self,
        property: PropertyId,
    ) {
        if !self.pending_process.contains(&property) {
            self.pending_process.push(property);
        }
    }

    /// Drains delayed actions and lets touched properties rearrange, until
    /// no property produces new work.
    fn rearrange_requests(&mut self) {
        while !self.shared.delayed.is_empty() {
            let actions: Vec<DelayedAction> = self.shared.delayed.drain(..).collect();
            let mut rearranging: Vec<PropertyId> = Vec::new();

            for action in actions {
                match action {
                    DelayedAction::Deliver {
                        request_id,
                        receiver,
                        factory,
                    } => {
                        let content = match self.shared.requests.get(request_id) {
                            Some(record) if record.receiver == receiver => record.content.clone(),
                            _ => {
                                trace!("[{}] {} no longer addressed to {:?}", self.name, request_id, receiver);
                                continue;
                            }
                        };
                        let tracker_config = &self.shared.tracker_config;
                        let node = self.nodes.entry(receiver).or_insert_with(|| factory(tracker_config).0);
                        node.deliver(&mut self.shared, request_id, content);
                        if !rearranging.contains(&receiver) {
                            rearranging.push(receiver);
                        }
                    }
                    DelayedAction::Respond {
                        request_id,
                        sender,
                        sink,
                        response,
                    } => match sink {
                        ResponseSink::External(handler) => handler(&mut self.shared, response),
                        ResponseSink::Property(handler) => match self.nodes.get_mut(&sender) {
                            Some(node) => {
                                node.handle_response(&mut self.shared, handler, request_id, response);
                                if !rearranging.contains(&sender) {
                                    rearranging.push(sender);
                                }
                            }
                            None => error!("[{}] response {} for unknown sender {:?}", self.name, request_id, sender),
                        },
                    },
                }
            }

            for property in rearranging {
                if let Some(node) = self.nodes.get_mut(&property) {
                    node.rearrange(&mut self.shared);
                }
                self.mark_for_process(property);
            }
        }
    }

    fn process_requests(&mut self) {
        let candidates: Vec<PropertyId> = self
            .pending_process
            .iter()
            .copied()
            .filter(|property| !self.active_callbacks.contains_key(property))
            .collect();
        self.pending_process
            .retain(|property| self.active_callbacks.contains_key(property));

        for property in candidates {
            let Some(node) = self.nodes.get_mut(&property) else {
                continue;
            };
            if !node.has_ongoing_requests() {
                continue;
            }
            let captured = self.shared.requests.start_process(property);
            self.next_callback_id += 1;
            let callback_id = self.next_callback_id;
            self.active_callbacks.insert(property, callback_id);
            trace!(
                "[{}] process {} (callback {}, {} captured)",
                self.name,
                node.name(),
                callback_id,
                captured
            );
            let callback = CallbackHandle::new(property, callback_id, self.control_tx.clone());
            node.process(&mut self.shared, callback);
        }
    }

    /// Fails every outstanding request when none of them can make progress.
    fn cancel_stalled_requests(&mut self) -> bool {
        if self.shared.requests.is_empty() || !self.active_callbacks.is_empty() {
            return false;
        }
        let ids = self.shared.requests.ids();
        error!(
            "[{}] no property can make progress, cancelling {} outstanding requests",
            self.name,
            ids.len()
        );
        let mut cancelled = 0;
        for id in ids {
            let Some(receiver) = self.shared.requests.get(id).map(|record| record.receiver) else {
                continue;
            };
            if let Some(node) = self.nodes.get_mut(&receiver) {
                if node.cancel_request(&mut self.shared, id) {
                    cancelled += 1;
                }
            }
        }
        cancelled > 0
    }
}

struct ServerHandle {
    name: String,
    batch_tx: mpsc::Sender<BatchEnvelope>,
    control_tx: mpsc::UnboundedSender<ControlEvent>,
    shutdown_tx: watch::Sender<()>,
    lock_manager: LockManager,
    task: Mutex<Option<JoinHandle<()>>>,
}

/// Entry point of the broker.
///
/// Cheap to clone; all clones drive the same server task. The task stops on
/// [`shutdown`](PropertyServer::shutdown) or when the last clone is dropped.
#[derive(Clone)]
pub struct PropertyServer {
    inner: Arc<ServerHandle>,
}

impl std::fmt::Debug for PropertyServer {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        f.debug_struct("PropertyServer").field("name", &self.inner.name).finish()
    }
}

impl PropertyServer {
    /// Validates `config` and spawns the server task on the current tokio
    /// runtime.
    pub fn new(config: BrokerConfig) -> Result<Self> {
        let config = config.validate()?;
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| SystemError::NoRuntime)?;

        let (batch_tx, batch_rx) = mpsc::channel(config.server.event_channel_capacity);
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(());
        let lock_manager = LockManager::new();

        let core = ServerCore::new(
            &config,
            lock_manager.clone(),
            batch_rx,
            control_tx.clone(),
            control_rx,
            shutdown_rx,
        );
        let task = spawn_task(&runtime, &config.server.name, move || core.run());

        Ok(Self {
            inner: Arc::new(ServerHandle {
                name: config.server.name.clone(),
                batch_tx,
                control_tx,
                shutdown_tx,
                lock_manager,
                task: Mutex::new(Some(task)),
            }),
        })
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn lock_manager(&self) -> &LockManager {
        &self.inner.lock_manager
    }

    /// Submits a copy of `batch` and waits until every request in it has been
    /// answered.
    pub async fn request(
        &self,
        batch: &BatchRequest,
    ) -> Result<BatchResponse> {
        let (completion, response) = oneshot::channel();
        let envelope = BatchEnvelope {
            requests: batch.clone_requests(),
            completion,
        };
        self.inner
            .batch_tx
            .send(envelope)
            .await
            .map_err(|_| SystemError::ServerStopped)?;
        response.await.map_err(|_| SystemError::ServerStopped.into())
    }

    /// Submits a single request as its own batch.
    pub async fn request_one<K: RequestKey, V: PropertyValue>(
        &self,
        request: ExternalRequest<K, V>,
    ) -> Result<ExternalResponse<V>> {
        let mut batch = BatchRequest::new();
        let handle = batch.push(request);
        let response = self.request(&batch).await?;
        response
            .get(&handle)
            .cloned()
            .ok_or_else(|| ProtocolError::TypeMismatch("batch response").into())
    }

    /// Invalidates responses cached for `key` of `property`.
    ///
    /// Ordered with respect to batches submitted afterwards from the same
    /// task.
    pub fn increment_version<K: RequestKey, V: PropertyValue>(
        &self,
        property: &PropertyRef<K, V>,
        key: K,
    ) -> Result<()> {
        self.inner
            .control_tx
            .send(ControlEvent::IncrementVersion {
                property: property.property_id(),
                key: Box::new(key),
            })
            .map_err(|_| SystemError::ServerStopped.into())
    }

    pub fn register_observer<K: RequestKey, V: PropertyValue>(
        &self,
        property: &PropertyRef<K, V>,
        observer: Arc<dyn ValueObserver<K, V>>,
    ) -> Result<()> {
        let property = property.property_id();
        self.inner
            .control_tx
            .send(ControlEvent::RegisterObserver {
                property,
                register: Box::new(move |shared: &mut ServerShared| shared.add_observer(property, observer)),
            })
            .map_err(|_| SystemError::ServerStopped.into())
    }

    /// Reads the model of `property` on the server task. `None` if the
    /// server has never routed a request to it.
    #[cfg(test)]
    pub(crate) async fn inspect_model<P, R, F>(
        &self,
        property: &Arc<P>,
        f: F,
    ) -> Result<Option<R>>
    where
        P: Property,
        R: Send + 'static,
        F: FnOnce(&P::Model) -> R + Send + 'static,
    {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.inner
            .control_tx
            .send(ControlEvent::InspectModel {
                property: PropertyId::of(property.as_ref()),
                action: inspect_model_action::<P, R, F>(f, reply_tx),
            })
            .map_err(|_| SystemError::ServerStopped)?;
        Ok(reply_rx.await.ok())
    }

    /// Stops the server task and waits for it. Unfinished batches fail with
    /// [`SystemError::ServerStopped`].
    pub async fn shutdown(&self) -> Result<()> {
        // The task may already be gone.
        let _ = self.inner.shutdown_tx.send(());
        let task = self.inner.task.lock().take();
        if let Some(task) = task {
            task.await.map_err(SystemError::from)?;
        }
        Ok(())
    }
}
