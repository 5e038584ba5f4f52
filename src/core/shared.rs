use std::any::Any;
use std::collections::HashMap;
use std::collections::VecDeque;
use std::sync::Arc;

use tokio::sync::oneshot;
use tracing::debug;
use tracing::error;
use tracing::trace;
use tracing::warn;

use super::BatchId;
use super::BatchInfo;
use super::BatchResponse;
use super::BatchSlot;
use super::FillOutcome;
use super::PropertyNodeBox;
use super::RequestRecord;
use super::RequestState;
use super::RequestTable;
use super::ResponseSink;
use crate::BrokerConfig;
use crate::LockManager;
use crate::LockToken;
use crate::PropertyId;
use crate::PropertyRef;
use crate::PropertyValue;
use crate::ProtocolError;
use crate::RequestId;
use crate::RequestKey;
use crate::RequestResult;
use crate::Result;
use crate::ServerConfig;
use crate::TrackerConfig;
use crate::ValueObserver;
use crate::EXTERNAL_RESPONSES;
use crate::PROTOCOL_VIOLATIONS;

pub(crate) type NodeFactory = Box<dyn FnOnce(&TrackerConfig) -> PropertyNodeBox + Send>;

pub(crate) fn node_factory<K: RequestKey, V: PropertyValue>(target: &PropertyRef<K, V>) -> NodeFactory {
    let target = target.clone();
    Box::new(move |config: &TrackerConfig| target.create_node(config))
}

/// Work queued during a round and drained by the rearrange loop.
pub(crate) enum DelayedAction {
    /// Put a request into its receiver's new request list.
    Deliver {
        request_id: RequestId,
        receiver: PropertyId,
        factory: NodeFactory,
    },
    /// Hand a response to whoever sent the request.
    Respond {
        request_id: RequestId,
        sender: PropertyId,
        sink: ResponseSink,
        response: Box<dyn Any + Send>,
    },
}

/// Server state that property callbacks may touch.
///
/// Kept apart from the property nodes so a node and this state can be
/// borrowed mutably at the same time.
pub(crate) struct ServerShared {
    pub(crate) name: String,
    pub(crate) config: ServerConfig,
    pub(crate) tracker_config: TrackerConfig,
    pub(crate) requests: RequestTable,
    pub(crate) delayed: VecDeque<DelayedAction>,
    pub(crate) lock_manager: LockManager,
    next_request_id: u64,
    batches: HashMap<BatchId, BatchInfo>,
    next_batch_id: u64,
    /// `Vec<Arc<dyn ValueObserver<K, V>>>` per property.
    observers: HashMap<PropertyId, Box<dyn Any + Send>>,
    strict_violation: bool,
}

impl ServerShared {
    pub(crate) fn new(
        config: &BrokerConfig,
        lock_manager: LockManager,
    ) -> Self {
        Self {
            name: config.server.name.clone(),
            config: config.server.clone(),
            tracker_config: config.tracker.clone(),
            requests: RequestTable::default(),
            delayed: VecDeque::new(),
            lock_manager,
            next_request_id: 0,
            batches: HashMap::new(),
            next_batch_id: 0,
            observers: HashMap::new(),
            strict_violation: false,
        }
    }

    /// Reports a protocol violation to the offending caller.
    pub(crate) fn violation<T>(
        &mut self,
        error: ProtocolError,
    ) -> Result<T> {
        error!("[{}] protocol violation: {}", self.name, error);
        PROTOCOL_VIOLATIONS.with_label_values(&[self.name.as_str(), error.kind()]).inc();
        if self.config.strict_protocol {
            self.strict_violation = true;
            panic!("[{}] protocol violation: {}", self.name, error);
        }
        Err(error.into())
    }

    /// True once after a violation panicked in strict mode.
    pub(crate) fn take_strict_violation(&mut self) -> bool {
        std::mem::take(&mut self.strict_violation)
    }

    pub(crate) fn handle_request(
        &mut self,
        sender: PropertyId,
        receiver: PropertyId,
        content: Arc<dyn Any + Send + Sync>,
        factory: NodeFactory,
        sink: ResponseSink,
    ) -> Result<RequestId> {
        if sender == receiver {
            return self.violation(ProtocolError::SelfRequest {
                property: sender.to_string(),
            });
        }
        let limit = self.config.max_outstanding_requests;
        if self.requests.len() >= limit {
            return self.violation(ProtocolError::TooManyRequests { limit });
        }

        self.next_request_id += 1;
        let id = RequestId(self.next_request_id);
        trace!("[{}] request {} {:?} -> {:?}", self.name, id, sender, receiver);
        self.requests.insert(RequestRecord {
            id,
            state: RequestState::Requesting,
            sender,
            receiver,
            content,
            sink,
        });
        self.delayed.push_back(DelayedAction::Deliver {
            request_id: id,
            receiver,
            factory,
        });
        Ok(id)
    }

    /// Completes `id` on behalf of `receiver`.
    pub(crate) fn handle_respond(
        &mut self,
        receiver: PropertyId,
        id: RequestId,
        response: Box<dyn Any + Send>,
    ) -> Result<()> {
        let rejection = match self.requests.get(id) {
            None => Some(ProtocolError::UnknownRequest(id)),
            Some(record) if record.receiver != receiver => Some(ProtocolError::NotReceiver {
                request_id: id,
                property: receiver.to_string(),
            }),
            Some(_) => None,
        };
        if let Some(e) = rejection {
            return self.violation(e);
        }
        let Some(record) = self.requests.remove(id) else {
            return self.violation(ProtocolError::UnknownRequest(id));
        };
        trace!("[{}] respond {} -> {:?}", self.name, id, record.sender);
        self.delayed.push_back(DelayedAction::Respond {
            request_id: id,
            sender: record.sender,
            sink: record.sink,
            response,
        });
        Ok(())
    }

    pub(crate) fn handle_redirect(
        &mut self,
        current: PropertyId,
        id: RequestId,
        target: PropertyId,
        factory: NodeFactory,
    ) -> Result<()> {
        if target == current {
            return self.violation(ProtocolError::RedirectToSelf(id));
        }
        let rejection = match self.requests.get(id) {
            None => Some(ProtocolError::UnknownRequest(id)),
            Some(record) if record.receiver != current => Some(ProtocolError::NotReceiver {
                request_id: id,
                property: current.to_string(),
            }),
            Some(record) if record.sender == target => Some(ProtocolError::SelfRequest {
                property: target.to_string(),
            }),
            Some(_) => None,
        };
        if let Some(e) = rejection {
            return self.violation(e);
        }
        self.requests.set_receiver(id, target);
        debug!("[{}] redirect {} {:?} -> {:?}", self.name, id, current, target);
        self.delayed.push_back(DelayedAction::Deliver {
            request_id: id,
            receiver: target,
            factory,
        });
        Ok(())
    }

    /// Registers a submitted batch. An empty batch completes right away and
    /// is never registered.
    pub(crate) fn activate_batch(
        &mut self,
        len: usize,
        completion: oneshot::Sender<BatchResponse>,
    ) -> Option<BatchId> {
        if len == 0 {
            let _ = completion.send(BatchResponse::empty());
            return None;
        }
        self.next_batch_id += 1;
        let id = BatchId(self.next_batch_id);
        self.batches.insert(id, BatchInfo::new(len, completion));
        Some(id)
    }

    pub(crate) fn active_batches(&self) -> usize {
        self.batches.len()
    }

    /// Final step of an external request: release its lock and fill its
    /// batch slot.
    pub(crate) fn dispatch_external(
        &mut self,
        slot: BatchSlot,
        lock: Option<LockToken>,
        response: Box<dyn Any + Send>,
        result: RequestResult,
    ) {
        if let Some(lock) = lock {
            if let Err(e) = lock.release() {
                warn!("[{}] failed to release external lock: {:?}", self.name, e);
            }
        }
        EXTERNAL_RESPONSES
            .with_label_values(&[self.name.as_str(), slot.request_type.as_str(), result.as_str()])
            .inc();

        let Some(batch) = self.batches.get_mut(&slot.batch) else {
            let _ = self.violation::<()>(ProtocolError::BatchNotActive(slot.batch.0));
            return;
        };
        match batch.fill(slot.batch, slot.index, response) {
            FillOutcome::Pending => {
                trace!("[{}] batch {} has {} pending", self.name, slot.batch.0, batch.remaining());
            }
            FillOutcome::Completed => {
                debug!("[{}] batch {} completed", self.name, slot.batch.0);
                self.batches.remove(&slot.batch);
            }
            FillOutcome::Rejected(e) => {
                let _ = self.violation::<()>(e);
            }
        }
    }

    pub(crate) fn add_observer<K: RequestKey, V: PropertyValue>(
        &mut self,
        property: PropertyId,
        observer: Arc<dyn ValueObserver<K, V>>,
    ) {
        let entry = self
            .observers
            .entry(property)
            .or_insert_with(|| Box::new(Vec::<Arc<dyn ValueObserver<K, V>>>::new()));
        match entry.downcast_mut::<Vec<Arc<dyn ValueObserver<K, V>>>>() {
            Some(observers) => observers.push(observer),
            None => {
                let _ = self.violation::<()>(ProtocolError::TypeMismatch("value observer"));
            }
        }
    }

    pub(crate) fn observers<K: RequestKey, V: PropertyValue>(
        &self,
        property: PropertyId,
    ) -> &[Arc<dyn ValueObserver<K, V>>] {
        self.observers
            .get(&property)
            .and_then(|entry| entry.downcast_ref::<Vec<Arc<dyn ValueObserver<K, V>>>>())
            .map(|observers| observers.as_slice())
            .unwrap_or(&[])
    }
}
