use std::any::Any;
use std::borrow::Cow;
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

use tokio::sync::oneshot;

use super::node_factory;
use super::ResponseSink;
use super::ServerShared;
use crate::constants::MSG_RESPONSE_TYPE_MISMATCH;
use crate::ExternalRequest;
use crate::ExternalResponse;
use crate::LockResource;
use crate::LockToken;
use crate::PropertyId;
use crate::PropertyValue;
use crate::RequestContent;
use crate::RequestId;
use crate::RequestKey;
use crate::RequestType;
use crate::Response;
use crate::Result;

/// Type-erased external request, as carried by a batch.
pub(crate) trait ErasedExternalRequest: Send + Sync {
    fn request_type(&self) -> RequestType;

    fn key_string(&self) -> Cow<'_, str>;

    fn has_value(&self) -> bool;

    fn lock_resource(&self) -> LockResource;

    fn clone_boxed(&self) -> Box<dyn ErasedExternalRequest>;

    /// `ExternalResponse<V>` for this request's value type.
    fn failed_response(
        &self,
        message: &str,
    ) -> Box<dyn Any + Send>;

    fn submit(
        &self,
        shared: &mut ServerShared,
        lock: LockToken,
        slot: BatchSlot,
    ) -> Result<RequestId>;
}

impl<K: RequestKey, V: PropertyValue> ErasedExternalRequest for ExternalRequest<K, V> {
    fn request_type(&self) -> RequestType {
        self.request_type
    }

    fn key_string(&self) -> Cow<'_, str> {
        self.key.key_string()
    }

    fn has_value(&self) -> bool {
        self.value.is_some()
    }

    fn lock_resource(&self) -> LockResource {
        self.property.lock_resource(&self.key, self.request_type.lock_type())
    }

    fn clone_boxed(&self) -> Box<dyn ErasedExternalRequest> {
        Box::new(self.clone())
    }

    fn failed_response(
        &self,
        message: &str,
    ) -> Box<dyn Any + Send> {
        Box::new(ExternalResponse::<V>::failed(message))
    }

    fn submit(
        &self,
        shared: &mut ServerShared,
        lock: LockToken,
        slot: BatchSlot,
    ) -> Result<RequestId> {
        let content = RequestContent::new(
            self.request_type,
            self.key.clone(),
            self.value.clone(),
            self.option,
            lock.clone(),
        );
        let sink = ResponseSink::External(Box::new(move |shared: &mut ServerShared, response: Box<dyn Any + Send>| {
            let response: ExternalResponse<V> = match response.downcast::<Response<V>>() {
                Ok(response) => ExternalResponse::from(*response),
                Err(_) => ExternalResponse::failed(MSG_RESPONSE_TYPE_MISMATCH),
            };
            let result = response.result();
            shared.dispatch_external(slot, Some(lock), Box::new(response), result);
        }));
        shared.handle_request(
            PropertyId::SERVER,
            self.property.property_id(),
            Arc::new(content),
            node_factory(&self.property),
            sink,
        )
    }
}

/// A group of external requests submitted together.
///
/// A batch can be submitted any number of times; each submission works on
/// its own copy of the requests.
#[derive(Default)]
pub struct BatchRequest {
    requests: Vec<Box<dyn ErasedExternalRequest>>,
}

impl fmt::Debug for BatchRequest {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.debug_struct("BatchRequest")
            .field("requests", &self.requests.len())
            .finish()
    }
}

impl BatchRequest {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `request`, returning the handle to look its answer up with.
    pub fn push<K: RequestKey, V: PropertyValue>(
        &mut self,
        request: ExternalRequest<K, V>,
    ) -> ResponseHandle<V> {
        let index = self.requests.len();
        self.requests.push(Box::new(request));
        ResponseHandle {
            index,
            _marker: PhantomData,
        }
    }

    pub fn len(&self) -> usize {
        self.requests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }

    pub(crate) fn clone_requests(&self) -> Vec<Box<dyn ErasedExternalRequest>> {
        self.requests.iter().map(|request| request.clone_boxed()).collect()
    }
}

/// Typed index of a request within its batch.
pub struct ResponseHandle<V> {
    index: usize,
    _marker: PhantomData<fn() -> V>,
}

impl<V> Clone for ResponseHandle<V> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<V> Copy for ResponseHandle<V> {}

impl<V> fmt::Debug for ResponseHandle<V> {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.debug_tuple("ResponseHandle").field(&self.index).finish()
    }
}

impl<V> ResponseHandle<V> {
    pub fn index(&self) -> usize {
        self.index
    }
}

/// Answers to a batch, index-aligned with its requests.
pub struct BatchResponse {
    responses: Vec<Option<Box<dyn Any + Send>>>,
}

impl fmt::Debug for BatchResponse {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.debug_struct("BatchResponse")
            .field("responses", &self.responses.len())
            .finish()
    }
}

impl BatchResponse {
    pub(crate) fn empty() -> Self {
        Self { responses: Vec::new() }
    }

    pub fn get<V: PropertyValue>(
        &self,
        handle: &ResponseHandle<V>,
    ) -> Option<&ExternalResponse<V>> {
        self.responses
            .get(handle.index)?
            .as_ref()?
            .downcast_ref::<ExternalResponse<V>>()
    }

    pub fn len(&self) -> usize {
        self.responses.len()
    }

    pub fn is_empty(&self) -> bool {
        self.responses.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct BatchId(pub(crate) u64);

/// Position of an external request inside an active batch.
#[derive(Debug, Clone, Copy)]
pub(crate) struct BatchSlot {
    pub(crate) batch: BatchId,
    pub(crate) index: usize,
    pub(crate) request_type: RequestType,
}

pub(crate) enum FillOutcome {
    Pending,
    Completed,
    Rejected(crate::ProtocolError),
}

/// Completion state of one submitted batch.
pub(crate) struct BatchInfo {
    remaining: usize,
    responses: Vec<Option<Box<dyn Any + Send>>>,
    completion: Option<oneshot::Sender<BatchResponse>>,
}

impl BatchInfo {
    pub(crate) fn new(
        len: usize,
        completion: oneshot::Sender<BatchResponse>,
    ) -> Self {
        Self {
            remaining: len,
            responses: (0..len).map(|_| None).collect(),
            completion: Some(completion),
        }
    }

    pub(crate) fn remaining(&self) -> usize {
        self.remaining
    }

    /// Stores the answer of slot `index`. Completes the batch on the last one.
    pub(crate) fn fill(
        &mut self,
        batch: BatchId,
        index: usize,
        response: Box<dyn Any + Send>,
    ) -> FillOutcome {
        match self.responses.get_mut(index) {
            Some(slot) if slot.is_none() => *slot = Some(response),
            _ => return FillOutcome::Rejected(crate::ProtocolError::ResponseSlotFilled { batch: batch.0, index }),
        }
        assert!(self.remaining > 0, "batch {} completed more often than it has requests", batch.0);
        self.remaining -= 1;
        if self.remaining > 0 {
            return FillOutcome::Pending;
        }
        if let Some(completion) = self.completion.take() {
            let responses = std::mem::take(&mut self.responses);
            // The caller may have stopped waiting.
            let _ = completion.send(BatchResponse { responses });
        }
        FillOutcome::Completed
    }
}
