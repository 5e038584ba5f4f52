use std::fmt;
use std::sync::Arc;

use crate::LockToken;
use crate::LockType;
use crate::PropertyRef;
use crate::PropertyValue;
use crate::RequestKey;
use crate::ResponseTracker;

/// Server-unique, monotonically increasing request id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RequestId(pub(crate) u64);

impl RequestId {
    pub fn value(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for RequestId {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestType {
    Read,
    Modify,
}

impl RequestType {
    pub fn lock_type(self) -> LockType {
        match self {
            RequestType::Read => LockType::Read,
            RequestType::Modify => LockType::Write,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RequestType::Read => "read",
            RequestType::Modify => "modify",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestOption {
    /// Bump the response tracker of the key after a successful modify.
    pub notify: bool,
}

impl Default for RequestOption {
    fn default() -> Self {
        Self { notify: true }
    }
}

/// What a request asks for. Immutable once sent.
#[derive(Debug, Clone)]
pub struct RequestContent<K, V> {
    request_type: RequestType,
    key: K,
    value: Option<V>,
    option: RequestOption,
    lock: LockToken,
}

impl<K: RequestKey, V: PropertyValue> RequestContent<K, V> {
    pub fn new(
        request_type: RequestType,
        key: K,
        value: Option<V>,
        option: RequestOption,
        lock: LockToken,
    ) -> Self {
        Self {
            request_type,
            key,
            value,
            option,
            lock,
        }
    }

    pub fn request_type(&self) -> RequestType {
        self.request_type
    }

    pub fn key(&self) -> &K {
        &self.key
    }

    pub fn value(&self) -> Option<&V> {
        self.value.as_ref()
    }

    pub fn option(&self) -> RequestOption {
        self.option
    }

    pub fn lock(&self) -> &LockToken {
        &self.lock
    }

    /// Same request against another key/value domain.
    pub fn with_key_and_value<K2: RequestKey, V2: PropertyValue>(
        &self,
        key: K2,
        value: Option<V2>,
    ) -> RequestContent<K2, V2> {
        RequestContent {
            request_type: self.request_type,
            key,
            value,
            option: self.option,
            lock: self.lock.clone(),
        }
    }

    pub fn with_lock(
        &self,
        lock: LockToken,
    ) -> Self {
        Self {
            lock,
            ..self.clone()
        }
    }

    pub fn with_type_and_value(
        &self,
        request_type: RequestType,
        value: Option<V>,
    ) -> Self {
        Self {
            request_type,
            value,
            ..self.clone()
        }
    }

    pub fn with_option(
        &self,
        option: RequestOption,
    ) -> Self {
        Self {
            option,
            ..self.clone()
        }
    }
}

/// A delivered request as seen by its receiver.
#[derive(Debug)]
pub struct SealedRequest<K, V> {
    id: RequestId,
    content: Arc<RequestContent<K, V>>,
}

impl<K, V> Clone for SealedRequest<K, V> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            content: self.content.clone(),
        }
    }
}

impl<K: RequestKey, V: PropertyValue> SealedRequest<K, V> {
    pub(crate) fn new(
        id: RequestId,
        content: Arc<RequestContent<K, V>>,
    ) -> Self {
        Self { id, content }
    }

    pub fn id(&self) -> RequestId {
        self.id
    }

    pub fn content(&self) -> &RequestContent<K, V> {
        &self.content
    }

    pub fn request_type(&self) -> RequestType {
        self.content.request_type()
    }

    pub fn key(&self) -> &K {
        self.content.key()
    }

    pub fn value(&self) -> Option<&V> {
        self.content.value()
    }

    pub fn option(&self) -> RequestOption {
        self.content.option()
    }

    pub fn lock(&self) -> &LockToken {
        self.content.lock()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestResult {
    Successful,
    Failed,
}

impl RequestResult {
    pub fn as_str(self) -> &'static str {
        match self {
            RequestResult::Successful => "successful",
            RequestResult::Failed => "failed",
        }
    }
}

/// Answer to an internal request.
///
/// A response carrying a tracker is fresh until the tracker's version moves
/// past the captured `version`. A response without a tracker is never
/// considered fresh by caches.
#[derive(Debug, Clone)]
pub struct Response<V> {
    result: RequestResult,
    value: Option<V>,
    message: Option<String>,
    tracker: Option<Arc<ResponseTracker>>,
    version: i64,
}

impl<V> Response<V> {
    pub fn successful(value: Option<V>) -> Self {
        Self {
            result: RequestResult::Successful,
            value,
            message: None,
            tracker: None,
            version: 0,
        }
    }

    pub fn failed() -> Self {
        Self {
            result: RequestResult::Failed,
            value: None,
            message: None,
            tracker: None,
            version: 0,
        }
    }

    pub fn failed_with(message: impl Into<String>) -> Self {
        Self {
            message: Some(message.into()),
            ..Self::failed()
        }
    }

    pub fn cancelled() -> Self {
        Self::failed_with(crate::constants::MSG_REQUEST_CANCELLED)
    }

    /// Attaches `tracker`, capturing its current version.
    pub fn with_tracker(
        mut self,
        tracker: Arc<ResponseTracker>,
    ) -> Self {
        self.version = tracker.version();
        self.tracker = Some(tracker);
        self
    }

    pub fn with_tracker_version(
        mut self,
        tracker: Option<Arc<ResponseTracker>>,
        version: i64,
    ) -> Self {
        self.tracker = tracker;
        self.version = version;
        self
    }

    pub fn with_message(
        mut self,
        message: impl Into<String>,
    ) -> Self {
        self.message = Some(message.into());
        self
    }

    /// Converts the value, keeping result, message and tracker.
    pub fn map_value<U>(
        self,
        f: impl FnOnce(V) -> U,
    ) -> Response<U> {
        Response {
            result: self.result,
            value: self.value.map(f),
            message: self.message,
            tracker: self.tracker,
            version: self.version,
        }
    }

    pub fn with_value<U>(
        &self,
        value: Option<U>,
    ) -> Response<U> {
        Response {
            result: self.result,
            value,
            message: self.message.clone(),
            tracker: self.tracker.clone(),
            version: self.version,
        }
    }

    pub fn result(&self) -> RequestResult {
        self.result
    }

    pub fn is_successful(&self) -> bool {
        self.result == RequestResult::Successful
    }

    pub fn value(&self) -> Option<&V> {
        self.value.as_ref()
    }

    pub fn into_value(self) -> Option<V> {
        self.value
    }

    pub fn message(&self) -> Option<&str> {
        self.message.as_deref()
    }

    pub fn tracker(&self) -> Option<&Arc<ResponseTracker>> {
        self.tracker.as_ref()
    }

    pub fn version(&self) -> i64 {
        self.version
    }

    pub fn is_stale(&self) -> bool {
        match &self.tracker {
            Some(tracker) => self.version < tracker.version(),
            None => true,
        }
    }
}

/// A request submitted from outside the property graph.
pub struct ExternalRequest<K: RequestKey, V: PropertyValue> {
    pub(crate) request_type: RequestType,
    pub(crate) property: PropertyRef<K, V>,
    pub(crate) key: K,
    pub(crate) value: Option<V>,
    pub(crate) option: RequestOption,
}

impl<K: RequestKey, V: PropertyValue> Clone for ExternalRequest<K, V> {
    fn clone(&self) -> Self {
        Self {
            request_type: self.request_type,
            property: self.property.clone(),
            key: self.key.clone(),
            value: self.value.clone(),
            option: self.option,
        }
    }
}

impl<K: RequestKey, V: PropertyValue> fmt::Debug for ExternalRequest<K, V> {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.debug_struct("ExternalRequest")
            .field("request_type", &self.request_type)
            .field("property", &self.property.property_name())
            .field("key", &self.key)
            .field("value", &self.value)
            .field("option", &self.option)
            .finish()
    }
}

impl<K: RequestKey, V: PropertyValue> ExternalRequest<K, V> {
    pub fn builder(
        property: &PropertyRef<K, V>,
        key: K,
    ) -> ExternalRequestBuilder<K, V> {
        ExternalRequestBuilder::new(property, key)
    }

    pub fn read(
        property: &PropertyRef<K, V>,
        key: K,
    ) -> Self {
        Self::builder(property, key).build()
    }

    pub fn modify(
        property: &PropertyRef<K, V>,
        key: K,
        value: V,
    ) -> Self {
        Self::builder(property, key)
            .request_type(RequestType::Modify)
            .value(value)
            .build()
    }

    pub fn request_type(&self) -> RequestType {
        self.request_type
    }

    pub fn key(&self) -> &K {
        &self.key
    }

    pub fn value(&self) -> Option<&V> {
        self.value.as_ref()
    }
}

pub struct ExternalRequestBuilder<K: RequestKey, V: PropertyValue> {
    request: ExternalRequest<K, V>,
}

impl<K: RequestKey, V: PropertyValue> ExternalRequestBuilder<K, V> {
    pub fn new(
        property: &PropertyRef<K, V>,
        key: K,
    ) -> Self {
        Self {
            request: ExternalRequest {
                request_type: RequestType::Read,
                property: property.clone(),
                key,
                value: None,
                option: RequestOption::default(),
            },
        }
    }

    pub fn request_type(
        mut self,
        request_type: RequestType,
    ) -> Self {
        self.request.request_type = request_type;
        self
    }

    pub fn value(
        mut self,
        value: V,
    ) -> Self {
        self.request.value = Some(value);
        self
    }

    pub fn maybe_value(
        mut self,
        value: Option<V>,
    ) -> Self {
        self.request.value = value;
        self
    }

    pub fn option(
        mut self,
        option: RequestOption,
    ) -> Self {
        self.request.option = option;
        self
    }

    pub fn build(self) -> ExternalRequest<K, V> {
        self.request
    }
}

/// Answer to an [`ExternalRequest`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExternalResponse<V> {
    result: RequestResult,
    value: Option<V>,
    message: Option<String>,
}

impl<V> ExternalResponse<V> {
    pub(crate) fn failed(message: impl Into<String>) -> Self {
        Self {
            result: RequestResult::Failed,
            value: None,
            message: Some(message.into()),
        }
    }

    pub fn result(&self) -> RequestResult {
        self.result
    }

    pub fn is_successful(&self) -> bool {
        self.result == RequestResult::Successful
    }

    pub fn value(&self) -> Option<&V> {
        self.value.as_ref()
    }

    pub fn into_value(self) -> Option<V> {
        self.value
    }

    pub fn message(&self) -> Option<&str> {
        self.message.as_deref()
    }
}

impl<V> From<Response<V>> for ExternalResponse<V> {
    fn from(response: Response<V>) -> Self {
        Self {
            result: response.result,
            value: response.value,
            message: response.message,
        }
    }
}
