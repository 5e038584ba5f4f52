//! Property Broker Error Hierarchy
//!
//! Defines the error types surfaced by the property server, the lock manager
//! and the preset properties, categorized by the layer that detected them.

use config::ConfigError;
use tokio::task::JoinError;

use crate::RequestId;

#[doc(hidden)]
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Runtime-level failures (server task, channels)
    #[error(transparent)]
    System(#[from] SystemError),

    /// Configuration loading or validation failures
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// A property or caller broke the request/response protocol
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// Lock token misuse
    #[error(transparent)]
    Lock(#[from] LockError),

    /// Key/value conversion failures inside converter properties
    #[error(transparent)]
    Convert(#[from] ConvertError),
}

#[derive(Debug, thiserror::Error)]
pub enum SystemError {
    /// The server task is gone; pending and future batches cannot complete
    #[error("Property server stopped")]
    ServerStopped,

    /// `PropertyServer::new` was called outside of a tokio runtime
    #[error("No tokio runtime available to host the property server")]
    NoRuntime,

    #[error("Server task failed: {0}")]
    TaskFailed(#[from] JoinError),
}

/// Protocol violations. These are programmer errors: they are logged loudly,
/// counted, and returned to the offending caller. With
/// `server.strict_protocol` enabled they panic the server task instead.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("Property {property} cannot send a request to itself")]
    SelfRequest { property: String },

    #[error("Too many outstanding requests (limit {limit})")]
    TooManyRequests { limit: usize },

    #[error("Request {0} is unknown or already completed")]
    UnknownRequest(RequestId),

    #[error("Property {property} is not the receiver of request {request_id}")]
    NotReceiver { request_id: RequestId, property: String },

    #[error("Request {request_id} is not ongoing on property {property}")]
    NotOngoing { request_id: RequestId, property: String },

    #[error("Request {0} cannot be redirected to its current receiver")]
    RedirectToSelf(RequestId),

    #[error("Process callback was already completed")]
    CallbackCompleted,

    #[error("Batch {0} is not active")]
    BatchNotActive(u64),

    #[error("Response slot {index} of batch {batch} was already filled")]
    ResponseSlotFilled { batch: u64, index: usize },

    #[error("Request or response payload has an unexpected type: {0}")]
    TypeMismatch(&'static str),
}

impl ProtocolError {
    /// Short label used by the protocol violation counter.
    pub fn kind(&self) -> &'static str {
        match self {
            ProtocolError::SelfRequest { .. } => "self_request",
            ProtocolError::TooManyRequests { .. } => "too_many_requests",
            ProtocolError::UnknownRequest(_) => "unknown_request",
            ProtocolError::NotReceiver { .. } => "not_receiver",
            ProtocolError::NotOngoing { .. } => "not_ongoing",
            ProtocolError::RedirectToSelf(_) => "redirect_to_self",
            ProtocolError::CallbackCompleted => "callback_completed",
            ProtocolError::BatchNotActive(_) => "batch_not_active",
            ProtocolError::ResponseSlotFilled { .. } => "response_slot_filled",
            ProtocolError::TypeMismatch(_) => "type_mismatch",
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum LockError {
    #[error("Lock token {0} is a read-only view and cannot release the lock")]
    NotReleasable(u64),

    #[error("Lock token {0} belongs to a different lock manager")]
    ForeignToken(u64),
}

#[derive(Debug, thiserror::Error)]
pub enum ConvertError {
    #[error("key conversion failure: {0}")]
    Key(String),

    #[error("value conversion failure: {0}")]
    Value(String),
}
