use std::any::Any;
use std::fmt;

use tokio::sync::oneshot;

use super::BatchResponse;
use super::ErasedExternalRequest;
use super::ServerShared;
use crate::PropertyId;

/// Deferred work posted by a property from its process invocation.
pub(crate) type NodeAction = Box<dyn FnOnce(&mut dyn Any, &mut ServerShared) + Send>;

pub(crate) struct ProcessPost {
    pub(crate) property: PropertyId,
    pub(crate) callback_id: u64,
    pub(crate) completed: bool,
    pub(crate) action: Option<NodeAction>,
}

/// Unbounded, high-priority events for the server task.
pub(crate) enum ControlEvent {
    Process(ProcessPost),
    IncrementVersion {
        property: PropertyId,
        /// The property's `Key`, boxed.
        key: Box<dyn Any + Send>,
    },
    RegisterObserver {
        property: PropertyId,
        register: Box<dyn FnOnce(&mut ServerShared) + Send>,
    },
    /// Runs `action` against a property's state, if the server knows it.
    #[cfg(test)]
    InspectModel {
        property: PropertyId,
        action: NodeAction,
    },
}

impl fmt::Debug for ControlEvent {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        match self {
            ControlEvent::Process(post) => f
                .debug_struct("Process")
                .field("property", &post.property)
                .field("callback_id", &post.callback_id)
                .field("completed", &post.completed)
                .field("has_action", &post.action.is_some())
                .finish(),
            ControlEvent::IncrementVersion { property, .. } => f
                .debug_struct("IncrementVersion")
                .field("property", property)
                .finish(),
            ControlEvent::RegisterObserver { property, .. } => f
                .debug_struct("RegisterObserver")
                .field("property", property)
                .finish(),
            #[cfg(test)]
            ControlEvent::InspectModel { property, .. } => f
                .debug_struct("InspectModel")
                .field("property", property)
                .finish(),
        }
    }
}

/// A batch on its way to the server task.
pub(crate) struct BatchEnvelope {
    pub(crate) requests: Vec<Box<dyn ErasedExternalRequest>>,
    pub(crate) completion: oneshot::Sender<BatchResponse>,
}

impl fmt::Debug for BatchEnvelope {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.debug_struct("BatchEnvelope")
            .field("requests", &self.requests.len())
            .finish()
    }
}
