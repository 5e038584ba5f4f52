use std::any::Any;
use std::collections::HashMap;
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use super::ServerShared;
use crate::PropertyId;
use crate::RequestId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RequestState {
    /// Sent, not yet handed to the receiver.
    Requesting,
    /// Delivered to the receiver's new request list.
    Forwarded,
    /// Captured by an active process invocation of a leaf receiver.
    Processing,
}

pub(crate) type PropertyHandler = Box<dyn FnOnce(&mut dyn Any, &mut ServerShared, RequestId, Box<dyn Any + Send>) + Send>;

pub(crate) type ExternalHandler = Box<dyn FnOnce(&mut ServerShared, Box<dyn Any + Send>) + Send>;

/// Where a response goes once the receiver answers.
pub(crate) enum ResponseSink {
    /// Back into the sending property, on the server task.
    Property(PropertyHandler),
    /// Into the batch slot of an external request.
    External(ExternalHandler),
}

impl fmt::Debug for ResponseSink {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        match self {
            ResponseSink::Property(_) => write!(f, "ResponseSink::Property"),
            ResponseSink::External(_) => write!(f, "ResponseSink::External"),
        }
    }
}

pub(crate) struct RequestRecord {
    pub(crate) id: RequestId,
    pub(crate) state: RequestState,
    pub(crate) sender: PropertyId,
    pub(crate) receiver: PropertyId,
    /// `Arc<RequestContent<K, V>>` of the receiver's key and value types.
    pub(crate) content: Arc<dyn Any + Send + Sync>,
    pub(crate) sink: ResponseSink,
}

impl fmt::Debug for RequestRecord {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.debug_struct("RequestRecord")
            .field("id", &self.id)
            .field("state", &self.state)
            .field("sender", &self.sender)
            .field("receiver", &self.receiver)
            .finish()
    }
}

/// Every outstanding request, indexed by id, sender and receiver.
#[derive(Default)]
pub(crate) struct RequestTable {
    requests: HashMap<RequestId, RequestRecord>,
    senders: HashMap<PropertyId, HashSet<RequestId>>,
    receivers: HashMap<PropertyId, HashSet<RequestId>>,
    /// Requests captured when a leaf receiver's process invocation started.
    snapshots: HashMap<PropertyId, Vec<RequestId>>,
}

fn index_remove(
    index: &mut HashMap<PropertyId, HashSet<RequestId>>,
    property: PropertyId,
    id: RequestId,
) {
    if let Some(ids) = index.get_mut(&property) {
        ids.remove(&id);
        if ids.is_empty() {
            index.remove(&property);
        }
    }
}

impl RequestTable {
    pub(crate) fn insert(
        &mut self,
        record: RequestRecord,
    ) {
        self.senders.entry(record.sender).or_default().insert(record.id);
        self.receivers.entry(record.receiver).or_default().insert(record.id);
        self.requests.insert(record.id, record);
    }

    pub(crate) fn remove(
        &mut self,
        id: RequestId,
    ) -> Option<RequestRecord> {
        let record = self.requests.remove(&id)?;
        index_remove(&mut self.senders, record.sender, id);
        index_remove(&mut self.receivers, record.receiver, id);
        Some(record)
    }

    pub(crate) fn get(
        &self,
        id: RequestId,
    ) -> Option<&RequestRecord> {
        self.requests.get(&id)
    }

    pub(crate) fn set_state(
        &mut self,
        id: RequestId,
        state: RequestState,
    ) -> bool {
        match self.requests.get_mut(&id) {
            Some(record) => {
                record.state = state;
                true
            }
            None => false,
        }
    }

    /// Hands `id` over to another receiver.
    pub(crate) fn set_receiver(
        &mut self,
        id: RequestId,
        receiver: PropertyId,
    ) -> bool {
        let Some(record) = self.requests.get_mut(&id) else {
            return false;
        };
        let previous = record.receiver;
        record.receiver = receiver;
        record.state = RequestState::Requesting;
        index_remove(&mut self.receivers, previous, id);
        self.receivers.entry(receiver).or_default().insert(id);
        true
    }

    pub(crate) fn len(&self) -> usize {
        self.requests.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }

    pub(crate) fn is_sender(
        &self,
        property: PropertyId,
    ) -> bool {
        self.senders.contains_key(&property)
    }

    /// Outstanding requests addressed to `property`, oldest first.
    pub(crate) fn incoming(
        &self,
        property: PropertyId,
    ) -> Vec<RequestId> {
        let mut ids: Vec<RequestId> = self
            .receivers
            .get(&property)
            .map(|ids| ids.iter().copied().collect())
            .unwrap_or_default();
        ids.sort();
        ids
    }

    /// All outstanding ids, oldest first.
    pub(crate) fn ids(&self) -> Vec<RequestId> {
        let mut ids: Vec<RequestId> = self.requests.keys().copied().collect();
        ids.sort();
        ids
    }

    /// Starts a process invocation of `property`.
    ///
    /// A leaf receiver (one with no outstanding requests of its own) gets its
    /// current incoming requests captured. Returns the number captured.
    pub(crate) fn start_process(
        &mut self,
        property: PropertyId,
    ) -> usize {
        if self.is_sender(property) {
            self.snapshots.remove(&property);
            return 0;
        }
        let ids = self.incoming(property);
        for id in &ids {
            self.set_state(*id, RequestState::Processing);
        }
        let captured = ids.len();
        self.snapshots.insert(property, ids);
        captured
    }

    /// Ends the process invocation of `property`.
    ///
    /// Returns captured requests that are still unanswered; the caller must
    /// cancel them. Nothing is returned if the property started sending
    /// requests of its own in the meantime.
    pub(crate) fn end_process(
        &mut self,
        property: PropertyId,
    ) -> Vec<RequestId> {
        let Some(snapshot) = self.snapshots.remove(&property) else {
            return Vec::new();
        };
        if self.is_sender(property) {
            return Vec::new();
        }
        snapshot
            .into_iter()
            .filter(|id| self.requests.get(id).is_some_and(|record| record.receiver == property))
            .collect()
    }
}
