use std::collections::HashMap;
use std::sync::Arc;

use tracing::debug;
use tracing::error;
use tracing::warn;

use crate::LockResource;
use crate::LockType;
use crate::ProcessCallback;
use crate::Property;
use crate::PropertyContext;
use crate::PropertyRef;
use crate::PropertyValue;
use crate::RequestId;
use crate::RequestKey;
use crate::RequestOption;
use crate::RequestType;
use crate::Response;
use crate::ResponseTracker;
use crate::SealedRequest;

/// Layers several sources of the same types, fastest first.
///
/// A read falls through the sources in order until one succeeds, then the
/// value is written back into every source tried before it. A modify goes to
/// all sources.
pub struct MultiSourceProperty<K: RequestKey, V: PropertyValue> {
    name: String,
    sources: Vec<PropertyRef<K, V>>,
}

struct ReadRound<K: RequestKey, V: PropertyValue> {
    /// First reader; later readers of the key piggyback on its round.
    leader: SealedRequest<K, V>,
    readers: Vec<RequestId>,
    next_source: usize,
    trackers: Vec<Arc<ResponseTracker>>,
}

struct WriteRound<K> {
    key: K,
    outstanding: usize,
    responded: bool,
    trackers: Vec<Arc<ResponseTracker>>,
}

pub struct MultiSourceModel<K: RequestKey, V: PropertyValue> {
    reads: HashMap<K, ReadRound<K, V>>,
    source_reads: HashMap<RequestId, K>,
    writes: HashMap<RequestId, WriteRound<K>>,
    /// Source write id -> caller request id.
    source_writes: HashMap<RequestId, RequestId>,
}

impl<K: RequestKey, V: PropertyValue> MultiSourceModel<K, V> {
    #[cfg(test)]
    pub(crate) fn in_flight(&self) -> usize {
        self.source_reads.len() + self.source_writes.len()
    }
}

/// Composite tracker for `key` following every tracker in `trackers`.
fn composite_response<K, V>(
    ctx: &mut PropertyContext<'_, MultiSourceProperty<K, V>>,
    key: &K,
    trackers: Vec<Arc<ResponseTracker>>,
    value: Option<V>,
) -> Response<V>
where
    K: RequestKey,
    V: PropertyValue,
{
    if trackers.is_empty() {
        return Response::successful(value);
    }
    let tracker = ctx.trackers().get_or_add_tracker(key);
    tracker.update_sub_trackers(trackers);
    Response::successful(value).with_tracker(tracker)
}

impl<K: RequestKey, V: PropertyValue> MultiSourceProperty<K, V> {
    pub fn new(
        name: impl Into<String>,
        sources: Vec<PropertyRef<K, V>>,
    ) -> Self {
        Self {
            name: name.into(),
            sources,
        }
    }

    pub fn sources(&self) -> &[PropertyRef<K, V>] {
        &self.sources
    }

    /// Sends the read of `key` to the next source that accepts it. When the
    /// sources are exhausted every reader fails.
    fn continue_read(
        &self,
        ctx: &mut PropertyContext<'_, Self>,
        key: &K,
    ) {
        loop {
            let Some(round) = ctx.model_mut().reads.get_mut(key) else {
                return;
            };
            let index = round.next_source;
            if index >= self.sources.len() {
                break;
            }
            round.next_source += 1;
            let content = round
                .leader
                .content()
                .with_lock(round.leader.lock().readonly());
            match ctx.request(&self.sources[index], content, Self::on_read_response) {
                Ok(source_id) => {
                    ctx.model_mut().source_reads.insert(source_id, key.clone());
                    return;
                }
                Err(e) => warn!("{}: read from source {} not sent: {}", self.name, index, e),
            }
        }

        let Some(round) = ctx.model_mut().reads.remove(key) else {
            return;
        };
        debug!("{}: every source failed {:?}", self.name, key);
        for reader in round.readers {
            let _ = ctx.respond(reader, Response::failed());
        }
    }

    fn on_read_response(
        ctx: &mut PropertyContext<'_, Self>,
        id: RequestId,
        response: Response<V>,
    ) {
        let property = ctx.property().clone();
        let Some(key) = ctx.model_mut().source_reads.remove(&id) else {
            error!("{}: read response {} matches no source read", property.name, id);
            return;
        };
        let Some(round) = ctx.model_mut().reads.get_mut(&key) else {
            error!("{}: no read round for {:?}", property.name, key);
            return;
        };
        if let Some(tracker) = response.tracker() {
            round.trackers.push(tracker.clone());
        }
        if !response.is_successful() {
            property.continue_read(ctx, &key);
            return;
        }

        let Some(round) = ctx.model_mut().reads.remove(&key) else {
            return;
        };
        // Back-fill the sources that missed, nearest first.
        if let Some(value) = response.value() {
            let backfill = round
                .leader
                .content()
                .with_type_and_value(RequestType::Modify, Some(value.clone()))
                .with_lock(round.leader.lock().readonly())
                .with_option(RequestOption { notify: false });
            let answered_by = round.next_source - 1;
            for source in property.sources[..answered_by].iter().rev() {
                if let Err(e) = ctx.request(source, backfill.clone(), Self::on_backfill_response) {
                    warn!("{}: back-fill of {:?} not sent: {}", property.name, key, e);
                }
            }
        }

        let response = composite_response(ctx, &key, round.trackers, response.into_value());
        for reader in round.readers {
            let _ = ctx.respond(reader, response.clone());
        }
    }

    fn on_write_response(
        ctx: &mut PropertyContext<'_, Self>,
        id: RequestId,
        response: Response<V>,
    ) {
        let Some(origin) = ctx.model_mut().source_writes.remove(&id) else {
            error!("{}: write response {} matches no source write", ctx.property().name, id);
            return;
        };
        let Some(round) = ctx.model_mut().writes.get_mut(&origin) else {
            error!("{}: no write round for {}", ctx.property().name, origin);
            return;
        };
        round.outstanding -= 1;
        if let Some(tracker) = response.tracker() {
            round.trackers.push(tracker.clone());
        }
        if round.responded {
            if round.outstanding == 0 {
                ctx.model_mut().writes.remove(&origin);
            }
            return;
        }
        if !response.is_successful() {
            round.responded = true;
            if round.outstanding == 0 {
                ctx.model_mut().writes.remove(&origin);
            }
            let _ = ctx.respond(origin, response.with_value(None));
            return;
        }
        if round.outstanding > 0 {
            return;
        }
        let Some(round) = ctx.model_mut().writes.remove(&origin) else {
            return;
        };
        let response = composite_response(ctx, &round.key, round.trackers, None);
        let _ = ctx.respond(origin, response);
    }

    fn on_backfill_response(
        ctx: &mut PropertyContext<'_, Self>,
        id: RequestId,
        response: Response<V>,
    ) {
        if !response.is_successful() {
            debug!("{}: back-fill {} failed", ctx.property().name, id);
        }
    }
}

impl<K: RequestKey, V: PropertyValue> Property for MultiSourceProperty<K, V> {
    type Key = K;
    type Value = V;
    type Model = MultiSourceModel<K, V>;

    fn create_model(&self) -> Self::Model {
        MultiSourceModel {
            reads: HashMap::new(),
            source_reads: HashMap::new(),
            writes: HashMap::new(),
            source_writes: HashMap::new(),
        }
    }

    /// Every source but the last may be back-filled, so they are locked for
    /// writing.
    fn lock_resource(
        &self,
        key: &K,
        lock_type: LockType,
    ) -> LockResource {
        let mut resource = LockResource::default();
        let last = self.sources.len().saturating_sub(1);
        for (index, source) in self.sources.iter().enumerate() {
            let source_type = if index == last { lock_type } else { LockType::Write };
            resource.merge(&source.lock_resource(key, source_type));
        }
        resource
    }

    fn rearrange_requests(
        &self,
        ctx: &mut PropertyContext<'_, Self>,
    ) {
        for request in ctx.new_requests().to_vec() {
            if self.sources.is_empty() {
                error!("{}: no sources configured", self.name);
                let _ = ctx.respond(request.id(), Response::failed());
                continue;
            }
            let key = request.key().clone();
            match request.request_type() {
                RequestType::Read => {
                    if let Some(round) = ctx.model_mut().reads.get_mut(&key) {
                        round.readers.push(request.id());
                        continue;
                    }
                    ctx.model_mut().reads.insert(
                        key.clone(),
                        ReadRound {
                            readers: vec![request.id()],
                            leader: request,
                            next_source: 0,
                            trackers: Vec::new(),
                        },
                    );
                    self.continue_read(ctx, &key);
                }
                RequestType::Modify => {
                    let content = request.content().with_lock(request.lock().readonly());
                    let mut round = WriteRound {
                        key,
                        outstanding: 0,
                        responded: false,
                        trackers: Vec::new(),
                    };
                    let mut sent = Vec::new();
                    for source in &self.sources {
                        match ctx.request(source, content.clone(), Self::on_write_response) {
                            Ok(source_id) => {
                                round.outstanding += 1;
                                sent.push(source_id);
                            }
                            Err(e) => {
                                warn!("{}: write of {} not sent: {}", self.name, request.id(), e);
                                round.responded = true;
                            }
                        }
                    }
                    if round.responded {
                        let _ = ctx.respond(request.id(), Response::failed());
                    }
                    if round.outstanding == 0 {
                        continue;
                    }
                    let model = ctx.model_mut();
                    for source_id in sent {
                        model.source_writes.insert(source_id, request.id());
                    }
                    model.writes.insert(request.id(), round);
                }
            }
        }
    }

    fn process_requests(
        &self,
        _ctx: &mut PropertyContext<'_, Self>,
        callback: ProcessCallback<Self>,
    ) {
        let _ = callback.complete();
    }

    fn name(&self) -> &str {
        &self.name
    }
}
