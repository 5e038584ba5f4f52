use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::Arc;

use tracing::error;
use tracing::warn;

use crate::ConvertError;
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

type ConvertResult<T> = std::result::Result<T, ConvertError>;

pub type KeyConverter<K, A> = Arc<dyn Fn(&K) -> ConvertResult<A> + Send + Sync>;
pub type ValueConverter<V, B> = Arc<dyn Fn(Option<&V>) -> ConvertResult<Option<B>> + Send + Sync>;
pub type ResponseConverter<B, V> = Arc<dyn Fn(Response<B>) -> ConvertResult<Response<V>> + Send + Sync>;

/// Exposes a `(A, B)` source as a `(K, V)` property.
///
/// All work happens while rearranging and in response handlers; a failed
/// conversion answers the caller with a failed response and nothing is
/// forwarded.
pub struct ConverterProperty<K, V, A, B>
where
    K: RequestKey,
    V: PropertyValue,
    A: RequestKey,
    B: PropertyValue,
{
    name: String,
    source: PropertyRef<A, B>,
    key_converter: KeyConverter<K, A>,
    value_converter: ValueConverter<V, B>,
    response_converter: ResponseConverter<B, V>,
    _marker: PhantomData<fn(K, V)>,
}

/// Source request id -> caller request id.
#[derive(Debug, Default)]
pub struct ConverterModel {
    forwarded: HashMap<RequestId, RequestId>,
}

impl ConverterModel {
    #[cfg(test)]
    pub(crate) fn in_flight(&self) -> usize {
        self.forwarded.len()
    }
}

impl<K, V, A, B> ConverterProperty<K, V, A, B>
where
    K: RequestKey,
    V: PropertyValue,
    A: RequestKey,
    B: PropertyValue,
{
    pub fn new<KF, VF, RF>(
        name: impl Into<String>,
        source: PropertyRef<A, B>,
        key_converter: KF,
        value_converter: VF,
        response_converter: RF,
    ) -> Self
    where
        KF: Fn(&K) -> ConvertResult<A> + Send + Sync + 'static,
        VF: Fn(Option<&V>) -> ConvertResult<Option<B>> + Send + Sync + 'static,
        RF: Fn(Response<B>) -> ConvertResult<Response<V>> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            source,
            key_converter: Arc::new(key_converter),
            value_converter: Arc::new(value_converter),
            response_converter: Arc::new(response_converter),
            _marker: PhantomData,
        }
    }

    /// Converter built from infallible mappings in both directions.
    pub fn mapped<KF, TF, FF>(
        name: impl Into<String>,
        source: PropertyRef<A, B>,
        key_fn: KF,
        to_source: TF,
        from_source: FF,
    ) -> Self
    where
        KF: Fn(&K) -> A + Send + Sync + 'static,
        TF: Fn(&V) -> B + Send + Sync + 'static,
        FF: Fn(B) -> V + Send + Sync + 'static,
    {
        Self::new(
            name,
            source,
            move |key: &K| Ok(key_fn(key)),
            move |value: Option<&V>| Ok(value.map(&to_source)),
            move |response: Response<B>| Ok(response.map_value(&from_source)),
        )
    }

    fn on_response(
        ctx: &mut PropertyContext<'_, Self>,
        id: RequestId,
        response: Response<B>,
    ) {
        let Some(origin) = ctx.model_mut().forwarded.remove(&id) else {
            error!("{}: response {} matches no forwarded request", ctx.property().name, id);
            return;
        };
        let converted = match (ctx.property().response_converter)(response) {
            Ok(converted) => converted,
            Err(e) => {
                warn!("{}: {}", ctx.property().name, e);
                Response::failed_with(e.to_string())
            }
        };
        let _ = ctx.respond(origin, converted);
    }
}

impl<K, V, A, B> Property for ConverterProperty<K, V, A, B>
where
    K: RequestKey,
    V: PropertyValue,
    A: RequestKey,
    B: PropertyValue,
{
    type Key = K;
    type Value = V;
    type Model = ConverterModel;

    fn create_model(&self) -> Self::Model {
        ConverterModel::default()
    }

    fn lock_resource(
        &self,
        key: &K,
        lock_type: LockType,
    ) -> LockResource {
        match (self.key_converter)(key) {
            Ok(source_key) => self.source.lock_resource(&source_key, lock_type),
            // Unconvertible keys fail on arrival; lock them locally.
            Err(_) => LockResource::path([self.name.clone(), key.key_string().into_owned()], lock_type),
        }
    }

    fn rearrange_requests(
        &self,
        ctx: &mut PropertyContext<'_, Self>,
    ) {
        for request in ctx.new_requests().to_vec() {
            let converted = (self.key_converter)(request.key()).and_then(|key| {
                let value = (self.value_converter)(request.value())?;
                Ok(request.content().with_key_and_value(key, value))
            });
            let content = match converted {
                Ok(content) => content,
                Err(e) => {
                    warn!("{}: {} for request {}", self.name, e, request.id());
                    let _ = ctx.respond(request.id(), Response::failed_with(e.to_string()));
                    continue;
                }
            };
            match ctx.request(&self.source, content, Self::on_response) {
                Ok(source_id) => {
                    ctx.model_mut().forwarded.insert(source_id, request.id());
                }
                Err(e) => {
                    warn!("{}: forward of {} failed: {}", self.name, request.id(), e);
                    let _ = ctx.respond(request.id(), Response::failed());
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
