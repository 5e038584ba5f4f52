//! Convenience wrapper for callers that deal with one property.


use std::sync::Arc;

use dashmap::DashMap;
use tracing::debug;

use crate::ExternalRequest;
use crate::PropertyRef;
use crate::PropertyServer;
use crate::PropertyValue;
use crate::RequestKey;
use crate::RequestOption;
use crate::RequestType;
use crate::Result;
use crate::ValueObserver;

type Shadow<K, V> = Arc<DashMap<K, Option<V>>>;

struct ShadowObserver<K: RequestKey, V: PropertyValue> {
    shadow: Shadow<K, V>,
}

impl<K: RequestKey, V: PropertyValue> ValueObserver<K, V> for ShadowObserver<K, V> {
    fn update_value(
        &self,
        key: &K,
        value: Option<V>,
    ) {
        self.shadow.insert(key.clone(), value);
    }
}

/// Reads and writes one property through a server, keeping a local shadow
/// of the last known values.
///
/// The shadow is refreshed by successful reads and by values the property
/// publishes to observers. It is never authoritative.
pub struct SimplePropertyOperator<K: RequestKey, V: PropertyValue> {
    server: PropertyServer,
    property: PropertyRef<K, V>,
    shadow: Shadow<K, V>,
}

impl<K: RequestKey, V: PropertyValue> SimplePropertyOperator<K, V> {
    /// Registers the shadow as an observer of `property`.
    pub fn new(
        server: PropertyServer,
        property: PropertyRef<K, V>,
    ) -> Result<Self> {
        let shadow: Shadow<K, V> = Arc::new(DashMap::new());
        server.register_observer(
            &property,
            Arc::new(ShadowObserver {
                shadow: shadow.clone(),
            }),
        )?;
        Ok(Self {
            server,
            property,
            shadow,
        })
    }

    pub fn property(&self) -> &PropertyRef<K, V> {
        &self.property
    }

    /// Reads `key`. A failed read yields `Ok(None)`; only a stopped server
    /// is an error.
    pub async fn read(
        &self,
        key: K,
    ) -> Result<Option<V>> {
        let response = self
            .server
            .request_one(ExternalRequest::read(&self.property, key.clone()))
            .await?;
        if !response.is_successful() {
            debug!(
                "read of {:?} on {} failed: {:?}",
                key,
                self.property.property_name(),
                response.message()
            );
            return Ok(None);
        }
        let value = response.into_value();
        self.shadow.insert(key, value.clone());
        Ok(value)
    }

    /// Writes `value` to `key`; returns whether the property accepted it.
    pub async fn write(
        &self,
        key: K,
        value: V,
        option: Option<RequestOption>,
    ) -> Result<bool> {
        let request = ExternalRequest::builder(&self.property, key.clone())
            .request_type(RequestType::Modify)
            .value(value)
            .option(option.unwrap_or_default())
            .build();
        let result = self.server.request_one(request).await;
        self.shadow.remove(&key);
        Ok(result?.is_successful())
    }

    /// Last known value of `key`, without asking the server.
    pub fn local_read(
        &self,
        key: &K,
    ) -> Option<V> {
        self.shadow.get(key).and_then(|entry| entry.value().clone())
    }

    /// Overwrites the shadow of `key` without asking the server.
    pub fn local_write(
        &self,
        key: K,
        value: V,
    ) {
        self.shadow.insert(key, Some(value));
    }
}
