use std::sync::Arc;

use crate::BrokerConfig;
use crate::ExternalRequest;
use crate::PropertyRef;
use crate::PropertyServer;
use crate::PropertyValue;
use crate::RequestKey;

static LOGGER_INIT: once_cell::sync::Lazy<()> = once_cell::sync::Lazy::new(|| {
    let _ = env_logger::builder().is_test(true).try_init();
});

pub fn enable_logger() {
    *LOGGER_INIT;
    println!("setup logger for unit test.");
}

/// Non-strict server named `name` on the current runtime.
pub(crate) fn test_server(name: &str) -> PropertyServer {
    PropertyServer::new(BrokerConfig::named(name)).expect("server should start")
}

/// Server that panics on protocol violations.
pub(crate) fn strict_test_server(name: &str) -> PropertyServer {
    let mut config = BrokerConfig::named(name);
    config.server.strict_protocol = true;
    PropertyServer::new(config).expect("server should start")
}

pub(crate) fn as_ref<P>(property: &Arc<P>) -> PropertyRef<P::Key, P::Value>
where
    P: crate::Property,
{
    property.clone()
}

/// Reads `key` through `server` and returns the value, panicking on failure.
pub(crate) async fn read_value<K: RequestKey, V: PropertyValue>(
    server: &PropertyServer,
    property: &PropertyRef<K, V>,
    key: K,
) -> Option<V> {
    let response = server
        .request_one(ExternalRequest::read(property, key))
        .await
        .expect("server should answer");
    assert!(response.is_successful(), "read failed: {:?}", response.message());
    response.into_value()
}
