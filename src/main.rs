use std::path::Path;
use std::sync::Arc;

use autoproperty::BrokerConfig;
use autoproperty::ConverterProperty;
use autoproperty::MapSourceProperty;
use autoproperty::MemoryCacheProperty;
use autoproperty::PropertyRef;
use autoproperty::PropertyServer;
use autoproperty::Result;
use autoproperty::SimplePropertyOperator;
use futures::future::join_all;
use tokio::signal::unix::signal;
use tokio::signal::unix::SignalKind;
use tracing::error;
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::Layer;

#[tokio::main(flavor = "multi_thread", worker_threads = 2)]
async fn main() -> Result<()> {
    let settings = BrokerConfig::new()?.validate()?;

    // Initializing Logs
    let _guard = init_observability(std::env::var("LOG_DIR").ok().as_deref());

    let server = PropertyServer::new(settings)?;

    // settings store: u32 id -> stored text, exposed as "key" -> i64
    let store = Arc::new(MapSourceProperty::with_values(
        "settings-store",
        [(1u32, "10".to_string()), (2u32, "20".to_string())],
    ));
    let store_ref: PropertyRef<u32, String> = store.clone();
    let cache: PropertyRef<u32, String> = Arc::new(MemoryCacheProperty::new("settings-cache", store_ref));
    let view: PropertyRef<String, i64> = Arc::new(ConverterProperty::new(
        "settings-view",
        cache,
        |key: &String| {
            key.parse::<u32>()
                .map_err(|e| autoproperty::ConvertError::Key(e.to_string()))
        },
        |value: Option<&i64>| Ok(value.map(|v| v.to_string())),
        |response: autoproperty::Response<String>| {
            let parsed = response.value().map(|text| text.parse::<i64>()).transpose();
            match parsed {
                Ok(value) => Ok(response.with_value(value)),
                Err(e) => Err(autoproperty::ConvertError::Value(e.to_string())),
            }
        },
    ));

    let operator = SimplePropertyOperator::new(server.clone(), view)?;
    info!("write 2 = {}", operator.write("2".to_string(), 42, None).await?);

    let keys = ["1", "2", "x"];
    let reads = join_all(keys.iter().map(|key| operator.read(key.to_string()))).await;
    for (key, value) in keys.iter().zip(reads) {
        info!("read {} = {:?}", key, value?);
    }
    info!("local 2 = {:?}", operator.local_read(&"2".to_string()));
    info!("store served {} reads, {} writes", store.stats().reads(), store.stats().writes());

    info!("Application started. Waiting for CTRL+C signal...");
    if let Err(e) = wait_for_shutdown().await {
        error!("Failed to listen for shutdown: {:?}", e);
    }

    server.shutdown().await?;
    info!("{}", autoproperty::metrics_text());
    println!("Exiting program.");
    Ok(())
}

async fn wait_for_shutdown() -> std::io::Result<()> {
    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;
    tokio::select! {
        _ = sigint.recv() => {
            info!("SIGINT detected.");
        },
        _ = sigterm.recv() => {
            info!("SIGTERM detected.");
        },
        _ = tokio::signal::ctrl_c() => {
            info!("Ctrl+C detected.");
        },
    }
    Ok(())
}

/// Logs to stdout, or to `<log_dir>/autoproperty.log` when a directory is
/// given. Filtering follows `RUST_LOG`.
pub fn init_observability(log_dir: Option<&str>) -> Option<WorkerGuard> {
    match log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::never(Path::new(dir), "autoproperty.log");
            let (non_blocking, guard) = tracing_appender::non_blocking(appender);
            let layer = tracing_subscriber::fmt::layer()
                .with_writer(non_blocking)
                .with_filter(EnvFilter::from_default_env());
            tracing_subscriber::registry().with(layer).init();
            Some(guard)
        }
        None => {
            let layer = tracing_subscriber::fmt::layer().with_filter(EnvFilter::from_default_env());
            tracing_subscriber::registry().with(layer).init();
            None
        }
    }
}
