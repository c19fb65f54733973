//! `devmand` - device manager daemon entry point.
//!
//! Wires the pieces together:
//!
//! 1. Load and validate [`Settings`] (`devman.toml` or the path given as
//!    the first argument), install tracing.
//! 2. Build the [`StaticTypeRegistry`] from the configured device types
//!    and the [`DeviceManager`] on top of it - with a file-backed
//!    key-value factory when `offline.persist_dir` is set, so persisted
//!    device types survive restarts.
//! 3. Spawn the manager event loop and serve the REST control surface
//!    until Ctrl-C.
//!
//! Bus transports are platform glue: embedders link this crate as a
//! library and register their transports with
//! [`DeviceManager::add_bus`] before spawning the loop. The bare daemon
//! starts with no buses and logs a reminder.

use anyhow::{Context, Result};
use devman_bus::{DeviceManager, KvFactory};
use devman_storage::{FileKvStore, KvStore};
use rust_devman::{logging, Settings, StaticTypeRegistry};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    let config_path = std::env::args().nth(1);
    let settings = Settings::new(config_path.as_deref())?;
    logging::init(&settings)?;

    info!(
        device_types = settings.device_types.len(),
        bind_addr = %settings.server.bind_addr,
        "devmand starting"
    );

    let types = Arc::new(StaticTypeRegistry::new(settings.device_types.clone()));
    let kv_factory: Option<KvFactory> = settings.offline.persist_dir.clone().map(|dir| {
        Box::new(move |namespace: &str| {
            FileKvStore::open(dir.join(namespace)).map(|kv| Arc::new(kv) as Arc<dyn KvStore>)
        }) as KvFactory
    });
    let manager = Arc::new(DeviceManager::with_kv_factory(
        types,
        settings.offline_settings(),
        kv_factory,
    ));

    if manager.buses().is_empty() {
        warn!("no bus transports registered; running with control surface only");
    }

    let loop_task = tokio::spawn(
        manager
            .clone()
            .run(Duration::from_millis(settings.tick_interval_ms)),
    );

    let app = devman_server::router(manager.clone());
    let listener = tokio::net::TcpListener::bind(&settings.server.bind_addr)
        .await
        .with_context(|| format!("Failed to bind {}", settings.server.bind_addr))?;
    info!(addr = %settings.server.bind_addr, "REST control surface listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown requested");
        })
        .await
        .context("REST server failed")?;

    loop_task.abort();
    Ok(())
}
