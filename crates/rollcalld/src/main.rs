use anyhow::{bail, Result};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

mod config;
mod dbus_interface;
mod engine;
mod extractor;
mod service;
mod store;
mod worker;

use dbus_interface::{AttendanceBus, BUS_NAME, OBJECT_PATH};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!("rollcalld starting");

    let config = config::Config::load()?;
    if config.extractor_command.is_empty() {
        bail!("no extractor configured: set ROLLCALL_EXTRACTOR or extractor_command");
    }
    tracing::info!(
        extractor = %config.extractor_command,
        db = %config.db_path.display(),
        threshold = config.similarity_threshold,
        deadline_secs = config.session_deadline_secs,
        "configuration loaded"
    );

    let extractor = extractor::ProcessExtractor::new(
        &config.extractor_command,
        config.extractor_args.clone(),
        config.extractor_timeout(),
    );
    let engine = engine::spawn_engine(extractor, config.low_light())?;
    let store = store::FaceStore::open(&config.db_path).await?;

    let system_bus = config.system_bus;
    let service = Arc::new(service::AttendanceService::new(config, engine, store));

    let builder = if system_bus {
        zbus::connection::Builder::system()?
    } else {
        zbus::connection::Builder::session()?
    };
    let _connection = builder
        .name(BUS_NAME)?
        .serve_at(OBJECT_PATH, AttendanceBus::new(service))?
        .build()
        .await?;

    tracing::info!(bus = BUS_NAME, system_bus, "rollcalld ready");

    // Keep running until signaled
    tokio::signal::ctrl_c().await?;
    tracing::info!("rollcalld shutting down");

    Ok(())
}
