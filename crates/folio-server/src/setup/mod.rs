//! Application setup and initialization

pub mod database;
pub mod server;

use anyhow::Result;
use folio_core::QueueConfig;
use folio_infra::{init_telemetry, LogFormat};
use folio_worker::{
    builtin_handlers, HandlerRegistry, NoopNotifier, StatusNotifier, TaskQueueManager,
    WebhookNotifier,
};
use std::sync::Arc;

/// Initialize the entire application
pub async fn initialize_app(config: &QueueConfig) -> Result<Arc<TaskQueueManager>> {
    init_telemetry(LogFormat::for_environment(&config.environment))
        .map_err(|e| anyhow::anyhow!("Failed to initialize telemetry: {}", e))?;

    tracing::info!(config = ?config, "Configuration loaded and validated successfully");

    let store = database::setup_store(config).await?;
    let notifier = setup_notifier(config)?;
    let registry = Arc::new(HandlerRegistry::from_factories(builtin_handlers()));
    tracing::info!(handlers = ?registry.task_names(), "Task handlers registered");

    let manager = Arc::new(TaskQueueManager::new(store, notifier));
    if !manager
        .initialize(config, registry, config.queue_workers)
        .await
    {
        anyhow::bail!("Task queue failed to start");
    }

    Ok(manager)
}

fn setup_notifier(config: &QueueConfig) -> Result<Arc<dyn StatusNotifier>> {
    match &config.notify_url {
        Some(url) => {
            tracing::info!(url = %url, "Status notifications enabled");
            Ok(Arc::new(WebhookNotifier::new(
                url.clone(),
                config.notify_timeout_seconds,
            )?))
        }
        None => Ok(Arc::new(NoopNotifier)),
    }
}
