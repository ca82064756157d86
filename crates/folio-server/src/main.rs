mod setup;

use folio_core::QueueConfig;

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    // Load configuration
    let config = QueueConfig::from_env()?;

    // Start telemetry, the envelope store and the task queue
    let manager = crate::setup::initialize_app(&config).await?;

    // Run until Ctrl+C / SIGTERM, then stop the queue
    crate::setup::server::run_until_shutdown(&manager).await;

    Ok(())
}
