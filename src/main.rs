use std::sync::Arc;

use tokio::sync::broadcast::error::RecvError;
use tracing::info;

use gatehouse::config::Settings;
use gatehouse::engine::Engine;
use gatehouse::maintenance;
use gatehouse::notify::NotifyHub;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let settings = Settings::from_env()?;
    gatehouse::observability::init(settings.metrics_port)?;
    let options = settings.engine_options()?;

    // Ensure data directory exists
    std::fs::create_dir_all(&settings.data_dir)?;

    let notify = Arc::new(NotifyHub::new());
    spawn_delivery_log(&notify);
    let engine = Arc::new(Engine::new(settings.journal_path(), notify, options)?);

    info!("gatehouse started");
    info!("  data_dir: {}", settings.data_dir.display());
    info!("  utc offset: {}", settings.utc_offset);
    info!("  nightly run: {:02}:00", settings.nightly_hour);
    info!("  daily summary: {:02}:00", settings.rso_summary_hour);
    info!(
        "  metrics: {}",
        settings
            .metrics_port
            .map_or("disabled".to_string(), |p| format!("http://0.0.0.0:{p}/metrics"))
    );

    let nightly = tokio::spawn(maintenance::run_nightly_scheduler(
        engine.clone(),
        settings.nightly_hour,
        settings.compact_threshold,
    ));
    let summary = tokio::spawn(maintenance::run_summary_scheduler(
        engine.clone(),
        settings.rso_summary_hour,
    ));
    let compactor = tokio::spawn(maintenance::run_compactor(
        engine.clone(),
        settings.compact_threshold,
    ));

    wait_for_shutdown().await?;
    info!("shutdown signal received, stopping schedulers");
    nightly.abort();
    summary.abort();
    compactor.abort();

    if let Err(e) = engine.compact_journal().await {
        tracing::warn!("final compaction skipped: {e}");
    }
    info!("gatehouse stopped");
    Ok(())
}

async fn wait_for_shutdown() -> std::io::Result<()> {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
        tokio::select! {
            r = ctrl_c => r?,
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await?;
    }
    Ok(())
}

/// Log emitted notifications and audit entries; delivery happens elsewhere.
fn spawn_delivery_log(notify: &NotifyHub) {
    let mut notifications = notify.subscribe_notifications();
    tokio::spawn(async move {
        loop {
            match notifications.recv().await {
                Ok(n) => info!(
                    "notification {} to {}",
                    n.template.key(),
                    n.recipients.join(", ")
                ),
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!("notification log lagged, {skipped} skipped")
                }
                Err(RecvError::Closed) => break,
            }
        }
    });

    let mut audit = notify.subscribe_audit();
    tokio::spawn(async move {
        loop {
            match audit.recv().await {
                Ok(e) => info!(
                    "audit {} {} {} by {}: {}",
                    e.action.as_str(),
                    e.target_type,
                    e.target_id,
                    e.actor,
                    e.details
                ),
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!("audit log lagged, {skipped} skipped")
                }
                Err(RecvError::Closed) => break,
            }
        }
    });
}
