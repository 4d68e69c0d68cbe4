use anyhow::{Context, Result};
use tokio::sync::mpsc;
use tracing::{info, warn};

use worldsaver_core::HealthMarker;

use super::{Setup, disconnect};
use crate::backup::run_service;
use crate::lock::acquire_lock;

const EVENT_CAPACITY: usize = 64;

pub async fn exec(setup: Setup) -> Result<()> {
    let _lock = acquire_lock(&setup.backup_dir).with_context(|| {
        format!(
            "Another worldsaver service already owns {}",
            setup.backup_dir.display()
        )
    })?;

    HealthMarker::new(&setup.backup_dir)
        .mark_healthy()
        .await
        .context("Failed to write the health marker")?;

    let schedule = setup.config.schedule.resolve()?;
    let (tx, rx) = mpsc::channel(EVENT_CAPACITY);
    let wants_events = schedule.on_player_login || schedule.on_player_logout;
    let actor = setup.connect(wants_events.then_some(tx)).await?;

    let failures = actor.cleanup_containers().await;
    if failures > 0 {
        warn!(failures, "some containers could not be recovered");
    }

    info!(backup_dir = %setup.backup_dir.display(), "backup service running");
    let result = run_service(actor.clone(), schedule, rx, shutdown_signal()).await;
    disconnect(&actor).await;
    result
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!("failed to listen for Ctrl-C: {err}");
        std::future::pending::<()>().await;
    }
}
