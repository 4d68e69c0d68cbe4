use std::path::Path;

use anyhow::{Result, bail};
use tracing::info;

use super::{Setup, disconnect};

pub async fn exec(setup: Setup, container: Option<String>) -> Result<()> {
    let actor = setup.connect(None).await?;
    actor.cleanup_containers().await;

    let outcome = match container.as_deref() {
        Some(name) => actor.backup_container(name).await,
        None => Ok(actor.backup_all(false).await),
    };
    disconnect(&actor).await;
    let outcome = outcome?;

    report(&setup.backup_dir, &outcome.attempted);
    if !outcome.is_success() {
        let failed: Vec<String> = outcome
            .failed
            .iter()
            .map(|(name, reason)| format!("{name} ({reason})"))
            .collect();
        bail!("Backups failed: {}", failed.join(", "));
    }
    Ok(())
}

fn report(backup_dir: &Path, attempted: &[String]) {
    info!(containers = attempted.len(), "backup pass complete");
    println!(
        "Backed up {} container(s) into {}",
        attempted.len(),
        backup_dir.display()
    );
}
