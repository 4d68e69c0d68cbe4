use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use chrono::Local;

use worldsaver_core::RetentionPolicy;
use worldsaver_core::retention::trim_directory;

pub async fn exec(dir: PathBuf, policy: RetentionPolicy, dry_run: bool) -> Result<()> {
    let report = trim_directory(&dir, &policy, Local::now(), dry_run)
        .await
        .with_context(|| format!("Failed to trim {}", dir.display()))?;

    let verb = if dry_run { "Would trim" } else { "Trimmed" };
    println!(
        "{verb} {} backup(s), kept {}",
        report.trimmed, report.kept
    );
    if report.failed > 0 {
        bail!("{} backup(s) could not be deleted", report.failed);
    }
    Ok(())
}
