use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use tokio::fs::{self, OpenOptions};
use tracing::{debug, warn};

use crate::errors::{CoreError, Result};

pub const HEALTH_MARKER: &str = ".service_is_healthy";

pub fn hold_marker_path(backup_dir: &Path, container: &str) -> PathBuf {
    backup_dir.join(format!(".{container}.hold"))
}

/// Zero-length file whose presence means autosave may still be paused for a container.
#[derive(Debug, Clone)]
pub struct HoldMarker {
    container: String,
    path: PathBuf,
}

impl HoldMarker {
    pub fn new(backup_dir: &Path, container: &str) -> Self {
        Self {
            container: container.to_string(),
            path: hold_marker_path(backup_dir, container),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn exists(&self) -> Result<bool> {
        fs::try_exists(&self.path)
            .await
            .map_err(|err| CoreError::io(format!("checking {}", self.path.display()), err))
    }

    /// Creates the marker. Acquiring an existing marker is a no-op.
    pub async fn acquire(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|err| CoreError::io(format!("creating {}", parent.display()), err))?;
        }
        OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(&self.path)
            .await
            .map_err(|err| CoreError::io(format!("creating {}", self.path.display()), err))?;
        debug!(container = %self.container, path = %self.path.display(), "hold marker created");
        Ok(())
    }

    pub async fn release(&self) -> Result<()> {
        match fs::remove_file(&self.path).await {
            Ok(()) => {
                debug!(container = %self.container, "hold marker removed");
                Ok(())
            }
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(CoreError::io(
                format!("removing {}", self.path.display()),
                err,
            )),
        }
    }

    /// Removal used on failure paths, where the original error matters more.
    pub async fn release_best_effort(&self) {
        if let Err(err) = self.release().await {
            warn!(container = %self.container, "failed to remove hold marker: {err}");
        }
    }
}

/// The file's existence is the health signal read by external probes.
#[derive(Debug, Clone)]
pub struct HealthMarker {
    path: PathBuf,
}

impl HealthMarker {
    pub fn new(backup_dir: &Path) -> Self {
        Self {
            path: backup_dir.join(HEALTH_MARKER),
        }
    }

    pub async fn mark_healthy(&self) -> Result<()> {
        fs::write(&self.path, b"")
            .await
            .map_err(|err| CoreError::io(format!("writing {}", self.path.display()), err))
    }

    pub async fn mark_unhealthy(&self) -> Result<()> {
        match fs::remove_file(&self.path).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(CoreError::io(
                format!("removing {}", self.path.display()),
                err,
            )),
        }
    }

    pub async fn is_healthy(&self) -> bool {
        fs::try_exists(&self.path).await.unwrap_or(false)
    }
}
