pub mod backup;
pub mod backupjob;
pub mod pack;
pub mod trim;
pub mod unpack;

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result, bail};
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use worldsaver_terminal::HostKeyStore;

use crate::archive::ZipSnapshot;
use crate::backup::{BackupActor, ChannelFactory, ContainerConnection, PlayerEvent};
use crate::config::{ServiceConfig, default_known_hosts_path, load_config};

/// Everything a backup command needs: the parsed config and where artifacts go.
pub struct Setup {
    pub config: ServiceConfig,
    pub backup_dir: PathBuf,
}

impl Setup {
    pub fn load(config_path: Option<&Path>, backup_path: Option<PathBuf>) -> Result<Self> {
        let Some(config_path) = config_path else {
            bail!("No config file given; pass --config or set WORLDSAVER_CONFIG");
        };
        let config = load_config(config_path)?;
        let backup_dir = backup_path
            .or_else(|| config.backup_path.clone())
            .context("No backup path configured; set backupPath or pass --backup-path")?;
        Ok(Self { config, backup_dir })
    }

    /// Connects every valid container and wraps them in an actor. Containers that
    /// fail to connect stay in the fleet; their backups retry the connection.
    pub async fn connect(&self, events: Option<mpsc::Sender<PlayerEvent>>) -> Result<BackupActor> {
        let known_hosts_path = match &self.config.known_hosts_path {
            Some(path) => path.clone(),
            None => default_known_hosts_path()?,
        };
        let known_hosts = HostKeyStore::load(&known_hosts_path)?;
        let channels = ChannelFactory {
            docker_path: self.config.docker_path(),
            known_hosts: Arc::new(Mutex::new(known_hosts)),
        };

        let policy = self.config.trim;
        policy.validate()?;
        let ownership = self.config.ownership.resolve()?;

        let mut connections = Vec::new();
        for spec in self.config.container_specs().await {
            let Ok(spec) = spec else {
                continue;
            };
            let connection =
                ContainerConnection::from_spec(spec, &channels, Arc::new(ZipSnapshot));
            match connection.start(events.clone()).await {
                Ok(()) => {}
                Err(err) if err.is_fatal() => {
                    error!(container = %connection.name(), "refusing to continue: {err}");
                    return Err(err.into());
                }
                Err(err) => {
                    warn!(container = %connection.name(), "failed to connect, will retry on backup: {err}");
                }
            }
            connections.push(Arc::new(connection));
        }

        if connections.is_empty() {
            bail!("No usable containers in the configuration");
        }
        info!(containers = connections.len(), "containers loaded");

        Ok(BackupActor::new(
            connections,
            self.backup_dir.clone(),
            policy,
            ownership,
        ))
    }
}

pub async fn disconnect(actor: &BackupActor) {
    for connection in actor.containers() {
        if let Err(err) = connection.stop().await {
            warn!(container = %connection.name(), "failed to close console: {err}");
        }
    }
}
