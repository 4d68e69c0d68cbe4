use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Local};
use regex::Regex;
use tokio::sync::{Mutex as AsyncMutex, broadcast::error::RecvError, mpsc};
use tokio::task::JoinHandle;
use tracing::{Instrument, debug, error, info, info_span, warn};

use worldsaver_core::naming::extras_name;
use worldsaver_core::{ConnectionSpec, ContainerSpec, CoreError, HoldMarker, Result};
use worldsaver_rcon::RconClient;
use worldsaver_terminal::channel::{DockerChannel, DockerControl, RconChannel, SshChannel};
use worldsaver_terminal::{ContainerTerminal, HostKeyStore, ProcessControl, TerminalChannel};

use super::presence::{PlayerEvent, PresenceKind, PresenceParser};
use crate::archive::WorldSnapshot;

/// Shared resources needed to open any container's channel.
#[derive(Clone)]
pub struct ChannelFactory {
    pub docker_path: PathBuf,
    pub known_hosts: Arc<Mutex<HostKeyStore>>,
}

impl ChannelFactory {
    pub fn open(
        &self,
        spec: &ContainerSpec,
    ) -> (Box<dyn TerminalChannel>, Option<Arc<dyn ProcessControl>>) {
        match &spec.connection {
            ConnectionSpec::Docker { container } => {
                let channel: Box<dyn TerminalChannel> =
                    Box::new(DockerChannel::new(self.docker_path.clone(), container.clone()));
                let control: Arc<dyn ProcessControl> =
                    Arc::new(DockerControl::new(self.docker_path.clone(), container.clone()));
                (channel, Some(control))
            }
            ConnectionSpec::Rcon(rcon) => {
                let client = RconClient::new(rcon.endpoint.to_string(), rcon.password.clone());
                let channel: Box<dyn TerminalChannel> = Box::new(RconChannel::new(client));
                (channel, None)
            }
            ConnectionSpec::Ssh {
                endpoint,
                username,
                password,
            } => {
                let channel: Box<dyn TerminalChannel> = Box::new(SshChannel::new(
                    endpoint.clone(),
                    username.clone(),
                    password.clone(),
                    self.known_hosts.clone(),
                ));
                (channel, None)
            }
        }
    }
}

/// One container's console, runtime state and backup unit of work.
pub struct ContainerConnection {
    spec: ContainerSpec,
    terminal: AsyncMutex<ContainerTerminal>,
    process: Option<Arc<dyn ProcessControl>>,
    rcon: Option<RconClient>,
    snapshot: Arc<dyn WorldSnapshot>,
    running: AtomicBool,
    player_count: Arc<AtomicUsize>,
    last_backup: Mutex<Option<DateTime<Local>>>,
    presence: Mutex<Option<JoinHandle<()>>>,
}

impl ContainerConnection {
    pub fn new(
        spec: ContainerSpec,
        terminal: ContainerTerminal,
        process: Option<Arc<dyn ProcessControl>>,
        snapshot: Arc<dyn WorldSnapshot>,
    ) -> Self {
        let rcon = spec
            .rcon
            .as_ref()
            .map(|rcon| RconClient::new(rcon.endpoint.to_string(), rcon.password.clone()));
        Self {
            spec,
            terminal: AsyncMutex::new(terminal),
            process,
            rcon,
            snapshot,
            running: AtomicBool::new(false),
            player_count: Arc::new(AtomicUsize::new(0)),
            last_backup: Mutex::new(None),
            presence: Mutex::new(None),
        }
    }

    pub fn from_spec(
        spec: ContainerSpec,
        channels: &ChannelFactory,
        snapshot: Arc<dyn WorldSnapshot>,
    ) -> Self {
        let (channel, process) = channels.open(&spec);
        let terminal = ContainerTerminal::new(spec.kind, channel);
        Self::new(spec, terminal, process, snapshot)
    }

    pub fn name(&self) -> &str {
        &self.spec.name
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn player_count(&self) -> usize {
        self.player_count.load(Ordering::SeqCst)
    }

    pub fn last_backup(&self) -> Option<DateTime<Local>> {
        *self
            .last_backup
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn set_last_backup(&self, at: DateTime<Local>) {
        *self
            .last_backup
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(at);
    }

    /// Attaches to the console. With `events`, player logins and logouts are
    /// tracked and forwarded.
    pub async fn start(&self, events: Option<mpsc::Sender<PlayerEvent>>) -> Result<()> {
        let mut terminal = self.terminal.lock().await;
        terminal.channel_mut().start().await?;
        self.running.store(true, Ordering::SeqCst);
        info!(container = %self.spec.name, channel = %terminal.channel().describe(), "console connected");

        if let Some(events) = events {
            let output = terminal.channel().subscribe();
            let parser = PresenceParser::new(self.spec.kind)?;
            let listener = tokio::spawn(
                listen_for_players(
                    output,
                    parser,
                    self.spec.name.clone(),
                    self.player_count.clone(),
                    events,
                )
                .instrument(info_span!("presence", container = %self.spec.name)),
            );
            let previous = self
                .presence
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .replace(listener);
            if let Some(previous) = previous {
                previous.abort();
            }
        }
        drop(terminal);

        self.sync_player_count().await;
        Ok(())
    }

    pub async fn stop(&self) -> Result<()> {
        if let Some(listener) = self
            .presence
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            listener.abort();
        }
        self.running.store(false, Ordering::SeqCst);
        self.terminal.lock().await.channel_mut().close().await
    }

    pub async fn reset(&self) -> Result<()> {
        let mut terminal = self.terminal.lock().await;
        let result = terminal.channel_mut().reset().await;
        self.running
            .store(terminal.channel().is_connected(), Ordering::SeqCst);
        result
    }

    /// Seeds the player count from the RCON side-channel, when one is configured.
    async fn sync_player_count(&self) {
        let Some(rcon) = &self.rcon else {
            return;
        };
        match rcon.execute("list").await {
            Ok(body) => {
                if let Some(count) = parse_player_list(&body) {
                    self.player_count.store(count, Ordering::SeqCst);
                    debug!(container = %self.spec.name, count, "player count synced over rcon");
                }
            }
            Err(err) => warn!(container = %self.spec.name, "rcon player list failed: {err}"),
        }
    }

    async fn ensure_connected(&self, terminal: &mut ContainerTerminal) -> Result<()> {
        if terminal.channel().is_connected() {
            return Ok(());
        }
        warn!(container = %self.spec.name, "console disconnected, reconnecting once");
        if let Err(err) = terminal.channel_mut().reset().await {
            if err.is_fatal() {
                return Err(err);
            }
            warn!(container = %self.spec.name, "reconnect failed: {err}");
        }
        let connected = terminal.channel().is_connected();
        self.running.store(connected, Ordering::SeqCst);
        if connected {
            Ok(())
        } else {
            Err(CoreError::ProcessNotRunning)
        }
    }

    /// Pauses autosave, snapshots every world and the extras, then resumes.
    ///
    /// Snapshot failures do not stop the remaining worlds; they are reported
    /// together as `BackupsFailed` once autosave is resumed.
    pub async fn run_backup(&self, destination: &Path) -> Result<()> {
        let mut terminal = self.terminal.lock().await;
        self.ensure_connected(&mut terminal).await?;

        let hold = HoldMarker::new(destination, &self.spec.name);
        hold.acquire().await?;

        if let Err(err) = terminal.pause_autosave().await {
            error!(container = %self.spec.name, "failed to pause autosave: {err}");
            hold.release_best_effort().await;
            return Err(err);
        }

        let mut failures = Vec::new();
        for world in &self.spec.worlds {
            match self
                .snapshot
                .snapshot_world(&self.spec.name, world, self.spec.kind, destination)
                .await
            {
                Ok(path) => info!(container = %self.spec.name, path = %path.display(), "world backed up"),
                Err(err) => {
                    error!(container = %self.spec.name, world = %world.display(), "world backup failed: {err}");
                    failures.push(world_label(world));
                }
            }
        }

        if !self.spec.extras.is_empty() {
            match self
                .snapshot
                .archive_extras(&self.spec.name, &self.spec.extras, destination)
                .await
            {
                Ok(path) => info!(container = %self.spec.name, path = %path.display(), "extras backed up"),
                Err(err) => {
                    error!(container = %self.spec.name, "extras backup failed: {err}");
                    failures.push(extras_name(&self.spec.name));
                }
            }
        }

        self.set_last_backup(Local::now());

        if let Err(err) = terminal.resume_autosave().await {
            // the marker stays so the next startup repairs autosave
            error!(container = %self.spec.name, "failed to resume autosave: {err}");
            return Err(err);
        }
        hold.release().await?;

        if failures.is_empty() {
            Ok(())
        } else {
            Err(CoreError::BackupsFailed(failures))
        }
    }

    /// Repairs autosave left paused by a backup that never finished.
    pub async fn cleanup_incomplete_backup(&self, destination: &Path) -> Result<()> {
        let hold = HoldMarker::new(destination, &self.spec.name);
        if !hold.exists().await? {
            return Err(CoreError::NoHoldMarker(self.spec.name.clone()));
        }

        let mut terminal = self.terminal.lock().await;
        self.ensure_connected(&mut terminal).await?;
        terminal.resume_autosave().await?;
        hold.release().await?;
        info!(container = %self.spec.name, "recovered from an incomplete backup");
        Ok(())
    }

    pub async fn has_hold_marker(&self, destination: &Path) -> Result<bool> {
        HoldMarker::new(destination, &self.spec.name).exists().await
    }

    /// Remote transports cannot see the process and report it as running;
    /// reconnecting the console is what decides there.
    pub async fn process_running(&self) -> Result<bool> {
        match &self.process {
            Some(process) => process.is_running().await,
            None => Ok(true),
        }
    }

    pub async fn start_process(&self) -> Result<()> {
        match &self.process {
            Some(process) => process.start().await,
            None => Err(CoreError::UnsupportedChannel(format!(
                "{} cannot start its process",
                self.spec.connection.channel_type()
            ))),
        }
    }

    pub async fn stop_process(&self) -> Result<()> {
        match &self.process {
            Some(process) => process.stop().await,
            None => Err(CoreError::UnsupportedChannel(format!(
                "{} cannot stop its process",
                self.spec.connection.channel_type()
            ))),
        }
    }
}

fn world_label(world: &Path) -> String {
    world
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| world.display().to_string())
}

/// `There are 3 of a max of 20 players online: ...`
fn parse_player_list(body: &str) -> Option<usize> {
    let regex = Regex::new(r"(?i)there are (\d+)").ok()?;
    regex.captures(body)?.get(1)?.as_str().parse().ok()
}

async fn listen_for_players(
    mut output: tokio::sync::broadcast::Receiver<String>,
    parser: PresenceParser,
    container: String,
    player_count: Arc<AtomicUsize>,
    events: mpsc::Sender<PlayerEvent>,
) {
    let mut pending = String::new();
    loop {
        let chunk = match output.recv().await {
            Ok(chunk) => chunk,
            Err(RecvError::Lagged(skipped)) => {
                warn!(skipped, "console output overflowed, player count may drift");
                continue;
            }
            Err(RecvError::Closed) => break,
        };
        pending.push_str(&chunk);

        let Some(newline) = pending.rfind('\n') else {
            continue;
        };
        let complete: String = pending.drain(..=newline).collect();
        for line in complete.lines() {
            let Some((kind, player)) = parser.parse_line(line) else {
                continue;
            };
            let count = match kind {
                PresenceKind::Login => player_count.fetch_add(1, Ordering::SeqCst) + 1,
                PresenceKind::Logout => {
                    let previous = player_count
                        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |count| {
                            Some(count.saturating_sub(1))
                        })
                        .unwrap_or(0);
                    previous.saturating_sub(1)
                }
            };
            match kind {
                PresenceKind::Login => info!(%player, count, "player joined"),
                PresenceKind::Logout => info!(%player, count, "player left"),
            }
            let event = PlayerEvent {
                container: container.clone(),
                kind,
                player,
            };
            if events.send(event).await.is_err() {
                debug!("player event receiver closed");
                return;
            }
        }
    }
}
