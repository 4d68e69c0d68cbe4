use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};

use chrono::Local;
use futures_util::FutureExt;
use futures_util::future::{BoxFuture, Shared};
use tokio::time::Duration;
use tracing::{Instrument, debug, error, info, info_span, warn};

use worldsaver_core::retention::trim_directory;
use worldsaver_core::{CoreError, HealthMarker, Result, RetentionPolicy};

use super::connection::ContainerConnection;
use crate::config::Ownership;
use crate::ownership::apply_ownership;

/// Slack subtracted from the minimum interval so timers firing a little early still back up.
pub const MIN_INTERVAL_SLACK: Duration = Duration::from_secs(60);

/// Result of one pass, shared with every caller that waited on it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PassOutcome {
    pub attempted: Vec<String>,
    pub failed: Vec<(String, String)>,
    pub fatal: Option<String>,
}

impl PassOutcome {
    pub fn is_success(&self) -> bool {
        self.failed.is_empty() && self.fatal.is_none()
    }

    fn record(&mut self, container: &str, result: Result<()>) {
        self.attempted.push(container.to_string());
        if let Err(err) = result {
            error!(container, "backup failed: {err}");
            if err.is_fatal() {
                self.fatal = Some(format!("{container}: {err}"));
            }
            self.failed.push((container.to_string(), err.to_string()));
        }
    }
}

type PassFuture = Shared<BoxFuture<'static, PassOutcome>>;

#[derive(Default)]
struct InFlight {
    next_id: u64,
    single: Option<(String, u64, PassFuture)>,
    full: Option<(u64, PassFuture)>,
}

struct ActorInner {
    containers: Vec<Arc<ContainerConnection>>,
    destination: PathBuf,
    policy: RetentionPolicy,
    ownership: Ownership,
    health: HealthMarker,
    state: Mutex<InFlight>,
}

/// Serializes and deduplicates backup requests.
///
/// The lock only guards the two in-flight slots; backup work itself runs in
/// spawned tasks, so callers waiting on a pass never hold it.
#[derive(Clone)]
pub struct BackupActor {
    inner: Arc<ActorInner>,
}

enum Waiting {
    Covered(PassFuture),
    Other(PassFuture),
}

impl BackupActor {
    pub fn new(
        containers: Vec<Arc<ContainerConnection>>,
        destination: PathBuf,
        policy: RetentionPolicy,
        ownership: Ownership,
    ) -> Self {
        let health = HealthMarker::new(&destination);
        Self {
            inner: Arc::new(ActorInner {
                containers,
                destination,
                policy,
                ownership,
                health,
                state: Mutex::new(InFlight::default()),
            }),
        }
    }

    pub fn containers(&self) -> &[Arc<ContainerConnection>] {
        &self.inner.containers
    }

    pub fn container(&self, name: &str) -> Option<Arc<ContainerConnection>> {
        self.inner
            .containers
            .iter()
            .find(|connection| connection.name() == name)
            .cloned()
    }

    /// Backs up one container, or waits for an in-flight pass that already covers it.
    pub async fn backup_container(&self, name: &str) -> Result<PassOutcome> {
        let connection = self
            .container(name)
            .ok_or_else(|| CoreError::config(format!("unknown container {name}")))?;

        loop {
            let waiting = {
                let mut state = self.lock_state();
                if let Some((_, full)) = &state.full {
                    debug!(container = name, "full pass in flight, waiting for it");
                    Waiting::Covered(full.clone())
                } else if let Some((current, _, single)) = &state.single {
                    if current == name {
                        debug!(container = name, "backup already in flight, joining it");
                        Waiting::Covered(single.clone())
                    } else {
                        debug!(container = name, busy = %current, "another backup in flight, queueing");
                        Waiting::Other(single.clone())
                    }
                } else {
                    let id = state.next_id;
                    state.next_id += 1;
                    let pass = self.spawn_single(id, connection.clone());
                    state.single = Some((name.to_string(), id, pass.clone()));
                    Waiting::Covered(pass)
                }
            };

            match waiting {
                Waiting::Covered(pass) => return Ok(pass.await),
                Waiting::Other(pass) => {
                    pass.await;
                }
            }
        }
    }

    /// Runs one pass over every container. A pass already in flight is joined
    /// instead; a container being backed up on its own right now is skipped.
    pub async fn backup_all(&self, is_daily: bool) -> PassOutcome {
        let pass = {
            let mut state = self.lock_state();
            match &state.full {
                Some((_, full)) => {
                    debug!("full pass already in flight, joining it");
                    full.clone()
                }
                None => {
                    let skip = state.single.as_ref().map(|(name, _, _)| name.clone());
                    let id = state.next_id;
                    state.next_id += 1;
                    let pass = self.spawn_full(id, skip, is_daily);
                    state.full = Some((id, pass.clone()));
                    pass
                }
            }
        };
        pass.await
    }

    /// Whether enough time passed since the container's last backup.
    pub fn should_run_backup(&self, connection: &ContainerConnection, min_interval: Duration) -> bool {
        let Some(last) = connection.last_backup() else {
            return true;
        };
        let threshold = min_interval.saturating_sub(MIN_INTERVAL_SLACK);
        let elapsed = (Local::now() - last).to_std().unwrap_or(Duration::ZERO);
        elapsed >= threshold
    }

    /// Repairs containers left with autosave paused by a previous run. Each
    /// container is handled on its own; failures are logged and counted.
    pub async fn cleanup_containers(&self) -> usize {
        let mut failures = 0;
        for connection in &self.inner.containers {
            let span = info_span!("cleanup", container = %connection.name());
            if let Err(err) = self
                .cleanup_container(connection)
                .instrument(span)
                .await
            {
                error!(container = %connection.name(), "failed to recover incomplete backup: {err}");
                failures += 1;
            }
        }
        failures
    }

    async fn cleanup_container(&self, connection: &ContainerConnection) -> Result<()> {
        let destination = &self.inner.destination;
        if !connection.has_hold_marker(destination).await? {
            return Ok(());
        }
        warn!("found a hold marker from an interrupted backup");

        let was_running = match connection.process_running().await {
            Ok(running) => running,
            Err(err) => {
                warn!("could not determine whether the server runs: {err}");
                false
            }
        };
        if !was_running {
            info!("starting server to resume autosave");
            connection.start_process().await?;
            connection.reset().await?;
        }

        let repaired = connection.cleanup_incomplete_backup(destination).await;

        if !was_running {
            info!("stopping server again");
            if let Err(err) = connection.stop_process().await {
                warn!("failed to stop server after recovery: {err}");
            }
        }
        repaired
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, InFlight> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn spawn_single(&self, id: u64, connection: Arc<ContainerConnection>) -> PassFuture {
        let inner = self.inner.clone();
        let span = info_span!("backup", container = %connection.name());
        let task = tokio::spawn(
            async move {
                let mut outcome = PassOutcome::default();
                let result = connection.run_backup(&inner.destination).await;
                outcome.record(connection.name(), result);
                inner.after_pass(&outcome).await;

                let mut state = inner.state.lock().unwrap_or_else(PoisonError::into_inner);
                if state.single.as_ref().is_some_and(|(_, current, _)| *current == id) {
                    state.single = None;
                }
                outcome
            }
            .instrument(span),
        );
        join_pass(task)
    }

    fn spawn_full(&self, id: u64, skip: Option<String>, is_daily: bool) -> PassFuture {
        let inner = self.inner.clone();
        let span = info_span!("backup_all", daily = is_daily);
        let task = tokio::spawn(
            async move {
                info!(containers = inner.containers.len(), "starting backup pass");
                let mut outcome = PassOutcome::default();
                for connection in &inner.containers {
                    if skip.as_deref() == Some(connection.name()) {
                        debug!(container = %connection.name(), "covered by an individual backup");
                        continue;
                    }
                    let result = connection
                        .run_backup(&inner.destination)
                        .instrument(info_span!("backup", container = %connection.name()))
                        .await;
                    outcome.record(connection.name(), result);
                }
                inner.after_pass(&outcome).await;
                info!(
                    attempted = outcome.attempted.len(),
                    failed = outcome.failed.len(),
                    "backup pass finished"
                );

                let mut state = inner.state.lock().unwrap_or_else(PoisonError::into_inner);
                if state.full.as_ref().is_some_and(|(current, _)| *current == id) {
                    state.full = None;
                }
                outcome
            }
            .instrument(span),
        );
        join_pass(task)
    }
}

impl ActorInner {
    /// Retention, ownership and health, after every pass whatever its outcome.
    async fn after_pass(&self, outcome: &PassOutcome) {
        match trim_directory(&self.destination, &self.policy, Local::now(), false).await {
            Ok(report) => info!(
                kept = report.kept,
                trimmed = report.trimmed,
                failed = report.failed,
                "retention applied"
            ),
            Err(err) => warn!("retention failed: {err}"),
        }

        if !self.ownership.is_empty() {
            let destination = self.destination.clone();
            let ownership = self.ownership;
            match tokio::task::spawn_blocking(move || apply_ownership(&destination, &ownership)).await
            {
                Ok(updated) => debug!(updated, "ownership applied"),
                Err(err) => warn!("ownership task failed: {err}"),
            }
        }

        let marked = if outcome.is_success() {
            self.health.mark_healthy().await
        } else {
            self.health.mark_unhealthy().await
        };
        if let Err(err) = marked {
            error!("failed to update health marker: {err}");
        }
    }
}

fn join_pass(task: tokio::task::JoinHandle<PassOutcome>) -> PassFuture {
    async move {
        task.await.unwrap_or_else(|err| PassOutcome {
            fatal: Some(format!("backup task failed: {err}")),
            ..PassOutcome::default()
        })
    }
    .boxed()
    .shared()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup::testing::{
        FakeProcess, FakeSnapshot, ScriptHandle, ScriptedChannel, replies, unique_temp_dir,
    };
    use crate::archive::ZipSnapshot;
    use std::sync::atomic::Ordering;
    use worldsaver_core::naming::ArtifactName;
    use worldsaver_core::{ConnectionSpec, ContainerSpec, HoldMarker, ServerKind};
    use worldsaver_terminal::{ContainerTerminal, ProcessControl};

    struct Fleet {
        actor: BackupActor,
        handles: Vec<ScriptHandle>,
        snapshot: FakeSnapshot,
        dir: PathBuf,
    }

    fn spec(name: &str) -> ContainerSpec {
        ContainerSpec {
            name: name.into(),
            kind: ServerKind::Bedrock,
            connection: ConnectionSpec::Docker {
                container: name.into(),
            },
            rcon: None,
            worlds: vec![PathBuf::from(format!("/worlds/{name}"))],
            extras: Vec::new(),
        }
    }

    async fn fleet(
        names: &[&str],
        snapshot: FakeSnapshot,
        process: Option<Arc<FakeProcess>>,
    ) -> Fleet {
        let dir = unique_temp_dir("actor");
        std::fs::create_dir_all(&dir).unwrap();
        let mut containers = Vec::new();
        let mut handles = Vec::new();
        for name in names {
            let (channel, handle) = ScriptedChannel::new(replies(ServerKind::Bedrock));
            let terminal = ContainerTerminal::new(ServerKind::Bedrock, Box::new(channel));
            let control = process
                .clone()
                .map(|process| process as Arc<dyn ProcessControl>);
            let connection =
                ContainerConnection::new(spec(name), terminal, control, Arc::new(snapshot.clone()));
            connection.start(None).await.unwrap();
            containers.push(Arc::new(connection));
            handles.push(handle);
        }
        let actor = BackupActor::new(
            containers,
            dir.clone(),
            RetentionPolicy::default(),
            Ownership::default(),
        );
        Fleet {
            actor,
            handles,
            snapshot,
            dir,
        }
    }

    fn slow_snapshot() -> FakeSnapshot {
        FakeSnapshot {
            delay: Duration::from_secs(5),
            ..FakeSnapshot::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_requests_for_one_container_run_once() {
        let fleet = fleet(&["alpha"], slow_snapshot(), None).await;

        let (first, second) = tokio::join!(
            fleet.actor.backup_container("alpha"),
            fleet.actor.backup_container("alpha"),
        );
        assert!(first.unwrap().is_success());
        assert!(second.unwrap().is_success());
        assert_eq!(fleet.snapshot.calls().len(), 1);
        assert_eq!(fleet.handles[0].count("save hold"), 1);

        // a later request is a new backup
        fleet.actor.backup_container("alpha").await.unwrap();
        assert_eq!(fleet.snapshot.calls().len(), 2);

        let _ = std::fs::remove_dir_all(&fleet.dir);
    }

    #[tokio::test(start_paused = true)]
    async fn single_request_during_full_pass_is_covered() {
        let fleet = fleet(&["alpha", "beta"], slow_snapshot(), None).await;

        let (all, single, again) = tokio::join!(
            fleet.actor.backup_all(false),
            fleet.actor.backup_container("beta"),
            fleet.actor.backup_all(true),
        );
        assert_eq!(all.attempted, vec!["alpha".to_string(), "beta".to_string()]);
        assert_eq!(single.unwrap(), all);
        assert_eq!(again, all);
        assert_eq!(fleet.snapshot.calls().len(), 2);
        for handle in &fleet.handles {
            assert_eq!(handle.count("save hold"), 1);
        }

        let _ = std::fs::remove_dir_all(&fleet.dir);
    }

    #[tokio::test(start_paused = true)]
    async fn full_pass_skips_the_container_backed_up_alone() {
        let fleet = fleet(&["alpha", "beta"], slow_snapshot(), None).await;

        let (single, all) = tokio::join!(
            fleet.actor.backup_container("alpha"),
            fleet.actor.backup_all(false),
        );
        assert_eq!(single.unwrap().attempted, vec!["alpha".to_string()]);
        assert_eq!(all.attempted, vec!["beta".to_string()]);
        assert_eq!(fleet.handles[0].count("save hold"), 1);
        assert_eq!(fleet.handles[1].count("save hold"), 1);

        let _ = std::fs::remove_dir_all(&fleet.dir);
    }

    #[tokio::test(start_paused = true)]
    async fn requests_for_different_containers_are_serialized() {
        let fleet = fleet(&["alpha", "beta"], slow_snapshot(), None).await;

        let (a, b) = tokio::join!(
            fleet.actor.backup_container("alpha"),
            fleet.actor.backup_container("beta"),
        );
        assert_eq!(a.unwrap().attempted, vec!["alpha".to_string()]);
        assert_eq!(b.unwrap().attempted, vec!["beta".to_string()]);
        assert_eq!(
            fleet.snapshot.calls(),
            vec![PathBuf::from("/worlds/alpha"), PathBuf::from("/worlds/beta")]
        );

        let _ = std::fs::remove_dir_all(&fleet.dir);
    }

    #[tokio::test]
    async fn failures_are_tallied_and_flip_health() {
        let snapshot = FakeSnapshot {
            failing: vec!["beta".into()],
            ..FakeSnapshot::default()
        };
        let fleet = fleet(&["alpha", "beta"], snapshot, None).await;

        let outcome = fleet.actor.backup_all(false).await;
        assert_eq!(outcome.attempted.len(), 2);
        assert_eq!(outcome.failed.len(), 1);
        assert_eq!(outcome.failed[0].0, "beta");
        assert!(!HealthMarker::new(&fleet.dir).is_healthy().await);

        let outcome = fleet.actor.backup_container("alpha").await.unwrap();
        assert!(outcome.is_success());
        assert!(HealthMarker::new(&fleet.dir).is_healthy().await);

        let _ = std::fs::remove_dir_all(&fleet.dir);
    }

    #[tokio::test]
    async fn unknown_container_is_rejected() {
        let fleet = fleet(&["alpha"], FakeSnapshot::default(), None).await;
        assert!(matches!(
            fleet.actor.backup_container("nope").await,
            Err(CoreError::InvalidConfig(_))
        ));
        let _ = std::fs::remove_dir_all(&fleet.dir);
    }

    #[tokio::test]
    async fn cleanup_repairs_only_marked_containers() {
        let process = Arc::new(FakeProcess::default());
        let fleet = fleet(&["alpha", "beta"], FakeSnapshot::default(), Some(process.clone())).await;
        HoldMarker::new(&fleet.dir, "alpha").acquire().await.unwrap();

        assert_eq!(fleet.actor.cleanup_containers().await, 0);

        assert_eq!(fleet.handles[0].sent(), vec!["save resume"]);
        assert!(fleet.handles[1].sent().is_empty());
        assert!(!HoldMarker::new(&fleet.dir, "alpha").exists().await.unwrap());
        assert_eq!(process.starts.load(Ordering::SeqCst), 1);
        assert_eq!(process.stops.load(Ordering::SeqCst), 1);

        // nothing left to repair
        assert_eq!(fleet.actor.cleanup_containers().await, 0);
        assert_eq!(fleet.handles[0].count("save resume"), 1);

        let _ = std::fs::remove_dir_all(&fleet.dir);
    }

    #[tokio::test]
    async fn equally_named_worlds_get_their_own_artifacts() {
        let worlds = unique_temp_dir("actor-worlds");
        let dir = unique_temp_dir("actor-shared-world");
        std::fs::create_dir_all(&dir).unwrap();
        let mut containers = Vec::new();
        for name in ["alpha", "beta"] {
            let world = worlds.join(name).join("world");
            std::fs::create_dir_all(&world).unwrap();
            std::fs::write(world.join("level.dat"), name).unwrap();

            let (channel, _handle) = ScriptedChannel::new(replies(ServerKind::Bedrock));
            let terminal = ContainerTerminal::new(ServerKind::Bedrock, Box::new(channel));
            let spec = ContainerSpec {
                worlds: vec![world],
                ..spec(name)
            };
            let connection = ContainerConnection::new(spec, terminal, None, Arc::new(ZipSnapshot));
            connection.start(None).await.unwrap();
            containers.push(Arc::new(connection));
        }
        let actor = BackupActor::new(
            containers,
            dir.clone(),
            RetentionPolicy::default(),
            Ownership::default(),
        );

        let outcome = actor.backup_all(false).await;
        assert!(outcome.is_success());

        let mut groups: Vec<String> = std::fs::read_dir(&dir)
            .unwrap()
            .filter_map(|entry| {
                let name = entry.ok()?.file_name();
                ArtifactName::parse(name.to_str()?).map(|artifact| artifact.name)
            })
            .collect();
        groups.sort();
        assert_eq!(groups, vec!["alpha-world".to_string(), "beta-world".to_string()]);

        let _ = std::fs::remove_dir_all(&dir);
        let _ = std::fs::remove_dir_all(&worlds);
    }

    #[tokio::test]
    async fn min_interval_throttles_with_slack() {
        let fleet = fleet(&["alpha"], FakeSnapshot::default(), None).await;
        let connection = fleet.actor.container("alpha").unwrap();
        assert!(fleet
            .actor
            .should_run_backup(&connection, Duration::from_secs(3600)));

        fleet.actor.backup_container("alpha").await.unwrap();
        assert!(!fleet
            .actor
            .should_run_backup(&connection, Duration::from_secs(3600)));
        // within the slack
        assert!(fleet
            .actor
            .should_run_backup(&connection, Duration::from_secs(30)));

        let _ = std::fs::remove_dir_all(&fleet.dir);
    }
}
