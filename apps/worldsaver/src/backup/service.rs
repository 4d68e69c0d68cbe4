use std::future::Future;

use anyhow::{Result, bail};
use chrono::Local;
use tokio::sync::mpsc;
use tokio::time::{Instant, sleep_until};
use tracing::{debug, info, warn};

use super::actor::{BackupActor, PassOutcome};
use super::presence::{PlayerEvent, PresenceKind};
use super::schedule::next_deadline;
use crate::config::Schedule;

/// Drives the actor from the schedule and player events until `shutdown` resolves.
///
/// Only fatal conditions end the loop with an error; failed backups are left to
/// the health marker.
pub async fn run_service<F>(
    actor: BackupActor,
    schedule: Schedule,
    mut events: mpsc::Receiver<PlayerEvent>,
    shutdown: F,
) -> Result<()>
where
    F: Future<Output = ()>,
{
    tokio::pin!(shutdown);

    let mut deadline = match &schedule.trigger {
        Some(trigger) => Some(next_deadline(trigger, Local::now())?),
        None => None,
    };
    match deadline {
        Some((at, daily)) => info!(
            in_secs = at.saturating_duration_since(Instant::now()).as_secs(),
            daily,
            "next scheduled backup"
        ),
        None => info!("no timed schedule, backing up on player events only"),
    }
    let mut events_open = true;

    loop {
        let timer = async move {
            match deadline {
                Some((at, _)) => sleep_until(at).await,
                None => std::future::pending().await,
            }
        };

        tokio::select! {
            _ = &mut shutdown => {
                info!("shutdown requested");
                break;
            }
            _ = timer => {
                let daily = deadline.is_some_and(|(_, daily)| daily);
                let outcome = actor.backup_all(daily).await;
                check_fatal(&outcome)?;
                if let Some(trigger) = &schedule.trigger {
                    deadline = Some(next_deadline(trigger, Local::now())?);
                }
            }
            event = events.recv(), if events_open => match event {
                Some(event) => {
                    if let Some(outcome) = on_player_event(&actor, &schedule, event).await {
                        check_fatal(&outcome)?;
                    }
                }
                None => {
                    debug!("player event stream closed");
                    events_open = false;
                }
            },
        }
    }

    Ok(())
}

async fn on_player_event(
    actor: &BackupActor,
    schedule: &Schedule,
    event: PlayerEvent,
) -> Option<PassOutcome> {
    let wanted = match event.kind {
        PresenceKind::Login => schedule.on_player_login,
        PresenceKind::Logout => schedule.on_player_logout,
    };
    if !wanted {
        return None;
    }

    let connection = actor.container(&event.container)?;
    if !actor.should_run_backup(&connection, schedule.min_interval) {
        debug!(container = %event.container, player = %event.player, "backup throttled by minimum interval");
        return None;
    }

    info!(container = %event.container, player = %event.player, kind = ?event.kind, "backup triggered by player");
    match actor.backup_container(&event.container).await {
        Ok(outcome) => Some(outcome),
        Err(err) => {
            warn!(container = %event.container, "player-triggered backup rejected: {err}");
            None
        }
    }
}

fn check_fatal(outcome: &PassOutcome) -> Result<()> {
    if let Some(reason) = &outcome.fatal {
        bail!("fatal backup failure: {reason}");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup::connection::ContainerConnection;
    use crate::backup::testing::{FakeSnapshot, ScriptedChannel, replies, unique_temp_dir};
    use crate::config::{Ownership, Trigger};
    use std::path::PathBuf;
    use std::sync::Arc;
    use tokio::time::{Duration, sleep};
    use worldsaver_core::{ConnectionSpec, ContainerSpec, RetentionPolicy, ServerKind};
    use worldsaver_terminal::ContainerTerminal;

    async fn actor(snapshot: FakeSnapshot) -> (BackupActor, PathBuf) {
        let dir = unique_temp_dir("service");
        std::fs::create_dir_all(&dir).unwrap();
        let spec = ContainerSpec {
            name: "alpha".into(),
            kind: ServerKind::Java,
            connection: ConnectionSpec::Docker {
                container: "alpha".into(),
            },
            rcon: None,
            worlds: vec![PathBuf::from("/worlds/world")],
            extras: Vec::new(),
        };
        let (channel, _handle) = ScriptedChannel::new(replies(ServerKind::Java));
        let terminal = ContainerTerminal::new(ServerKind::Java, Box::new(channel));
        let connection = ContainerConnection::new(spec, terminal, None, Arc::new(snapshot));
        connection.start(None).await.unwrap();
        let actor = BackupActor::new(
            vec![Arc::new(connection)],
            dir.clone(),
            RetentionPolicy::default(),
            Ownership::default(),
        );
        (actor, dir)
    }

    fn schedule(trigger: Option<Trigger>) -> Schedule {
        Schedule {
            trigger,
            on_player_login: false,
            on_player_logout: true,
            min_interval: Duration::from_secs(3600),
        }
    }

    fn event(kind: PresenceKind) -> PlayerEvent {
        PlayerEvent {
            container: "alpha".into(),
            kind,
            player: "Notch".into(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn interval_schedule_runs_a_pass_per_period() {
        let snapshot = FakeSnapshot::default();
        let (actor, dir) = actor(snapshot.clone()).await;
        let (_tx, rx) = mpsc::channel(4);

        run_service(
            actor,
            schedule(Some(Trigger::Interval(Duration::from_secs(3600)))),
            rx,
            sleep(Duration::from_secs(3 * 3600 - 60)),
        )
        .await
        .unwrap();

        assert_eq!(snapshot.calls().len(), 2);
        let _ = std::fs::remove_dir_all(dir);
    }

    #[tokio::test(start_paused = true)]
    async fn logout_triggers_are_throttled() {
        let snapshot = FakeSnapshot::default();
        let (actor, dir) = actor(snapshot.clone()).await;
        let (tx, rx) = mpsc::channel(4);

        tx.send(event(PresenceKind::Login)).await.unwrap();
        tx.send(event(PresenceKind::Logout)).await.unwrap();
        tx.send(event(PresenceKind::Logout)).await.unwrap();
        drop(tx);

        run_service(actor, schedule(None), rx, sleep(Duration::from_secs(60)))
            .await
            .unwrap();

        // the login is ignored and the second logout falls inside the minimum interval
        assert_eq!(snapshot.calls().len(), 1);
        let _ = std::fs::remove_dir_all(dir);
    }

    #[test]
    fn fatal_outcomes_stop_the_service() {
        let outcome = PassOutcome {
            fatal: Some("alpha: host key changed".into()),
            ..PassOutcome::default()
        };
        assert!(check_fatal(&outcome).is_err());
        assert!(check_fatal(&PassOutcome::default()).is_ok());
    }
}
