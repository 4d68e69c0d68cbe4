//! Fakes shared by the backup tests.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::broadcast;
use tokio::time::Duration;

use worldsaver_core::{CoreError, Result, ServerKind};
use worldsaver_terminal::{ConsoleOutput, ProcessControl, TerminalChannel};

use crate::archive::WorldSnapshot;

pub fn replies(kind: ServerKind) -> HashMap<String, String> {
    let pairs: &[(&str, &str)] = match kind {
        ServerKind::Bedrock => &[
            ("save hold", "Saving...\n"),
            ("save query", "Data saved. Files are now ready to be copied.\n"),
            ("save resume", "Changes to the world are resumed.\n"),
        ],
        ServerKind::Java => &[
            ("save-all flush", "Saving the game (this may take a moment!)\nSaved the game\n"),
            ("save-off", "Automatic saving is now disabled\n"),
            ("save-on", "Automatic saving is now enabled\n"),
        ],
    };
    pairs
        .iter()
        .map(|(command, reply)| (command.to_string(), reply.to_string()))
        .collect()
}

/// Handle kept by a test to inspect and drive a `ScriptedChannel`.
#[derive(Clone, Default)]
pub struct ScriptHandle {
    pub sent: Arc<Mutex<Vec<String>>>,
    pub connected: Arc<AtomicBool>,
    pub starts: Arc<AtomicUsize>,
    pub refuse_start: Arc<AtomicBool>,
    pub output: ConsoleOutput,
}

impl ScriptHandle {
    pub fn sent(&self) -> Vec<String> {
        self.sent.lock().unwrap().clone()
    }

    pub fn count(&self, command: &str) -> usize {
        self.sent().iter().filter(|sent| *sent == command).count()
    }
}

pub struct ScriptedChannel {
    handle: ScriptHandle,
    replies: HashMap<String, String>,
}

impl ScriptedChannel {
    pub fn new(replies: HashMap<String, String>) -> (Self, ScriptHandle) {
        let handle = ScriptHandle::default();
        (
            Self {
                handle: handle.clone(),
                replies,
            },
            handle,
        )
    }
}

#[async_trait]
impl TerminalChannel for ScriptedChannel {
    fn describe(&self) -> String {
        "scripted".into()
    }

    async fn start(&mut self) -> Result<()> {
        self.handle.starts.fetch_add(1, Ordering::SeqCst);
        if self.handle.refuse_start.load(Ordering::SeqCst) {
            return Err(CoreError::Transport("refused".into()));
        }
        self.handle.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.handle.connected.load(Ordering::SeqCst)
    }

    fn subscribe(&self) -> broadcast::Receiver<String> {
        self.handle.output.subscribe()
    }

    async fn send_line(&mut self, line: &str) -> Result<()> {
        self.handle.sent.lock().unwrap().push(line.to_string());
        if let Some(reply) = self.replies.get(line) {
            self.handle.output.publish(reply.clone());
        }
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        self.handle.connected.store(false, Ordering::SeqCst);
        Ok(())
    }
}

#[derive(Clone, Default)]
pub struct FakeSnapshot {
    pub calls: Arc<Mutex<Vec<PathBuf>>>,
    pub failing: Vec<String>,
    pub delay: Duration,
}

impl FakeSnapshot {
    pub fn calls(&self) -> Vec<PathBuf> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl WorldSnapshot for FakeSnapshot {
    async fn snapshot_world(
        &self,
        container: &str,
        world: &Path,
        kind: ServerKind,
        destination: &Path,
    ) -> Result<PathBuf> {
        self.calls.lock().unwrap().push(world.to_path_buf());
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let name = world.file_name().and_then(|n| n.to_str()).unwrap_or_default();
        if self.failing.iter().any(|failing| failing == name) {
            return Err(CoreError::Archive(format!("cannot snapshot {name}")));
        }
        Ok(destination.join(format!(
            "{container}-{name}.20240520-033000.{}",
            kind.world_extension()
        )))
    }

    async fn archive_extras(
        &self,
        container: &str,
        paths: &[PathBuf],
        destination: &Path,
    ) -> Result<PathBuf> {
        self.calls.lock().unwrap().extend(paths.iter().cloned());
        if self.failing.iter().any(|failing| failing == "extras") {
            return Err(CoreError::Archive("cannot archive extras".into()));
        }
        Ok(destination.join(format!("{container}-extras.20240520-033000.zip")))
    }
}

#[derive(Default)]
pub struct FakeProcess {
    pub running: AtomicBool,
    pub starts: AtomicUsize,
    pub stops: AtomicUsize,
}

#[async_trait]
impl ProcessControl for FakeProcess {
    async fn is_running(&self) -> Result<bool> {
        Ok(self.running.load(Ordering::SeqCst))
    }

    async fn start(&self) -> Result<()> {
        self.starts.fetch_add(1, Ordering::SeqCst);
        self.running.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        self.stops.fetch_add(1, Ordering::SeqCst);
        self.running.store(false, Ordering::SeqCst);
        Ok(())
    }
}

pub fn unique_temp_dir(prefix: &str) -> PathBuf {
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    std::env::temp_dir().join(format!("worldsaver-{prefix}-{nanos}"))
}
