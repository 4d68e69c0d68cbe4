use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{Duration, timeout};
use tracing::{debug, info, warn};

use worldsaver_core::{CoreError, Result};

use super::{ConsoleOutput, ProcessControl, TerminalChannel, spawn_reader};

const STOP_GRACE: Duration = Duration::from_secs(5);

/// Console of a local container reached through `docker attach`.
///
/// The container must keep stdin open; signals are not proxied so closing the
/// channel never stops the server.
pub struct DockerChannel {
    docker_path: PathBuf,
    container: String,
    output: ConsoleOutput,
    connected: Arc<AtomicBool>,
    child: Option<Child>,
    stdin: Option<ChildStdin>,
    readers: Vec<JoinHandle<()>>,
}

impl DockerChannel {
    pub fn new(docker_path: impl Into<PathBuf>, container: impl Into<String>) -> Self {
        Self {
            docker_path: docker_path.into(),
            container: container.into(),
            output: ConsoleOutput::default(),
            connected: Arc::new(AtomicBool::new(false)),
            child: None,
            stdin: None,
            readers: Vec::new(),
        }
    }
}

#[async_trait]
impl TerminalChannel for DockerChannel {
    fn describe(&self) -> String {
        format!("docker:{}", self.container)
    }

    async fn start(&mut self) -> Result<()> {
        if self.is_connected() {
            return Ok(());
        }

        let mut child = Command::new(&self.docker_path)
            .args(["attach", "--sig-proxy=false", &self.container])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|err| {
                CoreError::Transport(format!(
                    "failed to run {} attach {}: {err}",
                    self.docker_path.display(),
                    self.container
                ))
            })?;

        let stdin = child.stdin.take();
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let (Some(stdin), Some(stdout), Some(stderr)) = (stdin, stdout, stderr) else {
            let _ = child.start_kill();
            return Err(CoreError::Transport("docker attach did not expose stdio".into()));
        };

        self.connected.store(true, Ordering::SeqCst);
        self.readers = vec![
            spawn_reader(stdout, self.output.clone(), self.connected.clone()),
            spawn_reader(stderr, self.output.clone(), Arc::new(AtomicBool::new(true))),
        ];
        self.stdin = Some(stdin);
        self.child = Some(child);
        info!(container = %self.container, "attached to container console");
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn subscribe(&self) -> broadcast::Receiver<String> {
        self.output.subscribe()
    }

    async fn send_line(&mut self, line: &str) -> Result<()> {
        let Some(stdin) = self.stdin.as_mut() else {
            return Err(CoreError::NotConnected);
        };
        let payload = format!("{line}\n");
        let written = async {
            stdin.write_all(payload.as_bytes()).await?;
            stdin.flush().await
        }
        .await;
        if let Err(err) = written {
            self.connected.store(false, Ordering::SeqCst);
            return Err(CoreError::Transport(format!(
                "failed to write to {}: {err}",
                self.container
            )));
        }
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        self.connected.store(false, Ordering::SeqCst);
        // closing stdin detaches the client
        self.stdin = None;
        if let Some(mut child) = self.child.take() {
            if timeout(STOP_GRACE, child.wait()).await.is_err() {
                debug!(container = %self.container, "docker attach did not exit, killing it");
                if let Err(err) = child.kill().await {
                    warn!(container = %self.container, "failed to kill docker attach: {err}");
                }
            }
        }
        for reader in self.readers.drain(..) {
            reader.abort();
        }
        Ok(())
    }
}

/// `docker inspect/start/stop` for one container.
#[derive(Debug, Clone)]
pub struct DockerControl {
    docker_path: PathBuf,
    container: String,
}

impl DockerControl {
    pub fn new(docker_path: impl Into<PathBuf>, container: impl Into<String>) -> Self {
        Self {
            docker_path: docker_path.into(),
            container: container.into(),
        }
    }

    async fn docker(&self, args: &[&str]) -> Result<String> {
        let output = Command::new(&self.docker_path)
            .args(args)
            .arg(&self.container)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|err| {
                CoreError::Transport(format!("failed to run {}: {err}", self.docker_path.display()))
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let message = stderr.trim();
            if message.to_ascii_lowercase().contains("permission denied") {
                return Err(CoreError::Console(message.to_string()));
            }
            return Err(CoreError::Transport(format!(
                "docker {} {} failed: {message}",
                args.join(" "),
                self.container
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}

#[async_trait]
impl ProcessControl for DockerControl {
    async fn is_running(&self) -> Result<bool> {
        let state = self.docker(&["inspect", "-f", "{{.State.Running}}"]).await?;
        Ok(state.eq_ignore_ascii_case("true"))
    }

    async fn start(&self) -> Result<()> {
        info!(container = %self.container, "starting container");
        self.docker(&["start"]).await.map(|_| ())
    }

    async fn stop(&self) -> Result<()> {
        info!(container = %self.container, "stopping container");
        self.docker(&["stop"]).await.map(|_| ())
    }
}
