use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use futures_util::StreamExt;
use tokio::io::AsyncRead;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::io::ReaderStream;
use tracing::trace;

use worldsaver_core::Result;

pub mod docker;
pub mod rcon;
pub mod ssh;

pub use docker::{DockerChannel, DockerControl};
pub use rcon::RconChannel;
pub use ssh::SshChannel;

const OUTPUT_CAPACITY: usize = 1024;

/// Duplex text stream to a server console.
///
/// Output is fanned out to every subscriber; a subscriber only sees text that
/// arrives after it subscribed. The output sender outlives `close`/`reset`, so
/// long-lived subscribers keep working across reconnects.
#[async_trait]
pub trait TerminalChannel: Send + Sync {
    fn describe(&self) -> String;

    async fn start(&mut self) -> Result<()>;

    fn is_connected(&self) -> bool;

    fn subscribe(&self) -> broadcast::Receiver<String>;

    async fn send_line(&mut self, line: &str) -> Result<()>;

    async fn close(&mut self) -> Result<()>;

    async fn reset(&mut self) -> Result<()> {
        self.close().await?;
        self.start().await
    }
}

/// Start/stop of the process behind a console, where the transport allows it.
#[async_trait]
pub trait ProcessControl: Send + Sync {
    async fn is_running(&self) -> Result<bool>;

    async fn start(&self) -> Result<()>;

    async fn stop(&self) -> Result<()>;
}

#[derive(Debug, Clone)]
pub struct ConsoleOutput {
    tx: broadcast::Sender<String>,
}

impl Default for ConsoleOutput {
    fn default() -> Self {
        let (tx, _) = broadcast::channel(OUTPUT_CAPACITY);
        Self { tx }
    }
}

impl ConsoleOutput {
    pub fn publish(&self, text: impl Into<String>) {
        let text = text.into();
        if text.is_empty() {
            return;
        }
        trace!(output = %text.trim_end(), "console output");
        // no subscribers is fine
        let _ = self.tx.send(text);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<String> {
        self.tx.subscribe()
    }
}

/// Forwards everything read from `reader` to `output`; clears `connected` at EOF.
pub(crate) fn spawn_reader<R>(
    reader: R,
    output: ConsoleOutput,
    connected: Arc<AtomicBool>,
) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut stream = ReaderStream::new(reader);
        while let Some(chunk) = stream.next().await {
            match chunk {
                Ok(bytes) => output.publish(String::from_utf8_lossy(&bytes).into_owned()),
                Err(_) => break,
            }
        }
        connected.store(false, Ordering::SeqCst);
    })
}
