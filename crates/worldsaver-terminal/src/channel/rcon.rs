use async_trait::async_trait;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use worldsaver_core::{CoreError, Result};
use worldsaver_rcon::{RconClient, RconError};

use super::{ConsoleOutput, TerminalChannel};

/// Request/response console over RCON. Every reply body is published as output,
/// so the expect-based protocol works the same as on a streaming console.
pub struct RconChannel {
    client: RconClient,
    output: ConsoleOutput,
    connected: bool,
}

impl RconChannel {
    pub fn new(client: RconClient) -> Self {
        Self {
            client,
            output: ConsoleOutput::default(),
            connected: false,
        }
    }
}

fn map_error(err: RconError) -> CoreError {
    match err {
        RconError::Auth { address } => CoreError::AuthenticationFailed(address),
        other => CoreError::Transport(other.to_string()),
    }
}

#[async_trait]
impl TerminalChannel for RconChannel {
    fn describe(&self) -> String {
        format!("rcon:{}", self.client.address())
    }

    async fn start(&mut self) -> Result<()> {
        self.client.probe().await.map_err(map_error)?;
        debug!(address = %self.client.address(), "rcon credentials accepted");
        self.connected = true;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    fn subscribe(&self) -> broadcast::Receiver<String> {
        self.output.subscribe()
    }

    async fn send_line(&mut self, line: &str) -> Result<()> {
        if !self.connected {
            return Err(CoreError::NotConnected);
        }
        match self.client.execute(line).await {
            Ok(body) => {
                self.output.publish(format!("{}\n", body.trim_end()));
                Ok(())
            }
            Err(err) => {
                warn!(address = %self.client.address(), "rcon command failed: {err}");
                self.connected = false;
                Err(map_error(err))
            }
        }
    }

    async fn close(&mut self) -> Result<()> {
        self.connected = false;
        Ok(())
    }
}
