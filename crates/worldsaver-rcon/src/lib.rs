use anyhow::Context;
use minecraft_client_rs::Client;
use std::collections::HashMap;
use std::path::Path;
use thiserror::Error;
use tokio::fs;
use tokio::task::spawn_blocking;

pub const DEFAULT_PORT: u16 = 25575;

#[derive(Debug, Error)]
pub enum RconError {
    #[error("failed to connect to {address}: {message}")]
    Connect { address: String, message: String },

    #[error("authentication rejected by {address}")]
    Auth { address: String },

    #[error("command {command:?} failed: {message}")]
    Command { command: String, message: String },

    #[error("RCON task failed: {0}")]
    Task(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RconSettings {
    pub address: String,
    pub password: String,
}

#[derive(Debug, Clone)]
pub struct RconClient {
    address: String,
    password: String,
}

impl RconClient {
    pub fn new(address: String, password: String) -> Self {
        Self { address, password }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    /// Connects and authenticates without running anything.
    pub async fn probe(&self) -> Result<(), RconError> {
        self.session(None).await.map(|_| ())
    }

    /// Runs one command on a fresh authenticated connection and returns its body.
    pub async fn execute(&self, command: &str) -> Result<String, RconError> {
        self.session(Some(command.to_string()))
            .await
            .map(Option::unwrap_or_default)
    }

    async fn session(&self, command: Option<String>) -> Result<Option<String>, RconError> {
        let address = self.address.clone();
        let password = self.password.clone();

        spawn_blocking(move || {
            let mut client = Client::new(address.clone()).map_err(|err| RconError::Connect {
                address: address.clone(),
                message: err.to_string(),
            })?;
            client
                .authenticate(password)
                .map_err(|_| RconError::Auth {
                    address: address.clone(),
                })?;
            let body = match command {
                Some(command) => {
                    let response = client.send_command(command.clone()).map_err(|err| {
                        RconError::Command {
                            command,
                            message: err.to_string(),
                        }
                    })?;
                    Some(response.body)
                }
                None => None,
            };
            // the server closes idle sessions on its own; a failed close is not an error
            let _ = client.close();
            Ok(body)
        })
        .await
        .map_err(|err| RconError::Task(err.to_string()))?
    }
}

/// Reads RCON settings from a Java `server.properties`. `Ok(None)` when RCON is disabled
/// or the file does not exist.
pub async fn load_rcon_settings(properties_path: &Path, host: &str) -> anyhow::Result<Option<RconSettings>> {
    let content = match fs::read_to_string(properties_path).await {
        Ok(value) => value,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(err) => {
            return Err(err)
                .with_context(|| format!("failed to read {}", properties_path.display()));
        }
    };
    parse_rcon_settings(&content, host)
}

/// `key=value` pairs of a properties file; comments and malformed lines are skipped.
fn properties(content: &str) -> HashMap<&str, &str> {
    content
        .lines()
        .map(str::trim)
        .filter(|line| !line.starts_with('#'))
        .filter_map(|line| line.split_once('='))
        .map(|(key, value)| (key.trim(), value.trim()))
        .collect()
}

fn parse_rcon_settings(content: &str, host: &str) -> anyhow::Result<Option<RconSettings>> {
    let properties = properties(content);
    let enabled = properties
        .get("enable-rcon")
        .is_some_and(|value| value.eq_ignore_ascii_case("true"));
    if !enabled {
        return Ok(None);
    }

    let port = match properties.get("rcon.port").filter(|value| !value.is_empty()) {
        Some(value) => value
            .parse::<u16>()
            .with_context(|| format!("Invalid rcon.port {value:?}"))?,
        None => DEFAULT_PORT,
    };
    let password = properties
        .get("rcon.password")
        .filter(|value| !value.is_empty())
        .context("Missing rcon.password")?;

    Ok(Some(RconSettings {
        address: format!("{host}:{port}"),
        password: password.to_string(),
    }))
}
