use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::errors::{CoreError, Result};

pub const DEFAULT_RCON_PORT: u16 = 25575;
pub const DEFAULT_SSH_PORT: u16 = 22;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerKind {
    Bedrock,
    Java,
}

impl ServerKind {
    /// Extension of the archive produced for one world of this flavor.
    pub fn world_extension(self) -> &'static str {
        match self {
            ServerKind::Bedrock => "mcworld",
            ServerKind::Java => "zip",
        }
    }
}

impl fmt::Display for ServerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServerKind::Bedrock => f.write_str("bedrock"),
            ServerKind::Java => f.write_str("java"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    /// Parses `host`, `host:port` or `[v6]:port`.
    pub fn parse(value: &str, default_port: u16) -> Result<Self> {
        let value = value.trim();
        if value.is_empty() {
            return Err(CoreError::config("address is empty"));
        }

        let (host, port) = if let Some(rest) = value.strip_prefix('[') {
            let (host, tail) = rest
                .split_once(']')
                .ok_or_else(|| CoreError::config(format!("invalid address: {value}")))?;
            match tail.strip_prefix(':') {
                Some(port) => (host, Some(port)),
                None if tail.is_empty() => (host, None),
                None => return Err(CoreError::config(format!("invalid address: {value}"))),
            }
        } else {
            match value.rsplit_once(':') {
                Some((host, port)) => (host, Some(port)),
                None => (value, None),
            }
        };

        if host.is_empty() || host.contains(char::is_whitespace) {
            return Err(CoreError::config(format!("invalid host in address: {value}")));
        }

        let port = match port {
            Some(port) => port
                .parse::<u16>()
                .ok()
                .filter(|port| *port != 0)
                .ok_or_else(|| CoreError::config(format!("invalid port in address: {value}")))?,
            None => default_port,
        };

        Ok(Self {
            host: host.to_string(),
            port,
        })
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RconSpec {
    pub endpoint: Endpoint,
    pub password: String,
}

/// How the console of a server is reached.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionSpec {
    Docker { container: String },
    Rcon(RconSpec),
    Ssh {
        endpoint: Endpoint,
        username: String,
        password: String,
    },
}

impl ConnectionSpec {
    pub fn channel_type(&self) -> &'static str {
        match self {
            ConnectionSpec::Docker { .. } => "docker",
            ConnectionSpec::Rcon(_) => "rcon",
            ConnectionSpec::Ssh { .. } => "ssh",
        }
    }
}

/// A validated container definition, ready to be connected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerSpec {
    pub name: String,
    pub kind: ServerKind,
    pub connection: ConnectionSpec,
    pub rcon: Option<RconSpec>,
    pub worlds: Vec<PathBuf>,
    pub extras: Vec<PathBuf>,
}

impl ContainerSpec {
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(CoreError::config("container name is empty"));
        }
        if self.name.contains(['/', '\\']) || self.name.starts_with('.') {
            return Err(CoreError::config(format!(
                "container name {:?} cannot be used in a file name",
                self.name
            )));
        }
        if self.worlds.is_empty() {
            return Err(CoreError::config(format!(
                "container {} has no world paths",
                self.name
            )));
        }
        Ok(())
    }
}
