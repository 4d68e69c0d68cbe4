use std::collections::HashSet;
use std::path::{Path, PathBuf};

use anyhow::{Context, bail};
use chrono::NaiveTime;
use serde::Deserialize;
use tokio::time::Duration;
use tracing::error;

use worldsaver_core::container::{DEFAULT_RCON_PORT, DEFAULT_SSH_PORT};
use worldsaver_core::{
    ConnectionSpec, ContainerSpec, CoreError, Endpoint, RconSpec, RetentionPolicy, ServerKind,
};

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceConfig {
    pub backup_path: Option<PathBuf>,
    pub docker_path: Option<PathBuf>,
    pub known_hosts_path: Option<PathBuf>,
    #[serde(default)]
    pub containers: ContainersConfig,
    #[serde(default)]
    pub schedule: ScheduleConfig,
    #[serde(default)]
    pub trim: RetentionPolicy,
    #[serde(default)]
    pub ownership: OwnershipConfig,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ContainersConfig {
    #[serde(default)]
    pub bedrock: Vec<ContainerConfig>,
    #[serde(default)]
    pub java: Vec<ContainerConfig>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerConfig {
    pub name: String,
    pub connection: Option<ConnectionConfig>,
    pub rcon: Option<RconConfig>,
    #[serde(default)]
    pub worlds: Vec<PathBuf>,
    #[serde(default)]
    pub extras: Vec<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase", rename_all_fields = "camelCase")]
pub enum ConnectionConfig {
    Docker {
        container: Option<String>,
    },
    Rcon(RconConfig),
    Ssh {
        address: String,
        username: String,
        password: Option<String>,
        password_file: Option<PathBuf>,
        password_env: Option<String>,
    },
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RconConfig {
    pub address: Option<String>,
    pub password: Option<String>,
    pub password_file: Option<PathBuf>,
    pub password_env: Option<String>,
    /// Read address and password from a Java `server.properties` instead.
    pub server_properties: Option<PathBuf>,
    pub host: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduleConfig {
    pub interval: Option<String>,
    pub daily: Option<String>,
    #[serde(default)]
    pub on_player_login: bool,
    #[serde(default)]
    pub on_player_logout: bool,
    pub min_interval: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OwnershipConfig {
    /// `uid`, `uid:gid` or `:gid`
    pub chown: Option<String>,
    /// Octal mode, e.g. `644`
    pub permissions: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    Interval(Duration),
    Daily(NaiveTime),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Schedule {
    pub trigger: Option<Trigger>,
    pub on_player_login: bool,
    pub on_player_logout: bool,
    pub min_interval: Duration,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Ownership {
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    pub mode: Option<u32>,
}

impl Ownership {
    pub fn is_empty(&self) -> bool {
        self.uid.is_none() && self.gid.is_none() && self.mode.is_none()
    }
}

pub fn load_config(path: &Path) -> anyhow::Result<ServiceConfig> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file {}", path.display()))?;
    let is_json = path
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));

    if is_json {
        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse config file {}", path.display()))
    } else {
        serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse config file {}", path.display()))
    }
}

pub fn default_known_hosts_path() -> anyhow::Result<PathBuf> {
    if let Some(base) = dirs::data_dir() {
        return Ok(base.join("worldsaver").join("known_hosts.json"));
    }
    if let Some(home) = dirs::home_dir() {
        return Ok(home.join(".worldsaver").join("known_hosts.json"));
    }
    bail!("Unable to resolve a writable data directory for known hosts")
}

impl ServiceConfig {
    pub fn docker_path(&self) -> PathBuf {
        self.docker_path
            .clone()
            .unwrap_or_else(|| PathBuf::from("docker"))
    }

    /// Validates every container independently; a bad entry does not affect the others.
    ///
    /// Names share the hold marker namespace, so a repeated name is rejected
    /// after its first occurrence.
    pub async fn container_specs(&self) -> Vec<Result<ContainerSpec, (String, CoreError)>> {
        let entries = self
            .containers
            .bedrock
            .iter()
            .map(|config| (ServerKind::Bedrock, config))
            .chain(
                self.containers
                    .java
                    .iter()
                    .map(|config| (ServerKind::Java, config)),
            );

        let mut seen = HashSet::new();
        let mut specs = Vec::new();
        for (kind, config) in entries {
            let spec = if seen.insert(config.name.as_str()) {
                container_spec(kind, config).await
            } else {
                Err(CoreError::config(format!(
                    "duplicate container name {:?}",
                    config.name
                )))
            };
            if let Err(err) = &spec {
                error!(container = %config.name, "skipping container: {err}");
            }
            specs.push(spec.map_err(|err| (config.name.clone(), err)));
        }
        specs
    }
}

async fn container_spec(kind: ServerKind, config: &ContainerConfig) -> Result<ContainerSpec, CoreError> {
    let connection = match &config.connection {
        None => ConnectionSpec::Docker {
            container: config.name.clone(),
        },
        Some(ConnectionConfig::Docker { container }) => ConnectionSpec::Docker {
            container: container.clone().unwrap_or_else(|| config.name.clone()),
        },
        Some(ConnectionConfig::Rcon(rcon)) => ConnectionSpec::Rcon(rcon_spec(&config.name, rcon).await?),
        Some(ConnectionConfig::Ssh {
            address,
            username,
            password,
            password_file,
            password_env,
        }) => ConnectionSpec::Ssh {
            endpoint: Endpoint::parse(address, DEFAULT_SSH_PORT)?,
            username: username.clone(),
            password: resolve_credential(
                &config.name,
                password.as_deref(),
                password_file.as_deref(),
                password_env.as_deref(),
            )?,
        },
    };

    let rcon = match &config.rcon {
        Some(rcon) => Some(rcon_spec(&config.name, rcon).await?),
        None => None,
    };

    let spec = ContainerSpec {
        name: config.name.clone(),
        kind,
        connection,
        rcon,
        worlds: config.worlds.clone(),
        extras: config.extras.clone(),
    };
    spec.validate()?;
    Ok(spec)
}

async fn rcon_spec(container: &str, config: &RconConfig) -> Result<RconSpec, CoreError> {
    if let Some(properties) = &config.server_properties {
        let host = config.host.as_deref().unwrap_or("127.0.0.1");
        let settings = worldsaver_rcon::load_rcon_settings(properties, host)
            .await
            .map_err(|err| CoreError::config(format!("{container}: {err:#}")))?
            .ok_or_else(|| {
                CoreError::config(format!(
                    "{container}: RCON is not enabled in {}",
                    properties.display()
                ))
            })?;
        return Ok(RconSpec {
            endpoint: Endpoint::parse(&settings.address, DEFAULT_RCON_PORT)?,
            password: settings.password,
        });
    }

    let address = config
        .address
        .as_deref()
        .ok_or_else(|| CoreError::config(format!("{container}: RCON address is missing")))?;
    Ok(RconSpec {
        endpoint: Endpoint::parse(address, DEFAULT_RCON_PORT)?,
        password: resolve_credential(
            container,
            config.password.as_deref(),
            config.password_file.as_deref(),
            config.password_env.as_deref(),
        )?,
    })
}

fn resolve_credential(
    container: &str,
    literal: Option<&str>,
    file: Option<&Path>,
    env: Option<&str>,
) -> Result<String, CoreError> {
    if let Some(value) = literal.filter(|value| !value.is_empty()) {
        return Ok(value.to_string());
    }
    if let Some(file) = file {
        let value = std::fs::read_to_string(file)
            .map_err(|err| CoreError::io(format!("reading credential {}", file.display()), err))?;
        let value = value.trim();
        if !value.is_empty() {
            return Ok(value.to_string());
        }
    }
    if let Some(name) = env {
        if let Ok(value) = std::env::var(name) {
            if !value.is_empty() {
                return Ok(value);
            }
        }
    }
    Err(CoreError::config(format!("{container}: missing credential")))
}

/// `30s`, `15m`, `3h`, `1d`; a bare number is seconds.
pub fn parse_duration(value: &str) -> Result<Duration, CoreError> {
    let value = value.trim();
    let split = value
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(value.len());
    let (digits, unit) = value.split_at(split);
    let amount: u64 = digits
        .parse()
        .map_err(|_| CoreError::config(format!("invalid duration: {value:?}")))?;
    let scale: u64 = match unit.trim() {
        "" | "s" => 1,
        "m" => 60,
        "h" => 60 * 60,
        "d" => 60 * 60 * 24,
        _ => return Err(CoreError::config(format!("invalid duration unit: {value:?}"))),
    };
    let seconds = amount
        .checked_mul(scale)
        .ok_or_else(|| CoreError::config(format!("duration is too large: {value:?}")))?;
    if seconds == 0 {
        return Err(CoreError::config(format!("duration must be positive: {value:?}")));
    }
    Ok(Duration::from_secs(seconds))
}

impl ScheduleConfig {
    pub fn resolve(&self) -> Result<Schedule, CoreError> {
        let trigger = match (&self.interval, &self.daily) {
            (Some(_), Some(_)) => {
                return Err(CoreError::config(
                    "schedule cannot set both interval and daily",
                ));
            }
            (Some(interval), None) => Some(Trigger::Interval(parse_duration(interval)?)),
            (None, Some(daily)) => Some(Trigger::Daily(
                NaiveTime::parse_from_str(daily.trim(), "%H:%M")
                    .map_err(|_| CoreError::config(format!("invalid daily time: {daily:?}")))?,
            )),
            (None, None) => None,
        };

        let min_interval = match &self.min_interval {
            Some(value) => parse_duration(value)?,
            None => Duration::ZERO,
        };

        Ok(Schedule {
            trigger,
            on_player_login: self.on_player_login,
            on_player_logout: self.on_player_logout,
            min_interval,
        })
    }
}

impl OwnershipConfig {
    pub fn resolve(&self) -> Result<Ownership, CoreError> {
        let mut ownership = Ownership::default();

        if let Some(chown) = self.chown.as_deref().map(str::trim).filter(|v| !v.is_empty()) {
            let (uid, gid) = match chown.split_once(':') {
                Some((uid, gid)) => (uid, Some(gid)),
                None => (chown, None),
            };
            let parse_id = |value: &str| {
                value
                    .parse::<u32>()
                    .map_err(|_| CoreError::config(format!("invalid chown value: {chown:?}")))
            };
            if !uid.is_empty() {
                ownership.uid = Some(parse_id(uid)?);
            }
            if let Some(gid) = gid.filter(|gid| !gid.is_empty()) {
                ownership.gid = Some(parse_id(gid)?);
            }
        }

        if let Some(mode) = self.permissions.as_deref().map(str::trim).filter(|v| !v.is_empty()) {
            let parsed = u32::from_str_radix(mode, 8)
                .ok()
                .filter(|mode| *mode <= 0o7777)
                .ok_or_else(|| CoreError::config(format!("invalid permissions: {mode:?}")))?;
            ownership.mode = Some(parsed);
        }

        Ok(ownership)
    }
}
