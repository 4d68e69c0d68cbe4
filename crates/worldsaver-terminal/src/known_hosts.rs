use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use worldsaver_core::{CoreError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostKeyStatus {
    Ok,
    NotFound,
    Changed,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct KnownHostsFile {
    hosts: BTreeMap<String, String>,
}

/// Trust-on-first-use store of SSH host key fingerprints, persisted as JSON.
#[derive(Debug)]
pub struct HostKeyStore {
    path: PathBuf,
    hosts: BTreeMap<String, String>,
}

impl HostKeyStore {
    pub fn load(path: &Path) -> Result<Self> {
        let hosts = match fs::read_to_string(path) {
            Ok(content) => {
                serde_json::from_str::<KnownHostsFile>(&content)
                    .map_err(|err| {
                        CoreError::config(format!("invalid known hosts file {}: {err}", path.display()))
                    })?
                    .hosts
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(err) => {
                return Err(CoreError::io(format!("reading {}", path.display()), err));
            }
        };
        Ok(Self {
            path: path.to_path_buf(),
            hosts,
        })
    }

    pub fn validate(&self, host: &str, fingerprint: &str) -> HostKeyStatus {
        match self.hosts.get(host) {
            Some(known) if known == fingerprint => HostKeyStatus::Ok,
            Some(_) => HostKeyStatus::Changed,
            None => HostKeyStatus::NotFound,
        }
    }

    /// Records a new host and persists the store.
    pub fn trust(&mut self, host: &str, fingerprint: &str) -> Result<()> {
        self.hosts.insert(host.to_string(), fingerprint.to_string());
        self.save()
    }

    fn save(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .map_err(|err| CoreError::io(format!("creating {}", parent.display()), err))?;
        }
        let payload = serde_json::to_string_pretty(&KnownHostsFile {
            hosts: self.hosts.clone(),
        })
        .map_err(|err| CoreError::config(format!("failed to serialize known hosts: {err}")))?;

        let tmp = self.path.with_extension("tmp");
        fs::write(&tmp, payload)
            .map_err(|err| CoreError::io(format!("writing {}", tmp.display()), err))?;
        fs::rename(&tmp, &self.path)
            .map_err(|err| CoreError::io(format!("replacing {}", self.path.display()), err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{SystemTime, UNIX_EPOCH};

    fn unique_temp_dir(prefix: &str) -> PathBuf {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos();
        std::env::temp_dir().join(format!("worldsaver-terminal-{prefix}-{nanos}"))
    }

    #[test]
    fn first_use_is_trusted_then_pinned() {
        let dir = unique_temp_dir("known-hosts");
        let path = dir.join("known_hosts.json");

        let mut store = HostKeyStore::load(&path).expect("load empty store");
        assert_eq!(store.validate("mc:2222", "SHA256:abc"), HostKeyStatus::NotFound);
        store.trust("mc:2222", "SHA256:abc").expect("trust host");

        let reloaded = HostKeyStore::load(&path).expect("reload store");
        assert_eq!(reloaded.validate("mc:2222", "SHA256:abc"), HostKeyStatus::Ok);
        assert_eq!(reloaded.validate("mc:2222", "SHA256:xyz"), HostKeyStatus::Changed);
        assert_eq!(reloaded.validate("other:22", "SHA256:abc"), HostKeyStatus::NotFound);

        let _ = std::fs::remove_dir_all(dir);
    }

    #[test]
    fn corrupt_store_is_a_config_error() {
        let dir = unique_temp_dir("known-hosts-bad");
        std::fs::create_dir_all(&dir).expect("create dir");
        let path = dir.join("known_hosts.json");
        std::fs::write(&path, "not json").expect("write file");

        assert!(matches!(
            HostKeyStore::load(&path),
            Err(CoreError::InvalidConfig(_))
        ));

        let _ = std::fs::remove_dir_all(dir);
    }
}
