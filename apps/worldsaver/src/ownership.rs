use std::fs;
use std::os::unix::fs::{PermissionsExt, chown};
use std::path::Path;

use tracing::{debug, warn};

use worldsaver_core::naming::ArtifactName;

use crate::config::Ownership;

/// Applies owner and mode to every backup artifact in `dir`. Failures are logged only.
pub fn apply_ownership(dir: &Path, ownership: &Ownership) -> usize {
    if ownership.is_empty() {
        return 0;
    }
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) => {
            warn!(dir = %dir.display(), "failed to list backups for ownership fixup: {err}");
            return 0;
        }
    };

    let mut updated = 0;
    for entry in entries.filter_map(Result::ok) {
        let path = entry.path();
        let is_artifact = path
            .file_name()
            .and_then(|name| name.to_str())
            .and_then(ArtifactName::parse)
            .is_some_and(|name| !name.partial);
        if !is_artifact || !path.is_file() {
            continue;
        }

        let mut ok = true;
        if ownership.uid.is_some() || ownership.gid.is_some() {
            if let Err(err) = chown(&path, ownership.uid, ownership.gid) {
                warn!(path = %path.display(), "chown failed: {err}");
                ok = false;
            }
        }
        if let Some(mode) = ownership.mode {
            if let Err(err) = fs::set_permissions(&path, fs::Permissions::from_mode(mode)) {
                warn!(path = %path.display(), "chmod failed: {err}");
                ok = false;
            }
        }
        if ok {
            debug!(path = %path.display(), "ownership applied");
            updated += 1;
        }
    }
    updated
}
