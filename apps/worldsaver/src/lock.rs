use std::fs::{self, File, OpenOptions};
use std::path::Path;

use fs2::FileExt;

pub const LOCK_FILE: &str = ".worldsaver.lock";

/// Holds the single-instance lock on a backup directory until dropped.
pub struct LockGuard {
    _file: File,
}

pub fn acquire_lock(backup_dir: &Path) -> std::io::Result<LockGuard> {
    fs::create_dir_all(backup_dir)?;
    let file = OpenOptions::new()
        .create(true)
        .read(true)
        .write(true)
        .truncate(false)
        .open(backup_dir.join(LOCK_FILE))?;

    file.try_lock_exclusive()?;
    Ok(LockGuard { _file: file })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use std::time::{SystemTime, UNIX_EPOCH};

    fn unique_temp_dir(prefix: &str) -> PathBuf {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos();
        std::env::temp_dir().join(format!("worldsaver-{prefix}-{nanos}"))
    }

    #[test]
    fn second_lock_on_the_same_directory_fails() {
        let dir = unique_temp_dir("lock");
        let guard = acquire_lock(&dir).expect("first lock");
        assert!(acquire_lock(&dir).is_err());
        drop(guard);
        assert!(acquire_lock(&dir).is_ok());

        let _ = fs::remove_dir_all(dir);
    }
}
