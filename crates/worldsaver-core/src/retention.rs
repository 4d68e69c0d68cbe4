//! Day-bucketed retention over immutable backup artifacts.
//!
//! Each logical name is processed on its own. Relative to today:
//! - artifacts from the last `trim_days` days are kept untouched,
//! - artifacts from the days before that, up to `keep_days` back, are grouped
//!   per calendar day and only the newest `keep_last` of each day survive,
//! - anything older is trimmed,
//! - the group never drops below `max(min_keep, 1)` complete artifacts.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Days, Local, NaiveDate};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::{debug, info, warn};

use crate::errors::{CoreError, Result};
use crate::naming::ArtifactName;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Keep,
    Trim,
}

#[derive(Debug, Clone)]
pub struct Artifact {
    pub path: PathBuf,
    pub name: String,
    pub modified: DateTime<Local>,
    pub partial: bool,
    pub action: Action,
}

impl Artifact {
    pub fn new(path: PathBuf, name: String, modified: DateTime<Local>, partial: bool) -> Self {
        Self {
            path,
            name,
            modified,
            partial,
            action: Action::Keep,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RetentionPolicy {
    pub trim_days: u32,
    pub keep_days: u32,
    pub min_keep: usize,
    pub keep_last: usize,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            trim_days: 3,
            keep_days: 14,
            min_keep: 1,
            keep_last: 1,
        }
    }
}

impl RetentionPolicy {
    pub fn validate(&self) -> Result<()> {
        if self.trim_days == 0 {
            return Err(CoreError::config("trimDays must be at least 1"));
        }
        if self.keep_days < self.trim_days {
            return Err(CoreError::config(format!(
                "keepDays ({}) must not be smaller than trimDays ({})",
                self.keep_days, self.trim_days
            )));
        }
        if self.keep_last == 0 {
            return Err(CoreError::config("keepLast must be at least 1"));
        }
        Ok(())
    }

    fn boundary(today: NaiveDate, days: u32) -> Result<NaiveDate> {
        today
            .checked_sub_days(Days::new(u64::from(days.saturating_sub(1))))
            .ok_or_else(|| CoreError::DateOutOfRange(format!("{today} minus {days} days")))
    }
}

/// Assigns a fresh action to every artifact of one logical group.
///
/// Leaves the slice sorted newest first. Decisions depend only on the
/// modification times, the policy and `now`.
pub fn plan_group(
    artifacts: &mut [Artifact],
    policy: &RetentionPolicy,
    now: DateTime<Local>,
) -> Result<()> {
    policy.validate()?;

    let today = now.date_naive();
    let trim_boundary = RetentionPolicy::boundary(today, policy.trim_days)?;
    let keep_boundary = RetentionPolicy::boundary(today, policy.keep_days)?;

    artifacts.sort_by(|a, b| {
        b.modified
            .cmp(&a.modified)
            .then_with(|| b.path.cmp(&a.path))
    });

    let mut buckets: BTreeMap<NaiveDate, Vec<usize>> = BTreeMap::new();
    for (index, artifact) in artifacts.iter_mut().enumerate() {
        artifact.action = Action::Keep;
        let day = artifact.modified.date_naive();
        if day < keep_boundary {
            artifact.action = Action::Trim;
        } else if day < trim_boundary {
            buckets.entry(day).or_default().push(index);
        }
    }

    // bucket members are already newest first
    for members in buckets.values() {
        let mut survivors = 0usize;
        for &index in members {
            let artifact = &mut artifacts[index];
            if artifact.partial {
                artifact.action = Action::Trim;
            } else if survivors < policy.keep_last {
                survivors += 1;
            } else {
                artifact.action = Action::Trim;
            }
        }
    }

    let floor = policy.min_keep.max(1);
    let kept = artifacts
        .iter()
        .filter(|artifact| artifact.action == Action::Keep && !artifact.partial)
        .count();
    if kept < floor {
        let mut needed = floor - kept;
        for artifact in artifacts.iter_mut() {
            if needed == 0 {
                break;
            }
            if artifact.action == Action::Trim && !artifact.partial {
                artifact.action = Action::Keep;
                needed -= 1;
            }
        }
    }

    Ok(())
}

/// Lists every artifact in `dir`, grouped by logical name.
pub async fn scan(dir: &Path) -> Result<BTreeMap<String, Vec<Artifact>>> {
    let mut groups: BTreeMap<String, Vec<Artifact>> = BTreeMap::new();
    let mut entries = fs::read_dir(dir)
        .await
        .map_err(|err| CoreError::io(format!("listing {}", dir.display()), err))?;

    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|err| CoreError::io(format!("listing {}", dir.display()), err))?
    {
        let file_name = entry.file_name();
        let Some(parsed) = file_name.to_str().and_then(ArtifactName::parse) else {
            continue;
        };

        let path = entry.path();
        let metadata = entry
            .metadata()
            .await
            .map_err(|err| CoreError::io(format!("reading metadata of {}", path.display()), err))?;
        if !metadata.is_file() {
            continue;
        }
        let modified = metadata.modified().map_err(|err| {
            CoreError::io(format!("reading modification time of {}", path.display()), err)
        })?;

        groups.entry(parsed.name.clone()).or_default().push(Artifact::new(
            path,
            parsed.name,
            DateTime::<Local>::from(modified),
            parsed.partial,
        ));
    }

    Ok(groups)
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TrimReport {
    pub kept: usize,
    pub trimmed: usize,
    pub failed: usize,
}

/// Applies the policy to every group in `dir`, deleting what it marks for trim.
///
/// Deletions are independent; a failed delete is logged and counted, never raised.
pub async fn trim_directory(
    dir: &Path,
    policy: &RetentionPolicy,
    now: DateTime<Local>,
    dry_run: bool,
) -> Result<TrimReport> {
    policy.validate()?;
    let groups = scan(dir).await?;
    trim_groups(groups, policy, now, dry_run).await
}

/// Plans and deletes already scanned groups. See [`trim_directory`].
pub async fn trim_groups(
    groups: BTreeMap<String, Vec<Artifact>>,
    policy: &RetentionPolicy,
    now: DateTime<Local>,
    dry_run: bool,
) -> Result<TrimReport> {
    let mut report = TrimReport::default();

    for (name, mut group) in groups {
        plan_group(&mut group, policy, now)?;
        for artifact in &group {
            match artifact.action {
                Action::Keep => {
                    debug!(group = %name, path = %artifact.path.display(), "keeping backup");
                    report.kept += 1;
                }
                Action::Trim if dry_run => {
                    info!(group = %name, path = %artifact.path.display(), "would trim backup");
                    report.trimmed += 1;
                }
                Action::Trim => match fs::remove_file(&artifact.path).await {
                    Ok(()) => {
                        info!(group = %name, path = %artifact.path.display(), "trimmed backup");
                        report.trimmed += 1;
                    }
                    Err(err) => {
                        warn!(group = %name, path = %artifact.path.display(), "failed to trim backup: {err}");
                        report.failed += 1;
                    }
                },
            }
        }
    }

    Ok(report)
}
