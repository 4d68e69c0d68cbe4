use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{Local, NaiveDateTime};
use tokio::task::spawn_blocking;
use tracing::{debug, info, warn};
use walkdir::WalkDir;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

use worldsaver_core::naming::{ArtifactName, extras_name, world_artifact_name};
use worldsaver_core::{CoreError, Result, ServerKind};

/// Produces immutable backup artifacts from live folders.
#[async_trait]
pub trait WorldSnapshot: Send + Sync {
    async fn snapshot_world(
        &self,
        container: &str,
        world: &Path,
        kind: ServerKind,
        destination: &Path,
    ) -> Result<PathBuf>;

    async fn archive_extras(
        &self,
        container: &str,
        paths: &[PathBuf],
        destination: &Path,
    ) -> Result<PathBuf>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ZipSnapshot;

#[async_trait]
impl WorldSnapshot for ZipSnapshot {
    async fn snapshot_world(
        &self,
        container: &str,
        world: &Path,
        kind: ServerKind,
        destination: &Path,
    ) -> Result<PathBuf> {
        let artifact = world_artifact_name(container, world_name(world)?);
        pack(world, artifact, kind, destination).await
    }

    async fn archive_extras(
        &self,
        container: &str,
        paths: &[PathBuf],
        destination: &Path,
    ) -> Result<PathBuf> {
        let name = ArtifactName::new(extras_name(container), Local::now().naive_local(), "zip");
        let paths = paths.to_vec();
        let destination = destination.to_path_buf();
        spawn_blocking(move || {
            let mut entries = Vec::new();
            for path in &paths {
                if !path.exists() {
                    warn!(path = %path.display(), "extra path does not exist, skipping");
                    continue;
                }
                let Some(root) = path.file_name() else {
                    warn!(path = %path.display(), "extra path has no file name, skipping");
                    continue;
                };
                collect_entries(path, Path::new(root), &mut entries)?;
            }
            if entries.is_empty() {
                return Err(CoreError::Archive("none of the extra paths exist".into()));
            }
            write_archive(&destination, &name, &entries)
        })
        .await
        .map_err(|err| CoreError::Archive(format!("extras task failed: {err}")))?
    }
}

pub fn world_name(world: &Path) -> Result<&str> {
    world
        .file_name()
        .and_then(|name| name.to_str())
        .ok_or_else(|| CoreError::Archive(format!("invalid world path {}", world.display())))
}

/// Packs `world` on the blocking pool as `<artifact>.<now>.<ext>`.
pub async fn pack(
    world: &Path,
    artifact: String,
    kind: ServerKind,
    destination: &Path,
) -> Result<PathBuf> {
    let world = world.to_path_buf();
    let destination = destination.to_path_buf();
    let timestamp = Local::now().naive_local();
    spawn_blocking(move || pack_world(&world, &artifact, kind, &destination, timestamp))
        .await
        .map_err(|err| CoreError::Archive(format!("snapshot task failed: {err}")))?
}

/// Archives `world` into `destination`. Bedrock worlds keep their contents at the
/// archive root (`.mcworld`); Java worlds keep the world folder as the root.
pub fn pack_world(
    world: &Path,
    artifact: &str,
    kind: ServerKind,
    destination: &Path,
    timestamp: NaiveDateTime,
) -> Result<PathBuf> {
    if !world.is_dir() {
        return Err(CoreError::Archive(format!(
            "world folder {} does not exist",
            world.display()
        )));
    }

    let root = match kind {
        ServerKind::Bedrock => PathBuf::new(),
        ServerKind::Java => PathBuf::from(world_name(world)?),
    };
    let mut entries = Vec::new();
    collect_entries(world, &root, &mut entries)?;

    let name = ArtifactName::new(artifact, timestamp, kind.world_extension());
    write_archive(destination, &name, &entries)
}

struct Entry {
    source: PathBuf,
    archive_path: String,
    is_dir: bool,
}

fn collect_entries(path: &Path, root: &Path, entries: &mut Vec<Entry>) -> Result<()> {
    if path.is_file() {
        entries.push(Entry {
            source: path.to_path_buf(),
            archive_path: archive_path(root),
            is_dir: false,
        });
        return Ok(());
    }

    for entry in WalkDir::new(path).follow_links(false).sort_by_file_name() {
        let entry = entry.map_err(|err| {
            CoreError::Archive(format!("failed to walk {}: {err}", path.display()))
        })?;
        let rel = entry
            .path()
            .strip_prefix(path)
            .map_err(|err| CoreError::Archive(format!("failed to compute relative path: {err}")))?;
        let target = root.join(rel);
        if target.as_os_str().is_empty() {
            continue;
        }
        let file_type = entry.file_type();
        if file_type.is_dir() || file_type.is_file() {
            entries.push(Entry {
                source: entry.path().to_path_buf(),
                archive_path: archive_path(&target),
                is_dir: file_type.is_dir(),
            });
        }
    }
    Ok(())
}

fn archive_path(path: &Path) -> String {
    path.to_string_lossy().replace('\\', "/")
}

fn write_archive(destination: &Path, name: &ArtifactName, entries: &[Entry]) -> Result<PathBuf> {
    fs::create_dir_all(destination)
        .map_err(|err| CoreError::io(format!("creating {}", destination.display()), err))?;

    let final_path = destination.join(name.file_name());
    let partial_path = destination.join(name.clone().partial().file_name());

    if let Err(err) = write_entries(&partial_path, entries) {
        let _ = fs::remove_file(&partial_path);
        return Err(err);
    }
    fs::rename(&partial_path, &final_path)
        .map_err(|err| CoreError::io(format!("renaming {}", partial_path.display()), err))?;

    info!(path = %final_path.display(), entries = entries.len(), "archive written");
    Ok(final_path)
}

fn write_entries(path: &Path, entries: &[Entry]) -> Result<()> {
    let file = File::create(path)
        .map_err(|err| CoreError::io(format!("creating {}", path.display()), err))?;
    let mut zip = ZipWriter::new(file);
    let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);
    let zip_error = |entry: &str, err: zip::result::ZipError| {
        CoreError::Archive(format!("failed to write {entry}: {err}"))
    };

    for entry in entries {
        if entry.is_dir {
            zip.add_directory(entry.archive_path.as_str(), options)
                .map_err(|err| zip_error(&entry.archive_path, err))?;
            continue;
        }
        zip.start_file(entry.archive_path.as_str(), options)
            .map_err(|err| zip_error(&entry.archive_path, err))?;
        let mut source = File::open(&entry.source)
            .map_err(|err| CoreError::io(format!("reading {}", entry.source.display()), err))?;
        io::copy(&mut source, &mut zip)
            .map_err(|err| CoreError::io(format!("archiving {}", entry.source.display()), err))?;
    }

    let mut file = zip
        .finish()
        .map_err(|err| CoreError::Archive(format!("failed to finalize {}: {err}", path.display())))?;
    file.flush()
        .map_err(|err| CoreError::io(format!("flushing {}", path.display()), err))
}

/// Restores `archive` into `destination`. Entries that would land outside it are rejected.
pub async fn unpack(archive: &Path, destination: &Path) -> Result<usize> {
    let archive = archive.to_path_buf();
    let destination = destination.to_path_buf();
    spawn_blocking(move || unpack_blocking(&archive, &destination))
        .await
        .map_err(|err| CoreError::Archive(format!("unpack task failed: {err}")))?
}

fn unpack_blocking(archive: &Path, destination: &Path) -> Result<usize> {
    let file = File::open(archive)
        .map_err(|err| CoreError::io(format!("opening {}", archive.display()), err))?;
    let mut zip = ZipArchive::new(file)
        .map_err(|err| CoreError::Archive(format!("failed to read {}: {err}", archive.display())))?;
    fs::create_dir_all(destination)
        .map_err(|err| CoreError::io(format!("creating {}", destination.display()), err))?;

    let mut extracted = 0;
    for index in 0..zip.len() {
        let mut entry = zip
            .by_index(index)
            .map_err(|err| CoreError::Archive(format!("zip error: {err}")))?;
        let Some(relative) = entry.enclosed_name() else {
            return Err(CoreError::Archive(format!(
                "entry {:?} escapes the destination",
                entry.name()
            )));
        };
        let out_path = destination.join(relative);

        if entry.is_dir() {
            fs::create_dir_all(&out_path)
                .map_err(|err| CoreError::io(format!("creating {}", out_path.display()), err))?;
            continue;
        }
        if let Some(parent) = out_path.parent() {
            fs::create_dir_all(parent)
                .map_err(|err| CoreError::io(format!("creating {}", parent.display()), err))?;
        }
        let mut outfile = File::create(&out_path)
            .map_err(|err| CoreError::io(format!("creating {}", out_path.display()), err))?;
        io::copy(&mut entry, &mut outfile)
            .map_err(|err| CoreError::io(format!("extracting {}", out_path.display()), err))?;
        extracted += 1;
    }

    debug!(archive = %archive.display(), extracted, "archive restored");
    Ok(extracted)
}
