use std::path::PathBuf;

use anyhow::{Context, Result};

use worldsaver_core::ServerKind;
use worldsaver_core::naming::world_artifact_name;

use crate::archive::{pack, world_name};

pub async fn exec(
    world: PathBuf,
    destination: PathBuf,
    kind: ServerKind,
    container: Option<String>,
) -> Result<()> {
    let folder = world_name(&world)?;
    let artifact = match container.as_deref() {
        Some(container) => world_artifact_name(container, folder),
        None => folder.to_string(),
    };
    let artifact = pack(&world, artifact, kind, &destination)
        .await
        .with_context(|| format!("Failed to pack {}", world.display()))?;
    println!("Wrote {}", artifact.display());
    Ok(())
}
