use std::path::PathBuf;

use anyhow::{Context, Result};

use crate::archive::unpack;

pub async fn exec(archive: PathBuf, destination: PathBuf) -> Result<()> {
    let extracted = unpack(&archive, &destination)
        .await
        .with_context(|| format!("Failed to unpack {}", archive.display()))?;
    println!(
        "Restored {extracted} file(s) into {}",
        destination.display()
    );
    Ok(())
}
