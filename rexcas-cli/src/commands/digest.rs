//! Digest Command
//!
//! Computes the digest of a local file or directory tree without uploading.

use super::Session;
use anyhow::{Context, Result};
use std::path::Path;

pub async fn run(session: &Session, path: &Path) -> Result<()> {
    let prepared = session
        .uploader()
        .prepare(path)
        .await
        .with_context(|| format!("Failed to digest {}", path.display()))?;
    session.flush();

    println!("{}", prepared.root);
    Ok(())
}
