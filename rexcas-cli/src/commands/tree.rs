//! Show-tree Command
//!
//! Prints every entry of a stored directory tree, one per line.

use super::{parse_digest, Session};
use anyhow::{Context, Result};

pub async fn run(session: &Session, digest: &str) -> Result<()> {
    let root = parse_digest(digest)?;
    let listing = session
        .downloader()
        .tree_listing(root)
        .await
        .with_context(|| format!("Failed to fetch tree {}", root))?;

    print!("{}", listing);
    if !listing.ends_with('\n') {
        println!();
    }
    Ok(())
}
