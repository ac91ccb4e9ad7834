//! Download Commands
//!
//! Fetches single blobs or recreates whole directory trees from the local
//! store.

use super::{check_report, parse_digest, Session};
use crate::symbols;
use anyhow::{Context, Result};
use console::style;
use indicatif::{ProgressBar, ProgressStyle};
use std::io::Write;
use std::path::Path;
use std::time::Duration;

fn spinner(message: String) -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    pb.set_style(
        ProgressStyle::default_spinner()
            .template("{spinner:.green} [{elapsed_precise}] {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner()),
    );
    pb.enable_steady_tick(Duration::from_millis(100));
    pb.set_message(message);
    pb
}

/// Fetch one blob to `output`, or to stdout when no path is given
pub async fn blob(session: &Session, digest: &str, output: Option<&Path>) -> Result<()> {
    let digest = parse_digest(digest)?;
    let downloader = session.downloader();

    match output {
        Some(path) => {
            let report = downloader
                .download_blob(digest, path)
                .await
                .with_context(|| format!("Failed to download {}", digest))?;
            check_report(&report)?;
            eprintln!(
                "{} {} -> {} ({} bytes)",
                style(symbols::CHECK).green(),
                digest.hash_hex(),
                path.display(),
                digest.size()
            );
        }
        None => {
            let content = downloader
                .read_blob(digest)
                .await
                .with_context(|| format!("Failed to download {}", digest))?;
            let mut stdout = std::io::stdout().lock();
            stdout.write_all(&content).context("Failed to write to stdout")?;
            stdout.flush()?;
        }
    }

    Ok(())
}

/// Recreate the tree under `digest` at `target`, replacing whatever is there
pub async fn directory(session: &Session, digest: &str, target: &Path) -> Result<()> {
    let root = parse_digest(digest)?;

    clean_target(target)?;

    let pb = spinner(format!("Downloading {} to {}", root, target.display()));
    let result = session.downloader().download_directory(root, target).await;
    pb.finish_and_clear();

    let outcome = result.with_context(|| format!("Failed to download tree {}", root))?;
    let report = &outcome.report;

    println!(
        "{} {}",
        style(symbols::PACKAGE).cyan(),
        style("Download complete").green().bold()
    );
    println!("{}", symbols::HLINE);
    println!("  Target:             {}", target.display());
    println!("  Files:              {}", outcome.files);
    println!("  Empty directories:  {}", outcome.empty_directories);
    println!("  Symlinks:           {}", outcome.symlinks);
    println!(
        "  Transfer:           {} blobs, {} bytes in {:.2?}",
        report.downloaded.len(),
        report.bytes_transferred,
        report.duration
    );

    check_report(report)
}

fn clean_target(target: &Path) -> Result<()> {
    let meta = match std::fs::symlink_metadata(target) {
        Ok(meta) => meta,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e).with_context(|| format!("Cannot inspect {}", target.display())),
    };

    let removed = if meta.is_dir() {
        std::fs::remove_dir_all(target)
    } else {
        std::fs::remove_file(target)
    };
    removed.with_context(|| format!("Failed to clean {}", target.display()))?;

    tracing::debug!(target = %target.display(), "Removed existing download target");
    Ok(())
}
