//! Upload Command
//!
//! Uploads a file or directory tree to the local store.

use super::{check_report, Session};
use crate::symbols;
use anyhow::{Context, Result};
use console::style;
use indicatif::{ProgressBar, ProgressStyle};
use std::path::Path;
use std::time::Duration;

/// Run upload command
pub async fn run(session: &Session, path: &Path) -> Result<()> {
    if !path.exists() {
        anyhow::bail!("Path does not exist: {}", path.display());
    }

    let pb = ProgressBar::new_spinner();
    pb.set_style(
        ProgressStyle::default_spinner()
            .template("{spinner:.green} [{elapsed_precise}] {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner()),
    );
    pb.enable_steady_tick(Duration::from_millis(100));
    pb.set_message(format!("Uploading {}", path.display()));

    let result = session.uploader().upload_path(path).await;
    session.flush();
    pb.finish_and_clear();

    let outcome = result.with_context(|| format!("Failed to upload {}", path.display()))?;
    let report = &outcome.report;

    println!(
        "{} {} {}",
        style(symbols::CHECK).green(),
        style("Uploaded").green().bold(),
        path.display()
    );
    println!("  Root:      {}", outcome.root);
    println!("  Store:     {}", session.store_path.display());
    println!(
        "  Contents:  {} files, {} directories",
        outcome.files, outcome.directories
    );
    println!(
        "  Blobs:     {} uploaded, {} already present",
        report.uploaded.len(),
        report.already_present.len()
    );
    println!(
        "  Transfer:  {} bytes in {:.2?}",
        report.bytes_transferred, report.duration
    );

    check_report(report)
}
