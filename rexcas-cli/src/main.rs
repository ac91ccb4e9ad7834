//! rexcas CLI
//!
//! Command-line tool for the rexcas transfer engine over a local store.
//!
//! Usage:
//!   rexcas digest <path>
//!   rexcas upload <path>
//!   rexcas show-tree <digest>
//!   rexcas download-blob <digest> [-o <path>]
//!   rexcas download-dir <digest> <path>
//!   rexcas config show|path|init

mod commands;
mod config;
mod symbols;

use anyhow::Result;
use clap::{Parser, Subcommand};
use commands::{digest, download, tree, upload, Session, SessionOptions};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "rexcas")]
#[command(author, version, about = "rexcas content-addressable storage CLI", long_about = None)]
struct Cli {
    /// Local store directory (overrides config file)
    #[arg(long, global = true, env = "REXCAS_STORE")]
    store: Option<PathBuf>,

    /// Maximum concurrent CAS batch/stream operations
    #[arg(long, global = true)]
    cas_concurrency: Option<usize>,

    /// Per-RPC timeouts, e.g. "default=30s,Read=0,FindMissingBlobs=5s"
    #[arg(long, global = true)]
    rpc_timeouts: Option<String>,

    /// Verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the digest of a file or directory tree
    Digest {
        /// File or directory
        path: PathBuf,
    },

    /// Upload a file or directory tree to the store
    Upload {
        /// File or directory to upload
        path: PathBuf,
    },

    /// List every entry of a stored directory tree
    ShowTree {
        /// Root directory digest (hash/size)
        digest: String,
    },

    /// Fetch one blob
    DownloadBlob {
        /// Blob digest (hash/size)
        digest: String,

        /// Output file (stdout when omitted)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Recreate a stored directory tree locally
    DownloadDir {
        /// Root directory digest (hash/size)
        digest: String,

        /// Target directory (removed first if it exists)
        path: PathBuf,
    },

    /// Manage CLI configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

#[derive(Subcommand)]
enum ConfigCommands {
    /// Show current configuration
    Show,
    /// Show config file path
    Path,
    /// Create default config file
    Init {
        /// Overwrite existing config
        #[arg(long)]
        force: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::WARN
    };
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env().add_directive(level.into()))
        .with_writer(std::io::stderr)
        .init();

    rexcas_client::metrics::init_metrics();

    // Load configuration from ~/.rexcas/config.toml, CLI args override it
    let cfg = config::load_config();
    let options = SessionOptions {
        store: cli.store,
        cas_concurrency: cli.cas_concurrency,
        rpc_timeouts: cli.rpc_timeouts,
    };

    match cli.command {
        Commands::Digest { path } => {
            let session = Session::open(cfg, options)?;
            digest::run(&session, &path).await?;
        }

        Commands::Upload { path } => {
            let session = Session::open(cfg, options)?;
            upload::run(&session, &path).await?;
        }

        Commands::ShowTree { digest } => {
            let session = Session::open(cfg, options)?;
            tree::run(&session, &digest).await?;
        }

        Commands::DownloadBlob { digest, output } => {
            let session = Session::open(cfg, options)?;
            download::blob(&session, &digest, output.as_deref()).await?;
        }

        Commands::DownloadDir { digest, path } => {
            let session = Session::open(cfg, options)?;
            download::directory(&session, &digest, &path).await?;
        }

        Commands::Config { command } => {
            handle_config_command(command)?;
        }
    }

    Ok(())
}

/// Handle config subcommands
fn handle_config_command(command: Option<ConfigCommands>) -> Result<()> {
    use console::style;

    match command {
        None | Some(ConfigCommands::Show) => {
            let cfg = config::load_config();
            let client = &cfg.client;
            println!();
            println!("{}", style("rexcas Configuration").bold().underlined());
            println!();
            println!("{}", style("[client]").cyan());
            println!("  concurrency_limit = {}", client.concurrency_limit);
            println!("  max_batch_size = {}", client.max_batch_size);
            println!("  large_blob_threshold = {}", client.large_blob_threshold);
            println!("  chunk_size = {}", client.chunk_size);
            println!("  inline_threshold = {}", client.inline_threshold);
            println!(
                "  assume_missing_on_presence_failure = {}",
                client.assume_missing_on_presence_failure
            );
            println!("  max_tree_depth = {}", client.max_tree_depth);
            println!();
            println!("{}", style("[client.retry]").cyan());
            println!("  max_attempts = {}", client.retry.max_attempts);
            println!("  initial_backoff_ms = {}", client.retry.initial_backoff_ms);
            println!("  max_backoff_ms = {}", client.retry.max_backoff_ms);
            println!("  retry_budget = {}", client.retry.retry_budget);
            println!();

            // Effective timeouts, after defaults and overrides are merged
            println!("{}", style("[effective rpc timeouts]").cyan());
            match client.resolved_timeouts() {
                Ok(timeouts) => {
                    for (kind, timeout) in timeouts.iter() {
                        match timeout {
                            Some(t) => println!("  {} = {:?}", kind, t),
                            None => println!("  {} = none", kind),
                        }
                    }
                }
                Err(e) => println!("  {} {}", style(symbols::CROSS).red(), e),
            }
            println!();

            println!("{}", style("[cli]").cyan());
            match cfg.store_path() {
                Ok(path) => println!("  store_path = \"{}\"", path.display()),
                Err(e) => println!("  store_path = <{}>", e),
            }
            println!("  persist_file_cache = {}", cfg.cli.persist_file_cache);
            println!();

            if let Ok(path) = config::config_file_path() {
                println!("{} {}", style("Config file:").dim(), path.display());
                if !path.exists() {
                    println!(
                        "{} Run '{}' to create it",
                        style("(not created yet)").yellow(),
                        style("rexcas config init").green()
                    );
                }
            }
        }

        Some(ConfigCommands::Path) => {
            if let Ok(path) = config::config_file_path() {
                println!("{}", path.display());
            }
        }

        Some(ConfigCommands::Init { force }) => {
            let path = config::config_file_path()?;
            if path.exists() && !force {
                println!(
                    "{} Config file already exists at {}",
                    style(symbols::WARN).yellow(),
                    path.display()
                );
                println!("Use --force to overwrite");
                return Ok(());
            }

            config::save_config(&config::RexcasConfig::default())?;
            println!(
                "{} Config file created at {}",
                style(symbols::CHECK).green(),
                path.display()
            );
        }
    }

    Ok(())
}
