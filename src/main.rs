use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::{Parser, Subcommand};

use davsync::config::{Config, ConfigOverrides};
use davsync::events::EventBus;
use davsync::folder::Folder;
use davsync::logging;
use davsync::queue::JobQueue;

#[derive(Parser, Debug)]
#[command(name = "davsync", version)]
struct Cli {
    /// Path to config file
    #[arg(short = 'c', long = "config")]
    config: Option<PathBuf>,

    /// Server URL override (takes precedence over env/config)
    #[arg(long = "server")]
    server: Option<String>,

    /// Username override (takes precedence over env/config)
    #[arg(long = "user")]
    user: Option<String>,

    /// Sync a single local directory instead of the configured roots
    #[arg(long = "local-dir")]
    local_dir: Option<PathBuf>,

    /// Remote collection for --local-dir (defaults to "/")
    #[arg(long = "remote-path")]
    remote_path: Option<String>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the sync daemon (default when no subcommand is given)
    Daemon,

    /// Run one sync pass over every configured root, then exit
    Sync,

    /// Print the resolved config file path
    ConfigPath,

    /// Print version information
    Version,
}

#[tokio::main]
async fn main() -> Result<()> {
    let Cli {
        config,
        server,
        user,
        local_dir,
        remote_path,
        command,
    } = Cli::parse();
    let resolved_config = Config::resolve_config_path(config.as_deref());

    let overrides = ConfigOverrides {
        server_url: server,
        username: user,
        local_dir,
        remote_path,
    };

    match command {
        Some(Commands::ConfigPath) => {
            println!("{}", resolved_config.display());
            Ok(())
        }
        Some(Commands::Version) => {
            println!("{}", detailed_version());
            Ok(())
        }
        Some(Commands::Sync) => {
            let cfg = Config::load_with_overrides(&resolved_config, overrides)?;
            run_sync_once(cfg).await
        }
        Some(Commands::Daemon) | None => {
            let cfg = Config::load_with_overrides(&resolved_config, overrides)?;
            run_daemon(cfg).await
        }
    }
}

async fn run_daemon(cfg: Config) -> Result<()> {
    let log_path = logging::init_default_log_file()?;
    logging::info(format!(
        "daemon start version={} config={} log={}",
        env!("CARGO_PKG_VERSION"),
        cfg.config_path
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_default(),
        log_path.display()
    ));

    let mut folders = build_folders(&cfg)?;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                logging::info("daemon shutdown");
                for folder in &mut folders {
                    folder.abort();
                }
                return Ok(());
            }
            _ = tokio::time::sleep(Duration::from_secs(1)) => {
                // Roots run strictly one at a time.
                for folder in &mut folders {
                    match folder.tick().await {
                        Ok(Some(result)) => {
                            logging::info_kv(
                                "sync run finished",
                                &[
                                    ("root", &folder.root().display().to_string()),
                                    ("items", &result.items_total.to_string()),
                                    ("errors", &result.items_errored.to_string()),
                                ],
                            );
                        }
                        Ok(None) => {}
                        Err(err) => {
                            logging::error(format!(
                                "sync failed for {}: {err:#}",
                                folder.root().display()
                            ));
                        }
                    }
                }
            }
        }
    }
}

async fn run_sync_once(cfg: Config) -> Result<()> {
    let mut folders = build_folders(&cfg)?;
    let mut failed = false;
    for folder in &mut folders {
        match folder.sync_once().await {
            Ok(result) => {
                println!(
                    "{}: {} items, {} completed, {} errors, {} conflicts",
                    folder.root().display(),
                    result.items_total,
                    result.items_completed,
                    result.items_errored,
                    result.items_conflicted
                );
                if result.first_fatal_error.is_some() {
                    failed = true;
                }
            }
            Err(err) => {
                eprintln!("{}: sync failed: {err:#}", folder.root().display());
                failed = true;
            }
        }
    }
    if failed {
        anyhow::bail!("one or more roots failed to sync");
    }
    Ok(())
}

fn build_folders(cfg: &Config) -> Result<Vec<Folder>> {
    if cfg.roots.is_empty() {
        anyhow::bail!("no sync roots configured; add roots to the config or pass --local-dir");
    }
    let queue = Arc::new(JobQueue::default());
    let events = EventBus::new();
    let mut folders = Vec::new();
    for root_cfg in &cfg.roots {
        folders.push(Folder::new(cfg, root_cfg, queue.clone(), events.clone())?);
    }
    Ok(folders)
}

fn detailed_version() -> String {
    let version = env!("CARGO_PKG_VERSION");
    format!(
        "{} (rust; {}/{})",
        version,
        std::env::consts::OS,
        std::env::consts::ARCH
    )
}
