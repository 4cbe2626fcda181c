//! token-cache-probe - Inspect and exercise a persisted token cache
//!
//! Builds the same storage an application would, so it can be used to check
//! whether the platform secret store works on a given machine.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{ArgAction, Parser, Subcommand};
use tokio::sync::broadcast::error::RecvError;
use tracing_subscriber::EnvFilter;

use token_cache_persistence::{
    default_cache_directory, CacheHelper, StorageCreationProperties,
    StorageCreationPropertiesBuilder,
};

/// Inspect a persisted token cache
#[derive(Parser, Debug)]
#[command(name = "token-cache-probe")]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Increase verbosity (-v debug, -vv trace)
    #[arg(short, long, global = true, action = ArgAction::Count)]
    verbose: u8,

    /// JSON file with storage creation properties
    #[arg(short, long, global = true, env = "TOKEN_CACHE_CONFIG")]
    config: Option<PathBuf>,

    /// Cache file name, when no config file is given
    #[arg(long, global = true, default_value = "msal.cache")]
    name: String,

    /// Cache directory, when no config file is given
    #[arg(long, global = true)]
    dir: Option<PathBuf>,

    /// Fall back to a plain file if Secret Service is unavailable
    #[arg(long, global = true)]
    unprotected_fallback: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Write, read back and delete a throwaway entry
    Verify,
    /// Print the size of the persisted blob
    Read,
    /// Delete the persisted blob
    Clear,
    /// Print an event whenever the cache file changes
    Watch {
        /// Poll interval in milliseconds
        #[arg(long, default_value_t = 1000, value_parser = clap::value_parser!(u64).range(1..))]
        interval_ms: u64,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = match cli.verbose {
        0 => "token_cache_persistence=info",
        1 => "token_cache_persistence=debug",
        _ => "token_cache_persistence=trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(level.parse()?))
        .with_target(false)
        .init();

    let props = properties(&cli)?;
    tracing::debug!("Using cache file {}", props.cache_file_path().display());
    let helper = CacheHelper::create(&props).context("creating cache storage")?;

    match cli.command {
        Commands::Verify => {
            helper.verify_persistence()?;
            println!("Persistence verified for {}", props.cache_file_path().display());
        }
        Commands::Read => {
            let data = helper.storage().try_read_data()?;
            println!("{} bytes", data.len());
        }
        Commands::Clear => {
            helper.clear()?;
            println!("Cleared {}", props.cache_file_path().display());
        }
        Commands::Watch { interval_ms } => {
            let runtime = tokio::runtime::Runtime::new().context("starting runtime")?;
            runtime.block_on(watch(helper, Duration::from_millis(interval_ms)))?;
        }
    }

    Ok(())
}

fn properties(cli: &Cli) -> Result<StorageCreationProperties> {
    if let Some(path) = &cli.config {
        return Ok(StorageCreationProperties::from_json_file(path)?);
    }

    let dir = match &cli.dir {
        Some(dir) => dir.clone(),
        None => default_cache_directory().context("no default cache directory; pass --dir")?,
    };
    let mut builder = StorageCreationPropertiesBuilder::new(&cli.name, dir)
        .with_mac_keychain("MSALCache", "MSALCache")
        .with_linux_keyring(
            "msal.cache",
            "default",
            "MSALCache",
            ("MsalClientID", "token-cache-probe"),
            ("MsalVersion", "1.0"),
        );
    if cli.unprotected_fallback {
        builder = builder.with_linux_unprotected_file_fallback();
    }
    Ok(builder.build()?)
}

async fn watch(helper: CacheHelper, interval: Duration) -> Result<()> {
    let mut events = helper.subscribe();
    let watcher = helper.watch(interval);
    tracing::info!("Watching {}, press Ctrl+C to stop", helper.storage().cache_path().display());

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            event = events.recv() => match event {
                Ok(event) => println!("{}", serde_json::to_string(&event)?),
                Err(RecvError::Lagged(n)) => tracing::warn!("Missed {} change events", n),
                Err(RecvError::Closed) => break,
            },
        }
    }

    watcher.stop().await;
    Ok(())
}
