// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tokio::sync::oneshot;

use resloader::config::{default_config_path, load_config, save_config};
use resloader::loader::{BytesDecoder, LoadListener, LoadRequest, TracingLogger};
use resloader::sync::resilient_lock;
use resloader::{HttpNetworkLoader, LoaderConfig, ResourceLoader};

const VERSION: &str = env!("CARGO_PKG_VERSION");

// ANSI color codes for terminal output
mod colors {
    pub const RESET: &str = "\x1b[0m";
    pub const RED: &str = "\x1b[31m";
    pub const GREEN: &str = "\x1b[32m";
    pub const YELLOW: &str = "\x1b[33m";
}

use colors::*;

/// Exit codes following sysexits.h conventions
mod exit_codes {
    /// General error - unspecified error
    pub const ERROR: i32 = 1;
    /// Temporary failure - the load was canceled
    pub const TEMP_FAIL: i32 = 75;
    /// Configuration error - invalid or missing config
    pub const CONFIG: i32 = 78;
}

use exit_codes::*;

/// resloader - fetch resources through a memory, disk and network cache.
#[derive(Parser)]
#[command(name = "resloader")]
#[command(version = VERSION)]
#[command(about = "Cache-backed resource loader. Disk first, network when needed.")]
#[command(propagate_version = true)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file to use instead of ~/.resloader/config.json
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Verbose mode: debug logging on stderr
    #[arg(short = 'v', long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Load a URL through the cache
    ///
    /// Examples:
    ///   resloader get https://example.com/logo.png --out logo.png
    ///   resloader get https://example.com/logo.png --key thumb
    Get {
        /// URL to load
        url: String,
        /// Auxiliary cache key (variants of the same URL)
        #[arg(short, long, default_value = "")]
        key: String,
        /// Write the resource here instead of stdout
        #[arg(short, long)]
        out: Option<PathBuf>,
    },

    /// Delete every entry in the disk cache
    Wipe,

    /// Show or create the configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

#[derive(Subcommand)]
enum ConfigCommands {
    /// Print the effective configuration as JSON
    Show,
    /// Print the config file path
    Path,
    /// Write a default config file if none exists
    Init,
}

/// How a CLI load ended.
enum Delivery {
    Loaded(Arc<Vec<u8>>),
    Failed(String),
    Canceled,
}

/// Forwards the single listener callback of a load to the waiting CLI.
struct OneShotListener {
    tx: Mutex<Option<oneshot::Sender<Delivery>>>,
}

impl OneShotListener {
    fn new() -> (Arc<Self>, oneshot::Receiver<Delivery>) {
        let (tx, rx) = oneshot::channel();
        (Arc::new(Self { tx: Mutex::new(Some(tx)) }), rx)
    }

    fn send(&self, delivery: Delivery) {
        let sender = resilient_lock(&self.tx).take();
        if let Some(tx) = sender {
            let _ = tx.send(delivery);
        }
    }
}

impl LoadListener<Vec<u8>> for OneShotListener {
    fn on_succeed(&self, _key: &str, resource: Arc<Vec<u8>>) {
        self.send(Delivery::Loaded(resource));
    }

    fn on_failed(&self, _key: &str, err: &anyhow::Error) {
        self.send(Delivery::Failed(format!("{:#}", err)));
    }

    fn on_canceled(&self, _key: &str) {
        self.send(Delivery::Canceled);
    }
}

fn init_logging(verbose: bool) {
    let level = if verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::WARN
    };
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_writer(io::stderr)
        .init();
}

fn config_path(cli_path: Option<&Path>) -> Result<PathBuf> {
    match cli_path {
        Some(path) => Ok(path.to_path_buf()),
        None => default_config_path(),
    }
}

fn build_loader(config: &LoaderConfig, verbose: bool) -> Result<ResourceLoader<Vec<u8>>> {
    let network = HttpNetworkLoader::from_config(config)?;
    let mut builder = ResourceLoader::builder(config.clone())
        .decoder(Arc::new(BytesDecoder))
        .network(Arc::new(network));
    if verbose {
        builder = builder.logger(Arc::new(TracingLogger));
    }
    Ok(builder.build()?)
}

async fn handle_get(config: LoaderConfig, url: String, aux_key: String, out: Option<PathBuf>, verbose: bool) -> Result<i32> {
    let loader = build_loader(&config, verbose)?;
    let (listener, rx) = OneShotListener::new();
    let started = Instant::now();

    loader.load_request(LoadRequest::new(&url).aux_key(aux_key), listener)?;
    let delivery = rx.await.context("Loader dropped the request without a callback")?;

    let code = match delivery {
        Delivery::Loaded(bytes) => {
            match &out {
                Some(path) => {
                    fs::write(path, bytes.as_slice())
                        .with_context(|| format!("Failed to write {:?}", path))?;
                    eprintln!(
                        "{GREEN}[OK]{RESET} {} bytes -> {} ({} ms)",
                        bytes.len(),
                        path.display(),
                        started.elapsed().as_millis()
                    );
                }
                None => {
                    let mut stdout = io::stdout().lock();
                    stdout.write_all(bytes.as_slice())?;
                    stdout.flush()?;
                }
            }
            if verbose {
                let stats = loader.stats().await?;
                eprintln!("{}", serde_json::to_string_pretty(&stats)?);
            }
            0
        }
        Delivery::Failed(message) => {
            eprintln!("{RED}[X]{RESET} Load failed: {}", message);
            ERROR
        }
        Delivery::Canceled => {
            eprintln!("{YELLOW}[!]{RESET} Load canceled");
            TEMP_FAIL
        }
    };

    loader.destroy();
    loader.closed().await;
    Ok(code)
}

async fn handle_wipe(config: LoaderConfig) -> Result<()> {
    if !config.disk_cache_enabled {
        bail!("Disk cache is disabled in the configuration");
    }
    let loader = build_loader(&config, false)?;
    if !loader.has_disk_cache() {
        bail!("Disk cache at {:?} could not be opened", config.resolved_cache_dir());
    }
    loader.wipe_disk_cache()?;
    loader.destroy();
    loader.closed().await;
    eprintln!("{GREEN}[OK]{RESET} Disk cache wiped: {}", config.resolved_cache_dir().display());
    Ok(())
}

fn handle_config(command: Option<ConfigCommands>, path: &Path, config: &LoaderConfig) -> Result<()> {
    match command.unwrap_or(ConfigCommands::Show) {
        ConfigCommands::Show => {
            println!("{}", serde_json::to_string_pretty(config)?);
        }
        ConfigCommands::Path => {
            println!("{}", path.display());
        }
        ConfigCommands::Init => {
            if path.exists() {
                eprintln!("{YELLOW}[!]{RESET} Config already exists: {}", path.display());
            } else {
                save_config(path, &LoaderConfig::default())?;
                eprintln!("{GREEN}[OK]{RESET} Wrote {}", path.display());
            }
        }
    }
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let path = config_path(cli.config.as_deref())?;
    let config = match load_config(&path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{RED}[!]{RESET} Invalid configuration: {:#}", e);
            std::process::exit(CONFIG);
        }
    };

    match cli.command {
        Commands::Config { command } => handle_config(command, &path, &config),
        Commands::Get { url, key, out } => {
            let runtime = tokio::runtime::Runtime::new().context("Failed to create Tokio runtime")?;
            let code = runtime.block_on(handle_get(config, url, key, out, cli.verbose))?;
            if code != 0 {
                std::process::exit(code);
            }
            Ok(())
        }
        Commands::Wipe => {
            let runtime = tokio::runtime::Runtime::new().context("Failed to create Tokio runtime")?;
            runtime.block_on(handle_wipe(config))
        }
    }
}
