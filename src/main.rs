//! sealfs - Encrypted, process-gated filesystem
//!
//! Usage:
//!   sealfs init                  - Write a default configuration
//!   sealfs mount [mount_point]   - Mount the filesystem
//!   sealfs status                - Show store status

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use sealfs::{
    config::{Config, LoggingConfig},
    crypto::KeyMaterial,
    fs::{FsCore, SealFs},
    gate::ProcfsResolver,
    metadata::{KvOptions, KvStore, SnapshotPersistence, TreePersistence},
};
use std::path::{Path, PathBuf};
use std::sync::{mpsc, Arc};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use zeroize::Zeroizing;

#[derive(Parser)]
#[command(name = "sealfs")]
#[command(author = "sealfs Contributors")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Encrypted, process-gated FUSE filesystem")]
struct Cli {
    /// Configuration file path (YAML or JSON)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a default configuration file
    Init {
        /// Mount point to record in the new configuration
        #[arg(long)]
        mount_point: Option<PathBuf>,

        /// Overwrite an existing configuration
        #[arg(long)]
        force: bool,
    },

    /// Mount the filesystem
    Mount {
        /// Mount point directory (overrides the configuration)
        mount_point: Option<PathBuf>,

        /// Read the passphrase from file
        #[arg(long)]
        password_file: Option<PathBuf>,

        /// Allow other users to access the mount
        #[arg(long)]
        allow_other: bool,
    },

    /// Show store status
    Status {
        /// Read the passphrase from file
        #[arg(long)]
        password_file: Option<PathBuf>,
    },
}

fn main() {
    let cli = Cli::parse();

    let config_path = cli
        .config
        .as_deref()
        .map(expand_tilde)
        .unwrap_or_else(Config::default_path);

    // Logging needs the config; fall back to defaults when it cannot be read
    let logging = load_config(&config_path)
        .map(|c| c.logging)
        .unwrap_or_default();
    if let Err(e) = init_logging(&logging, cli.verbose) {
        eprintln!("Failed to initialize logging: {:#}", e);
        std::process::exit(1);
    }

    if let Err(e) = run_command(cli.command, &config_path) {
        error!("Error: {:#}", e);
        std::process::exit(1);
    }
}

fn init_logging(logging: &LoggingConfig, verbose: bool) -> anyhow::Result<()> {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new(&logging.level))?
    };

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false);

    match &logging.file {
        Some(path) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("opening log file {:?}", path))?;
            builder
                .with_ansi(false)
                .with_writer(std::sync::Mutex::new(file))
                .try_init()
                .map_err(|e| anyhow::anyhow!("{}", e))?;
        }
        None => builder.try_init().map_err(|e| anyhow::anyhow!("{}", e))?,
    }
    Ok(())
}

fn run_command(command: Commands, config_path: &Path) -> anyhow::Result<()> {
    match command {
        Commands::Init { mount_point, force } => cmd_init(config_path, mount_point, force),

        Commands::Mount {
            mount_point,
            password_file,
            allow_other,
        } => cmd_mount(config_path, mount_point, password_file, allow_other),

        Commands::Status { password_file } => cmd_status(config_path, password_file),
    }
}

/// Load the config file, or defaults plus environment when there is none
fn load_config(path: &Path) -> anyhow::Result<Config> {
    if path.exists() {
        return Config::load(path).with_context(|| format!("loading {:?}", path));
    }

    let mut config = Config::default();
    config.apply_env_overrides();
    config.validate()?;
    Ok(config)
}

fn read_passphrase(password_file: Option<PathBuf>) -> anyhow::Result<Zeroizing<String>> {
    let password = match password_file {
        Some(path) => Zeroizing::new(
            std::fs::read_to_string(&path)
                .with_context(|| format!("reading password file {:?}", path))?
                .trim()
                .to_string(),
        ),
        None => Zeroizing::new(
            rpassword::prompt_password("Enter passphrase: ")
                .context("reading passphrase")?
                .trim()
                .to_string(),
        ),
    };

    if password.is_empty() {
        bail!("a passphrase is required");
    }
    Ok(password)
}

fn cmd_init(config_path: &Path, mount_point: Option<PathBuf>, force: bool) -> anyhow::Result<()> {
    info!("Initializing sealfs...");

    if config_path.exists() && !force {
        bail!(
            "configuration {:?} already exists (use --force to overwrite)",
            config_path
        );
    }

    let mut config = Config::default();
    if let Some(mount_point) = mount_point {
        config.mount.mount_point = mount_point;
    }
    config.save(config_path)?;

    info!("Configuration saved to {:?}", config_path);
    info!("Mount point: {:?}", config.mount.mount_point);
    info!("Store: {:?}", config.storage.path);
    info!("Add executables to policy.allow before mounting");
    Ok(())
}

fn cmd_mount(
    config_path: &Path,
    mount_point: Option<PathBuf>,
    password_file: Option<PathBuf>,
    allow_other: bool,
) -> anyhow::Result<()> {
    let mut config = load_config(config_path)?;
    if let Some(mount_point) = mount_point {
        config.mount.mount_point = mount_point;
    }
    config.mount.allow_other |= allow_other;

    if config.policy.allow.is_empty() && config.policy.default_action != "pass" {
        warn!("Policy allows no executables; every other process will be denied");
    }

    let password = read_passphrase(password_file)?;
    let keys = KeyMaterial::from_passphrase(password.as_bytes())?;
    drop(password);

    std::fs::create_dir_all(&config.mount.mount_point)
        .with_context(|| format!("creating mount point {:?}", config.mount.mount_point))?;

    info!("Starting sealfs...");
    let core = Arc::new(
        FsCore::mount(&config, &keys, Arc::new(ProcfsResolver)).context("opening the store")?,
    );
    info!("Namespace ready: {} nodes", core.node_count());

    // Woken by SIGINT/SIGTERM or by an external unmount
    let (tx, rx) = mpsc::channel();
    let signal_tx = tx.clone();
    ctrlc::set_handler(move || {
        let _ = signal_tx.send(());
    })
    .context("installing signal handler")?;

    let fs = SealFs::new(core.clone(), &config.mount).notify_unmount(tx);
    let options = SealFs::mount_options(&config.mount);

    info!("Mounting at {:?}", config.mount.mount_point);
    let session = fuser::spawn_mount2(fs, &config.mount.mount_point, &options)
        .with_context(|| format!("mounting at {:?}", config.mount.mount_point))?;

    let _ = rx.recv();
    info!("Unmounting {:?}", config.mount.mount_point);
    session.join();

    match Arc::try_unwrap(core) {
        Ok(core) => core.close().context("closing the store")?,
        Err(core) => core.flush().context("flushing the store")?,
    }
    info!("Unmounted {:?}", config.mount.mount_point);
    Ok(())
}

fn cmd_status(config_path: &Path, password_file: Option<PathBuf>) -> anyhow::Result<()> {
    let config = load_config(config_path)?;

    println!("sealfs Status");
    println!("=============");
    println!();
    println!("Configuration: {:?}", config_path);
    println!("Mount point: {:?}", config.mount.mount_point);
    println!("Store: {:?}", config.storage.path);
    println!("Store encryption: {}", if config.storage.encrypt_store { "enabled" } else { "disabled" });
    println!("Content encoding: {:?}, IV mode: {:?}", config.content.encoding, config.content.iv_mode);
    println!(
        "Policy: default {}, {} allowed, {} denied",
        config.policy.default_action,
        config.policy.allow.len(),
        config.policy.deny.len()
    );

    if config.storage.in_memory {
        println!("Store is in-memory; nothing persisted");
        return Ok(());
    }
    if !config.storage.path.exists() {
        println!("Store not created yet (mount once to initialize)");
        return Ok(());
    }

    let encryption_key = if config.storage.encrypt_store {
        let password = read_passphrase(password_file)?;
        Some(*KeyMaterial::from_passphrase(password.as_bytes())?.store_key())
    } else {
        None
    };

    let kv = Arc::new(KvStore::open(KvOptions {
        path: config.storage.path.clone(),
        encryption_key,
        in_memory: false,
    })?);

    match SnapshotPersistence::new(kv.clone()).load()? {
        Some(tree) => println!("Namespace snapshot: {} nodes", tree.len()),
        None => println!("Namespace snapshot: absent"),
    }

    let stats = kv.stats()?;
    println!("Keys: {}", stats.key_count);
    println!("Stored bytes: {}", stats.stored_bytes);
    println!("Size on disk: {} bytes", stats.size_on_disk);

    if let Ok(kv) = Arc::try_unwrap(kv) {
        kv.close()?;
    }
    Ok(())
}

fn expand_tilde(path: &Path) -> PathBuf {
    if let Ok(rest) = path.strip_prefix("~") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    path.to_path_buf()
}
