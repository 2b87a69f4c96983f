// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! mapfs FUSE host: mounts a tree of mappings onto host directories
//!
//! The tree can be replaced while mounted by feeding reconfiguration
//! requests on stdin (see `--reconfig`).

#[cfg(all(feature = "fuse", target_os = "linux"))]
mod adapter;
#[cfg(all(feature = "fuse", target_os = "linux"))]
mod notifier;
mod reconfig;
mod session;

#[cfg(all(feature = "fuse", target_os = "linux"))]
use adapter::MapFsFuse;
use anyhow::{Context, Result};
use clap::Parser;
use mapfs_core::{FsConfig, Mapping};
#[cfg(all(feature = "fuse", target_os = "linux"))]
use notifier::NotifierSlot;
use session::MapFsSession;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
enum MappingArgError {
    #[error("expected VIRTUAL:UNDERLYING[:rw|:ro], got {0:?}")]
    Malformed(String),
    #[error("unknown access mode {0:?}; expected rw or ro")]
    Mode(String),
}

/// Parse a `VIRTUAL:UNDERLYING[:rw|:ro]` command line mapping.
fn parse_mapping(arg: &str) -> Result<Mapping, MappingArgError> {
    let mut parts = arg.splitn(3, ':');
    let (Some(path), Some(underlying)) = (parts.next(), parts.next()) else {
        return Err(MappingArgError::Malformed(arg.to_string()));
    };
    if path.is_empty() || underlying.is_empty() {
        return Err(MappingArgError::Malformed(arg.to_string()));
    }
    let writable = match parts.next() {
        None | Some("ro") => false,
        Some("rw") => true,
        Some(other) => return Err(MappingArgError::Mode(other.to_string())),
    };
    Ok(Mapping::new(path, underlying, writable))
}

#[derive(Parser)]
#[command(version, about = "Mount a tree of mappings onto host directories")]
struct Args {
    /// Mount point for the filesystem
    mount_point: PathBuf,

    /// Configuration file (JSON)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Additional mapping, VIRTUAL:UNDERLYING[:rw|:ro]; wins over the config file
    #[arg(short, long = "mapping", value_parser = parse_mapping)]
    mappings: Vec<Mapping>,

    /// Allow other users to access the filesystem
    #[arg(long)]
    allow_other: bool,

    /// Allow root to access the filesystem
    #[arg(long)]
    allow_root: bool,

    /// Auto unmount on process exit
    #[arg(long)]
    auto_unmount: bool,

    /// Read JSON reconfiguration requests from stdin, one per line
    #[arg(long)]
    reconfig: bool,
}

fn load_config(config_path: Option<PathBuf>) -> Result<FsConfig> {
    match config_path {
        Some(path) => {
            let content = fs::read_to_string(&path)
                .with_context(|| format!("reading config {}", path.display()))?;
            let config: FsConfig = serde_json::from_str(&content)
                .with_context(|| format!("parsing config {}", path.display()))?;
            Ok(config)
        }
        None => Ok(FsConfig::default()),
    }
}

/// Merge command line mappings after the configured ones.
fn effective_config(config_path: Option<PathBuf>, extra: Vec<Mapping>) -> Result<FsConfig> {
    let mut config = load_config(config_path)?;
    for mapping in extra {
        config.mappings.push(mapping);
    }
    config.mappings.validate()?;
    Ok(config)
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    info!("Starting mapfs FUSE host");
    info!("Mount point: {}", args.mount_point.display());

    let config = effective_config(args.config, args.mappings)?;
    info!("Configuration loaded: {:?}", config);

    let session = Arc::new(MapFsSession::new(&config)?);

    #[cfg(all(feature = "fuse", target_os = "linux"))]
    {
        let filesystem = MapFsFuse::new(Arc::clone(&session));
        let notifier = NotifierSlot::new();

        let mut mount_options = vec![
            fuser::MountOption::FSName("mapfs".to_string()),
            fuser::MountOption::Subtype("mapfs".to_string()),
        ];

        info!(
            "Cache policy: attr={}ms entry={}ms",
            config.cache.attr_ttl_ms, config.cache.entry_ttl_ms
        );

        if args.allow_other {
            mount_options.push(fuser::MountOption::AllowOther);
        }

        if args.allow_root {
            mount_options.push(fuser::MountOption::AllowRoot);
        }

        if args.auto_unmount {
            mount_options.push(fuser::MountOption::AutoUnmount);
        }

        info!("Mounting filesystem...");
        let mounted = fuser::spawn_mount2(filesystem, &args.mount_point, &mount_options)?;
        notifier.install(mounted.notifier());

        if args.reconfig {
            info!("Reading reconfiguration requests from stdin");
            let stdin = std::io::stdin();
            let applied = reconfig::serve(stdin.lock(), std::io::stdout(), |spec| {
                session.reconfigure(&spec, &notifier)
            })?;
            info!(applied, "reconfiguration input closed");
        }

        info!("mapfs FUSE host mounted; blocking until unmount");
        mounted.join();
    }

    #[cfg(not(all(feature = "fuse", target_os = "linux")))]
    {
        tracing::warn!("FUSE support not compiled in. This binary is for testing only.");
        info!(
            top = session.root().current().inode(),
            "mapfs tree built successfully"
        );
        if args.reconfig {
            let stdin = std::io::stdin();
            reconfig::serve(stdin.lock(), std::io::stdout(), |spec| {
                session.reconfigure(&spec, &mapfs_core::NullInvalidator)
            })?;
        }
        info!("To enable FUSE support, compile with: cargo build --features fuse");
    }

    Ok(())
}
