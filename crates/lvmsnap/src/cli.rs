//! Command-line interface of `lvmsnapd`.

use std::path::PathBuf;

use clap::{Parser, ValueEnum};
use lvmsnap_common::SnapResult;

use crate::config::{RawConfig, SnapshotterConfig};

/// Default socket address.
pub const DEFAULT_ADDRESS: &str = "/run/lvmsnap/lvmsnap.sock";

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum LogFormat {
    /// Human-readable lines.
    #[default]
    Text,
    /// One JSON object per event.
    Json,
}

/// lvmsnapd - copy-on-write snapshots on LVM thin volumes
#[derive(Parser, Debug)]
#[command(name = "lvmsnapd")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Unix socket to listen on
    #[arg(long, env = "LVMSNAP_ADDRESS", default_value = DEFAULT_ADDRESS)]
    pub addr: PathBuf,

    /// Volume group holding the snapshots
    #[arg(long, env = "LVMSNAP_VG")]
    pub vgname: Option<String>,

    /// Thin pool inside the volume group
    #[arg(long, env = "LVMSNAP_POOL")]
    pub lvpoolname: Option<String>,

    /// TOML configuration file
    #[arg(short, long, env = "LVMSNAP_CONFIG")]
    pub config: Option<PathBuf>,

    /// Directory for transient mount points
    #[arg(long)]
    pub root_path: Option<PathBuf>,

    /// Virtual size of fresh volumes (e.g. 10G)
    #[arg(long)]
    pub img_size: Option<String>,

    /// Filesystem for fresh volumes
    #[arg(long)]
    pub fs_type: Option<String>,

    /// Enable debug logging
    #[arg(long)]
    pub debug: bool,

    /// Log output format
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    pub log_format: LogFormat,
}

impl Cli {
    /// Configuration file contents with command-line values on top.
    ///
    /// # Errors
    ///
    /// Fails if the configuration file cannot be read or parsed.
    pub fn raw_config(&self) -> SnapResult<RawConfig> {
        let mut raw = match &self.config {
            Some(path) => RawConfig::load(path)?,
            None => RawConfig::default(),
        };

        if let Some(vg) = &self.vgname {
            raw.vol_group.clone_from(vg);
        }
        if let Some(pool) = &self.lvpoolname {
            raw.thin_pool.clone_from(pool);
        }
        if self.root_path.is_some() {
            raw.root_path.clone_from(&self.root_path);
        }
        if self.img_size.is_some() {
            raw.img_size.clone_from(&self.img_size);
        }
        if self.fs_type.is_some() {
            raw.fs_type.clone_from(&self.fs_type);
        }
        Ok(raw)
    }

    /// Validated configuration.
    ///
    /// # Errors
    ///
    /// Fails if the merged configuration is incomplete or invalid.
    pub fn snapshotter_config(&self) -> SnapResult<SnapshotterConfig> {
        self.raw_config()?.validate(None)
    }
}
