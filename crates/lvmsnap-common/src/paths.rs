//! Well-known paths and device addressing.

use std::path::{Path, PathBuf};

/// Name of the logical volume that holds the metadata database.
pub const METADATA_VOLUME: &str = "contd-metadata-holder";

/// File name of the metadata database inside the metadata volume.
pub const METADATA_DB: &str = "metadata.db";

/// Default mount point of the metadata volume.
pub const DEFAULT_METADATA_MOUNT: &str = "/mnt/contd-lvm-snapshotter-db-holder";

/// Default device root under which LVM exposes `<vg>/<lv>` nodes.
pub const DEFAULT_DEV_ROOT: &str = "/dev";

/// Paths used by the snapshotter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapPaths {
    /// Device root (default: /dev).
    pub dev_root: PathBuf,
    /// Mount point of the metadata volume.
    pub metadata_mount: PathBuf,
}

impl SnapPaths {
    /// Create paths with default locations.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Override the metadata volume mount point.
    #[must_use]
    pub fn with_metadata_mount(mut self, path: impl Into<PathBuf>) -> Self {
        self.metadata_mount = path.into();
        self
    }

    /// Override the device root.
    #[must_use]
    pub fn with_dev_root(mut self, path: impl Into<PathBuf>) -> Self {
        self.dev_root = path.into();
        self
    }

    /// Device node of a logical volume: `<dev_root>/<vg>/<lv>`.
    #[must_use]
    pub fn device(&self, volume_group: &str, volume: &str) -> PathBuf {
        self.dev_root.join(volume_group).join(volume)
    }

    /// Metadata database file.
    #[must_use]
    pub fn metadata_db(&self) -> PathBuf {
        self.metadata_mount.join(METADATA_DB)
    }

    /// Metadata volume mount point.
    #[must_use]
    pub fn metadata_mount(&self) -> &Path {
        &self.metadata_mount
    }
}

impl Default for SnapPaths {
    fn default() -> Self {
        Self {
            dev_root: PathBuf::from(DEFAULT_DEV_ROOT),
            metadata_mount: PathBuf::from(DEFAULT_METADATA_MOUNT),
        }
    }
}
