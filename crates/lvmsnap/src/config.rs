//! Snapshotter configuration.
//!
//! [`RawConfig`] is what a TOML file (or the command line) supplies;
//! [`SnapshotterConfig`] is the validated, immutable value every component
//! receives.

use std::path::{Path, PathBuf};
use std::time::Duration;

use lvmsnap_common::{ByteSize, SnapError, SnapPaths, SnapResult, VolumeName};
use serde::Deserialize;

use crate::exec::RetryPolicy;

/// Root for transient mounts when neither the file nor the caller sets one.
pub const DEFAULT_ROOT_PATH: &str = "/mnt";

/// Virtual size of fresh thin volumes.
pub const DEFAULT_IMAGE_SIZE: &str = "10G";

/// Filesystem fresh volumes are formatted with.
pub const DEFAULT_FS_TYPE: &str = "xfs";

/// Unvalidated configuration, as read from TOML.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RawConfig {
    /// Directory holding transient mount points.
    pub root_path: Option<PathBuf>,
    /// Volume group name.
    pub vol_group: String,
    /// Thin pool name inside the volume group.
    pub thin_pool: String,
    /// Virtual size of fresh volumes, e.g. `10G`.
    pub img_size: Option<String>,
    /// Filesystem type, e.g. `xfs`.
    pub fs_type: Option<String>,
    /// Mount point of the metadata volume.
    pub metadata_mount_path: Option<PathBuf>,
    /// Root of the device tree.
    pub dev_root: Option<PathBuf>,
    /// Attempts per LVM command.
    pub retry_attempts: Option<u32>,
    /// Pause between attempts, in milliseconds.
    pub retry_backoff_ms: Option<u64>,
}

impl RawConfig {
    /// Parse a TOML document.
    ///
    /// # Errors
    ///
    /// Returns [`SnapError::Config`] on malformed TOML or unknown value types.
    pub fn from_toml_str(contents: &str) -> SnapResult<Self> {
        toml::from_str(contents).map_err(|e| SnapError::Config {
            message: e.to_string(),
        })
    }

    /// Read and parse a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the file cannot be read, or
    /// [`SnapError::Config`] if it does not parse.
    pub fn load(path: &Path) -> SnapResult<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_toml_str(&contents)
    }

    /// Validate and fill in defaults.
    ///
    /// An empty `root_path` falls back to `default_root`, then to
    /// [`DEFAULT_ROOT_PATH`].
    ///
    /// # Errors
    ///
    /// Fails if the volume group or thin pool is missing, or if the image
    /// size or pool name is malformed.
    pub fn validate(self, default_root: Option<&Path>) -> SnapResult<SnapshotterConfig> {
        if self.vol_group.is_empty() || self.thin_pool.is_empty() {
            return Err(SnapError::Config {
                message: "Need both vol_group and thin_pool to be set".to_string(),
            });
        }

        let root_path = self
            .root_path
            .filter(|p| !p.as_os_str().is_empty())
            .or_else(|| default_root.map(Path::to_path_buf))
            .unwrap_or_else(|| PathBuf::from(DEFAULT_ROOT_PATH));

        let image_size = ByteSize::parse(self.img_size.as_deref().unwrap_or(DEFAULT_IMAGE_SIZE))?;
        if image_size.as_bytes() == 0 {
            return Err(SnapError::InvalidSize {
                value: image_size.to_string(),
            });
        }

        let fs_type = self
            .fs_type
            .filter(|t| !t.is_empty())
            .unwrap_or_else(|| DEFAULT_FS_TYPE.to_string());

        let mut paths = SnapPaths::new();
        if let Some(mount) = self.metadata_mount_path {
            paths = paths.with_metadata_mount(mount);
        }
        if let Some(dev) = self.dev_root {
            paths = paths.with_dev_root(dev);
        }

        let defaults = RetryPolicy::default();
        let retry = RetryPolicy {
            max_attempts: self.retry_attempts.unwrap_or(defaults.max_attempts).max(1),
            backoff: self
                .retry_backoff_ms
                .map_or(defaults.backoff, Duration::from_millis),
        };

        Ok(SnapshotterConfig {
            root_path,
            volume_group: self.vol_group,
            thin_pool: VolumeName::new(self.thin_pool)?,
            image_size,
            fs_type,
            paths,
            retry,
        })
    }
}

/// Validated snapshotter configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotterConfig {
    /// Directory holding transient mount points.
    pub root_path: PathBuf,
    /// Volume group name.
    pub volume_group: String,
    /// Thin pool inside the volume group.
    pub thin_pool: VolumeName,
    /// Virtual size of fresh volumes.
    pub image_size: ByteSize,
    /// Filesystem type of fresh volumes.
    pub fs_type: String,
    /// Device and metadata paths.
    pub paths: SnapPaths,
    /// Retry policy for LVM commands.
    pub retry: RetryPolicy,
}

impl SnapshotterConfig {
    /// Configuration with defaults for everything but the volume group and pool.
    ///
    /// # Errors
    ///
    /// Fails under the same conditions as [`RawConfig::validate`].
    pub fn new(volume_group: impl Into<String>, thin_pool: impl Into<String>) -> SnapResult<Self> {
        RawConfig {
            vol_group: volume_group.into(),
            thin_pool: thin_pool.into(),
            ..RawConfig::default()
        }
        .validate(None)
    }

    /// Set the transient mount root.
    #[must_use]
    pub fn with_root_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.root_path = path.into();
        self
    }

    /// Set the metadata volume mount point.
    #[must_use]
    pub fn with_metadata_mount(mut self, path: impl Into<PathBuf>) -> Self {
        self.paths = self.paths.with_metadata_mount(path);
        self
    }

    /// Set the retry policy.
    #[must_use]
    pub const fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// `vg/lv` address used by the LVM tools.
    #[must_use]
    pub fn lv_path(&self, volume: &VolumeName) -> String {
        format!("{}/{}", self.volume_group, volume)
    }

    /// Device node of a volume.
    #[must_use]
    pub fn device_path(&self, volume: &VolumeName) -> PathBuf {
        self.paths.device(&self.volume_group, volume.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_config_is_rejected() {
        let err = RawConfig::default().validate(None).unwrap_err();
        assert!(err.to_string().contains("Need both vol_group and thin_pool"));
    }

    #[test]
    fn pool_without_group_is_rejected() {
        let raw = RawConfig {
            thin_pool: "pool0".to_string(),
            ..RawConfig::default()
        };
        assert!(matches!(raw.validate(None), Err(SnapError::Config { .. })));
    }

    #[test]
    fn defaults_are_filled_in() {
        let config = SnapshotterConfig::new("vg0", "pool0").unwrap();
        assert_eq!(config.root_path, PathBuf::from("/mnt"));
        assert_eq!(config.image_size, ByteSize::gibibytes(10));
        assert_eq!(config.fs_type, "xfs");
        assert_eq!(config.retry, RetryPolicy::default());
        assert_eq!(
            config.paths.metadata_db(),
            PathBuf::from("/mnt/contd-lvm-snapshotter-db-holder/metadata.db")
        );
    }

    #[test]
    fn root_path_falls_back_to_caller_default() {
        let raw = RawConfig {
            vol_group: "vg0".to_string(),
            thin_pool: "pool0".to_string(),
            ..RawConfig::default()
        };
        let config = raw.validate(Some(Path::new("/var/lib/lvmsnap"))).unwrap();
        assert_eq!(config.root_path, PathBuf::from("/var/lib/lvmsnap"));
    }

    #[test]
    fn parses_toml() {
        let raw = RawConfig::from_toml_str(
            r#"
            root_path = "/srv/snap"
            vol_group = "vg0"
            thin_pool = "pool0"
            img_size = "512MiB"
            fs_type = "ext4"
            retry_attempts = 3
            retry_backoff_ms = 5
            "#,
        )
        .unwrap();
        let config = raw.validate(None).unwrap();

        assert_eq!(config.root_path, PathBuf::from("/srv/snap"));
        assert_eq!(config.image_size.as_bytes(), 512 * 1024 * 1024);
        assert_eq!(config.fs_type, "ext4");
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.retry.backoff, Duration::from_millis(5));
    }

    #[test]
    fn bad_size_is_rejected() {
        let raw = RawConfig {
            vol_group: "vg0".to_string(),
            thin_pool: "pool0".to_string(),
            img_size: Some("ten gigs".to_string()),
            ..RawConfig::default()
        };
        assert!(matches!(
            raw.validate(None),
            Err(SnapError::InvalidSize { .. })
        ));
    }

    #[test]
    fn malformed_toml_is_a_config_error() {
        assert!(matches!(
            RawConfig::from_toml_str("vol_group = [1"),
            Err(SnapError::Config { .. })
        ));
    }

    #[test]
    fn device_addressing() {
        let config = SnapshotterConfig::new("vg0", "pool0").unwrap();
        let id = VolumeName::new("12").unwrap();
        assert_eq!(config.lv_path(&id), "vg0/12");
        assert_eq!(config.device_path(&id), PathBuf::from("/dev/vg0/12"));
    }
}
