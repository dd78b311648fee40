//! Startup checks and the metadata volume.

use std::path::{Path, PathBuf};

use lvmsnap_common::paths::METADATA_VOLUME;
use lvmsnap_common::{SnapError, SnapResult, VolumeName};

use crate::config::SnapshotterConfig;
use crate::volume::{Access, VolumeDriver};

/// Check that the configured volume group and thin pool exist.
///
/// # Errors
///
/// Returns [`SnapError::NotFound`] naming whichever is missing.
pub fn verify_backing<D: VolumeDriver + ?Sized>(
    config: &SnapshotterConfig,
    driver: &D,
) -> SnapResult<()> {
    let group = driver
        .volume_group_exists()
        .map_err(|e| SnapError::volume("unable to look up volume group", e))?;
    if !group {
        return Err(SnapError::NotFound {
            what: format!("volume group {:?}", config.volume_group),
        });
    }

    let pool = driver
        .volume_exists(&config.thin_pool)
        .map_err(|e| SnapError::volume("unable to look up thin pool", e))?;
    if !pool {
        return Err(SnapError::NotFound {
            what: format!("thin pool {:?}", config.lv_path(&config.thin_pool)),
        });
    }
    Ok(())
}

/// The logical volume holding the metadata database, mounted for the
/// lifetime of the snapshotter.
#[derive(Debug)]
pub struct MetadataVolume {
    name: VolumeName,
    mount_point: PathBuf,
    db_path: PathBuf,
}

impl MetadataVolume {
    /// Verify the backing pool, then create (or reuse), activate and mount
    /// the metadata volume.
    ///
    /// # Errors
    ///
    /// Fails if the volume group or pool is missing or any volume step fails.
    pub fn ensure<D: VolumeDriver + ?Sized>(
        config: &SnapshotterConfig,
        driver: &D,
    ) -> SnapResult<Self> {
        verify_backing(config, driver)?;

        let name = VolumeName::new(METADATA_VOLUME)?;
        let exists = driver
            .volume_exists(&name)
            .map_err(|e| SnapError::volume("unable to look up metadata volume", e))?;

        if exists {
            tracing::info!(volume = %name, "Reusing metadata volume");
        } else {
            driver
                .create_volume(&name, None, Access::ReadWrite)
                .map_err(|e| SnapError::volume("unable to create metadata volume", e))?;
            tracing::info!(volume = %name, "Created metadata volume");
        }

        driver
            .set_active(&name, true)
            .map_err(|e| SnapError::volume("unable to activate metadata volume", e))?;

        let mount_point = config.paths.metadata_mount().to_path_buf();
        driver
            .mount_at(&name, &mount_point, Access::ReadWrite)
            .map_err(|e| SnapError::volume("unable to mount metadata volume", e))?;

        tracing::debug!(volume = %name, path = %mount_point.display(), "Mounted metadata volume");
        Ok(Self {
            name,
            db_path: config.paths.metadata_db(),
            mount_point,
        })
    }

    /// Volume name.
    #[must_use]
    pub const fn name(&self) -> &VolumeName {
        &self.name
    }

    /// Where the volume is mounted.
    #[must_use]
    pub fn mount_point(&self) -> &Path {
        &self.mount_point
    }

    /// Metadata database file inside the mount.
    #[must_use]
    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    /// Unmount the volume. It stays active for the next run.
    ///
    /// # Errors
    ///
    /// Fails if the unmount fails.
    pub fn release<D: VolumeDriver + ?Sized>(&self, driver: &D) -> SnapResult<()> {
        driver
            .unmount_at(&self.mount_point)
            .map_err(|e| SnapError::volume("unable to unmount metadata volume", e))?;
        tracing::debug!(path = %self.mount_point.display(), "Unmounted metadata volume");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::volume::MemoryDriver;

    fn setup(dir: &Path) -> (SnapshotterConfig, MemoryDriver) {
        let config = SnapshotterConfig::new("vg0", "pool0")
            .unwrap()
            .with_metadata_mount(dir.join("meta"));
        let driver = MemoryDriver::new(dir.join("volumes"), config.thin_pool.clone());
        (config, driver)
    }

    #[test]
    fn creates_then_reuses_the_metadata_volume() {
        let dir = tempfile::tempdir().unwrap();
        let (config, driver) = setup(dir.path());

        let first = MetadataVolume::ensure(&config, &driver).unwrap();
        assert!(driver.is_mounted(first.mount_point()));
        assert_eq!(first.db_path(), dir.path().join("meta").join("metadata.db"));
        first.release(&driver).unwrap();
        assert!(!driver.is_mounted(first.mount_point()));

        let second = MetadataVolume::ensure(&config, &driver).unwrap();
        assert_eq!(driver.volume_names(), vec![second.name().clone()]);
        assert!(driver.volume(second.name()).unwrap().active);
    }

    #[test]
    fn missing_volume_group_fails_fast() {
        let dir = tempfile::tempdir().unwrap();
        let (config, driver) = setup(dir.path());
        let driver = driver.without_volume_group();

        let err = MetadataVolume::ensure(&config, &driver).unwrap_err();
        assert!(err.is_not_found());
        assert!(err.to_string().contains("vg0"));
        assert!(driver.volume_names().is_empty());
    }

    #[test]
    fn missing_thin_pool_fails_fast() {
        let dir = tempfile::tempdir().unwrap();
        let (config, driver) = setup(dir.path());
        let driver = driver.without_thin_pool();

        let err = MetadataVolume::ensure(&config, &driver).unwrap_err();
        assert!(err.to_string().contains("vg0/pool0"));
    }
}
