//! Snapshot lifecycle.
//!
//! Every mutating operation follows the same shape: open a writable
//! metadata transaction, stage the record change, perform the volume
//! operation, then commit. A failure before the commit rolls the transaction
//! back; a failed commit after a volume was created removes the volume again.
//!
//! ```text
//! prepare ──► Active ──commit──► Committed ──prepare/view──► Active / View
//!               │                    │
//!               └──────remove────────┴──────► (gone)
//! ```

use std::path::Path;
use std::sync::Arc;

use lvmsnap_common::{SnapError, SnapResult, VolumeName};

use crate::bootstrap::{self, MetadataVolume};
use crate::config::SnapshotterConfig;
use crate::metadata::{MetaStore, Transaction, storage};
use crate::types::{Info, Kind, Mount, Snapshot, SnapshotOptions, Usage};
use crate::usage::disk_usage;
use crate::volume::{Access, LvmDriver, VolumeDriver};

/// Roll `tx` back and return `err`. A rollback failure is logged only.
fn abort<T>(tx: Transaction<'_>, err: SnapError) -> SnapResult<T> {
    if let Err(rollback) = tx.rollback() {
        tracing::warn!(error = %rollback, original = %err, "Failed to roll back metadata transaction");
    }
    Err(err)
}

/// Unwrap a result or abort the transaction with its error.
macro_rules! or_abort {
    ($tx:ident, $result:expr) => {
        match $result {
            Ok(value) => value,
            Err(err) => return abort($tx, err),
        }
    };
}

/// Removes a freshly created volume unless disarmed.
struct VolumeGuard<'a, D: VolumeDriver> {
    driver: &'a D,
    name: &'a VolumeName,
    armed: bool,
}

impl<'a, D: VolumeDriver> VolumeGuard<'a, D> {
    const fn new(driver: &'a D, name: &'a VolumeName) -> Self {
        Self {
            driver,
            name,
            armed: true,
        }
    }

    fn disarm(mut self) {
        self.armed = false;
    }
}

impl<D: VolumeDriver> Drop for VolumeGuard<'_, D> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        match self.driver.remove_volume(self.name) {
            Ok(()) => {
                tracing::warn!(volume = %self.name, "Removed volume after failed metadata commit");
            }
            Err(err) => {
                tracing::error!(
                    volume = %self.name,
                    error = %err,
                    "Failed to remove volume after failed metadata commit; volume exists without metadata"
                );
            }
        }
    }
}

/// Copy-on-write snapshotter over thin logical volumes.
#[derive(Debug)]
pub struct Snapshotter<D: VolumeDriver = LvmDriver> {
    config: Arc<SnapshotterConfig>,
    driver: D,
    store: MetaStore,
    metadata: MetadataVolume,
}

impl Snapshotter<LvmDriver> {
    /// Open a snapshotter driving the host's LVM tools.
    ///
    /// # Errors
    ///
    /// Fails if the volume group or thin pool is missing, or the metadata
    /// volume cannot be prepared.
    pub fn new(config: SnapshotterConfig) -> SnapResult<Self> {
        let config = Arc::new(config);
        let driver = LvmDriver::new(Arc::clone(&config));
        Self::open(config, driver)
    }
}

impl<D: VolumeDriver> Snapshotter<D> {
    /// Open a snapshotter over a custom volume driver.
    ///
    /// # Errors
    ///
    /// Same as [`Snapshotter::new`].
    pub fn with_driver(config: SnapshotterConfig, driver: D) -> SnapResult<Self> {
        Self::open(Arc::new(config), driver)
    }

    fn open(config: Arc<SnapshotterConfig>, driver: D) -> SnapResult<Self> {
        let metadata = MetadataVolume::ensure(&config, &driver)?;
        let store = match MetaStore::open(metadata.db_path()) {
            Ok(store) => store,
            Err(err) => {
                if let Err(release) = metadata.release(&driver) {
                    tracing::warn!(error = %release, "Failed to release metadata volume");
                }
                return Err(err);
            }
        };

        tracing::info!(
            vg = %config.volume_group,
            pool = %config.thin_pool,
            db = %store.path().display(),
            "Snapshotter ready"
        );
        Ok(Self {
            config,
            driver,
            store,
            metadata,
        })
    }

    /// Configuration in use.
    #[must_use]
    pub fn config(&self) -> &SnapshotterConfig {
        &self.config
    }

    /// Volume driver in use.
    #[must_use]
    pub const fn driver(&self) -> &D {
        &self.driver
    }

    /// Information about `key`.
    ///
    /// # Errors
    ///
    /// Returns [`SnapError::NotFound`] for an unknown key.
    pub fn stat(&self, key: &str) -> SnapResult<Info> {
        let tx = self.store.transaction(false)?;
        let (_, info, _) = storage::get_info(&tx, key)?;
        Ok(info)
    }

    /// Patch the labels of `info.name`; see [`storage::update_info`].
    ///
    /// # Errors
    ///
    /// Returns [`SnapError::NotFound`] for an unknown key and
    /// [`SnapError::InvalidArgument`] for unsupported field paths.
    pub fn update(&self, info: &Info, field_paths: &[String]) -> SnapResult<Info> {
        let tx = self.store.transaction(true)?;
        let updated = or_abort!(tx, storage::update_info(&tx, info, field_paths));
        tx.commit()?;
        tracing::debug!(key = %info.name, ?field_paths, "Updated snapshot");
        Ok(updated)
    }

    /// Disk usage of `key`.
    ///
    /// Active snapshots are measured now; others report what was recorded
    /// when they were committed.
    ///
    /// # Errors
    ///
    /// Returns [`SnapError::NotFound`] for an unknown key, or a volume error
    /// if measuring fails.
    pub fn usage(&self, key: &str) -> SnapResult<Usage> {
        let tx = self.store.transaction(false)?;
        let (id, info, usage) = storage::get_info(&tx, key)?;
        drop(tx);

        if info.kind == Kind::Active {
            self.measure(&id)
        } else {
            Ok(usage)
        }
    }

    /// Mount descriptors of `key`.
    ///
    /// # Errors
    ///
    /// Returns [`SnapError::NotFound`] for an unknown key.
    pub fn mounts(&self, key: &str) -> SnapResult<Vec<Mount>> {
        let tx = self.store.transaction(false)?;
        let snapshot = storage::get_snapshot(&tx, key)?;
        Ok(self.mounts_for(&snapshot))
    }

    /// Create a writable snapshot `key` on top of `parent` (empty for none).
    ///
    /// # Errors
    ///
    /// Fails if `key` exists, `parent` is missing or not committed, or the
    /// volume cannot be created. No record or volume survives a failure.
    pub fn prepare(
        &self,
        key: &str,
        parent: &str,
        opts: &SnapshotOptions,
    ) -> SnapResult<Vec<Mount>> {
        self.create_snapshot(Kind::Active, key, parent, opts)
    }

    /// Create a read-only view `key` of the committed snapshot `parent`.
    ///
    /// # Errors
    ///
    /// Same as [`Snapshotter::prepare`]; `parent` is required.
    pub fn view(&self, key: &str, parent: &str, opts: &SnapshotOptions) -> SnapResult<Vec<Mount>> {
        if parent.is_empty() {
            return Err(SnapError::InvalidArgument {
                message: format!("view {key:?} needs a parent"),
            });
        }
        self.create_snapshot(Kind::View, key, parent, opts)
    }

    fn create_snapshot(
        &self,
        kind: Kind,
        key: &str,
        parent: &str,
        opts: &SnapshotOptions,
    ) -> SnapResult<Vec<Mount>> {
        let tx = self.store.transaction(true)?;
        let snapshot = or_abort!(tx, storage::create_snapshot(&tx, kind, key, parent, opts));

        let access = if kind == Kind::View {
            Access::ReadOnly
        } else {
            Access::ReadWrite
        };
        let origin = snapshot.parent_ids.first();
        if let Err(err) = self.driver.create_volume(&snapshot.id, origin, access) {
            return abort(tx, SnapError::volume("unable to create volume", err));
        }

        let guard = VolumeGuard::new(&self.driver, &snapshot.id);
        tx.commit()?;
        guard.disarm();

        tracing::debug!(key, parent, %kind, id = %snapshot.id, "Created snapshot");
        Ok(self.mounts_for(&snapshot))
    }

    /// Commit the active snapshot `key` as `name`.
    ///
    /// Records final usage, makes the volume read-only and deactivates it.
    ///
    /// # Errors
    ///
    /// Fails if `key` is not active or `name` exists. If the metadata commit
    /// fails and the volume cannot be removed afterwards, returns
    /// [`SnapError::Inconsistent`].
    pub fn commit(&self, name: &str, key: &str, opts: &SnapshotOptions) -> SnapResult<()> {
        let tx = self.store.transaction(true)?;
        let (id, info, _) = or_abort!(tx, storage::get_info(&tx, key));
        if info.kind != Kind::Active {
            return abort(
                tx,
                SnapError::FailedPrecondition {
                    message: format!("snapshot {key:?} is {}, not active", info.kind),
                },
            );
        }

        let usage = or_abort!(tx, self.measure(&id));
        let id = or_abort!(tx, storage::commit_active(&tx, key, name, usage, opts));
        or_abort!(tx, self.demote(&id));

        if let Err(err) = tx.commit() {
            tracing::error!(key, name, volume = %id, error = %err, "Metadata commit failed after demoting volume");
            return Err(match self.driver.remove_volume(&id) {
                Ok(()) => err,
                Err(cleanup) => SnapError::Inconsistent {
                    message: format!(
                        "commit of {key:?} failed ({err}) and volume {id} could not be removed: {cleanup}"
                    ),
                },
            });
        }

        tracing::debug!(key, name, volume = %id, size = usage.size, "Committed snapshot");
        Ok(())
    }

    /// Remove `key` and its volume.
    ///
    /// # Errors
    ///
    /// Fails if `key` is unknown, has children, or its volume cannot be
    /// removed; nothing changes in those cases. Returns
    /// [`SnapError::Inconsistent`] if the volume is gone but the record
    /// could not be deleted.
    pub fn remove(&self, key: &str) -> SnapResult<()> {
        let tx = self.store.transaction(true)?;
        let (id, kind) = or_abort!(tx, storage::remove(&tx, key));

        if let Err(err) = self.driver.remove_volume(&id) {
            return abort(tx, SnapError::volume("failed to delete LVM volume", err));
        }

        if let Err(err) = tx.commit() {
            tracing::error!(key, volume = %id, error = %err, "Volume removed but metadata commit failed");
            return Err(SnapError::Inconsistent {
                message: format!(
                    "volume {id} of snapshot {key:?} was removed but its record remains: {err}"
                ),
            });
        }

        tracing::debug!(key, %kind, volume = %id, "Removed snapshot");
        Ok(())
    }

    /// Call `visit` with every snapshot's info, ordered by key.
    ///
    /// # Errors
    ///
    /// Stops at and returns the first error.
    pub fn walk(&self, visit: impl FnMut(&Info) -> SnapResult<()>) -> SnapResult<()> {
        let tx = self.store.transaction(false)?;
        storage::walk_info(&tx, visit)
    }

    /// Check that the volume group, thin pool and metadata volume are present.
    ///
    /// # Errors
    ///
    /// Returns [`SnapError::NotFound`] naming the first missing object.
    pub fn check_health(&self) -> SnapResult<()> {
        bootstrap::verify_backing(&self.config, &self.driver)?;
        let present = self
            .driver
            .volume_exists(self.metadata.name())
            .map_err(|e| SnapError::volume("unable to look up metadata volume", e))?;
        if !present {
            return Err(SnapError::NotFound {
                what: format!("metadata volume {:?}", self.metadata.name().as_str()),
            });
        }
        Ok(())
    }

    /// Close the metadata store and unmount the metadata volume.
    ///
    /// # Errors
    ///
    /// Returns the first failure; the unmount is attempted either way.
    pub fn close(self) -> SnapResult<()> {
        let Self {
            driver,
            store,
            metadata,
            ..
        } = self;

        let closed = store.close();
        if let Err(err) = &closed {
            tracing::warn!(error = %err, "Failed to close metadata store");
        }
        metadata.release(&driver)?;
        tracing::info!("Snapshotter closed");
        closed
    }

    fn mounts_for(&self, snapshot: &Snapshot) -> Vec<Mount> {
        let options = if snapshot.kind == Kind::View {
            vec!["ro".to_string()]
        } else {
            Vec::new()
        };
        vec![Mount {
            source: self
                .config
                .device_path(&snapshot.id)
                .to_string_lossy()
                .into_owned(),
            fs_type: self.config.fs_type.clone(),
            options,
        }]
    }

    /// Mount `id` read-only on a scratch directory and measure it.
    fn measure(&self, id: &VolumeName) -> SnapResult<Usage> {
        let path = self
            .driver
            .mount(id)
            .map_err(|e| SnapError::volume("unable to mount volume", e))?;
        let usage = disk_usage(&path);
        self.release_scratch(&path, usage.is_ok())?;
        Ok(usage?)
    }

    fn release_scratch(&self, path: &Path, fatal: bool) -> SnapResult<()> {
        match self.driver.unmount(path) {
            Ok(()) => Ok(()),
            Err(err) if fatal => Err(SnapError::volume("unable to unmount volume", err)),
            Err(err) => {
                tracing::warn!(path = %path.display(), error = %err, "Failed to unmount scratch mount");
                Ok(())
            }
        }
    }

    /// Make a committed volume read-only and drop its device node.
    fn demote(&self, id: &VolumeName) -> SnapResult<()> {
        self.driver
            .set_permission(id, true)
            .map_err(|e| SnapError::volume("unable to make volume read-only", e))?;

        if let Err(err) = self.driver.set_active(id, false) {
            if let Err(restore) = self.driver.set_permission(id, false) {
                tracing::warn!(volume = %id, error = %restore, "Failed to restore volume permission");
            }
            return Err(SnapError::volume("unable to deactivate volume", err));
        }
        Ok(())
    }
}
