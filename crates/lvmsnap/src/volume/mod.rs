//! Volume drivers.
//!
//! A [`VolumeDriver`] turns logical volume operations into block-device
//! changes. [`LvmDriver`] drives the LVM command-line tools; [`MemoryDriver`]
//! keeps volumes as plain directories so the snapshot lifecycle can be
//! exercised without root.

mod lvm;
mod memory;
mod mount;

use std::path::{Path, PathBuf};

use lvmsnap_common::{VolumeError, VolumeName};

pub use lvm::{LvmDriver, LvmStatus};
pub use memory::{FailOp, MemoryDriver, MemoryVolume};
pub use mount::{MountOptions, mount_device, unmount};

/// Permission a volume is created with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    /// Writable volume.
    ReadWrite,
    /// Read-only volume.
    ReadOnly,
}

impl Access {
    /// Whether this is [`Access::ReadOnly`].
    #[must_use]
    pub const fn is_read_only(&self) -> bool {
        matches!(self, Self::ReadOnly)
    }
}

/// Block-device operations the snapshotter depends on.
///
/// Implementations are shared between request threads and must not assume
/// any ordering between calls.
pub trait VolumeDriver: Send + Sync {
    /// Create a volume named `name`.
    ///
    /// With a `parent`, the volume is a thin snapshot of it. Without one, it
    /// is a fresh thin volume of the configured size, formatted with the
    /// configured filesystem. The new volume is active on success.
    ///
    /// # Errors
    ///
    /// Fails if any step fails; a half-created volume is removed first.
    fn create_volume(
        &self,
        name: &VolumeName,
        parent: Option<&VolumeName>,
        access: Access,
    ) -> Result<(), VolumeError>;

    /// Remove a volume. Removing a missing volume is an error.
    ///
    /// # Errors
    ///
    /// Fails if the volume does not exist or is in use.
    fn remove_volume(&self, name: &VolumeName) -> Result<(), VolumeError>;

    /// Whether the configured volume group exists.
    ///
    /// # Errors
    ///
    /// Fails when the probe itself fails for a reason other than absence.
    fn volume_group_exists(&self) -> Result<bool, VolumeError>;

    /// Whether a logical volume exists in the configured volume group.
    ///
    /// # Errors
    ///
    /// Fails when the probe itself fails for a reason other than absence.
    fn volume_exists(&self, name: &VolumeName) -> Result<bool, VolumeError>;

    /// Activate or deactivate a volume's device node.
    ///
    /// # Errors
    ///
    /// Fails if the tool fails.
    fn set_active(&self, name: &VolumeName, active: bool) -> Result<(), VolumeError>;

    /// Switch a volume between read-write and read-only.
    ///
    /// # Errors
    ///
    /// Fails if the tool fails.
    fn set_permission(&self, name: &VolumeName, read_only: bool) -> Result<(), VolumeError>;

    /// Mount a volume read-only on a fresh private directory.
    ///
    /// # Errors
    ///
    /// Fails if the directory cannot be created or the mount fails.
    fn mount(&self, name: &VolumeName) -> Result<PathBuf, VolumeError>;

    /// Undo [`VolumeDriver::mount`] and remove the directory.
    ///
    /// # Errors
    ///
    /// Fails if the unmount fails.
    fn unmount(&self, path: &Path) -> Result<(), VolumeError>;

    /// Mount a volume at a fixed target, creating the directory if needed.
    ///
    /// # Errors
    ///
    /// Fails if the target is unusable or the mount fails.
    fn mount_at(&self, name: &VolumeName, target: &Path, access: Access)
    -> Result<(), VolumeError>;

    /// Unmount a fixed target, leaving the directory in place.
    ///
    /// # Errors
    ///
    /// Fails if nothing is mounted there or the unmount fails.
    fn unmount_at(&self, target: &Path) -> Result<(), VolumeError>;
}

impl<D: VolumeDriver + ?Sized> VolumeDriver for std::sync::Arc<D> {
    fn create_volume(
        &self,
        name: &VolumeName,
        parent: Option<&VolumeName>,
        access: Access,
    ) -> Result<(), VolumeError> {
        (**self).create_volume(name, parent, access)
    }

    fn remove_volume(&self, name: &VolumeName) -> Result<(), VolumeError> {
        (**self).remove_volume(name)
    }

    fn volume_group_exists(&self) -> Result<bool, VolumeError> {
        (**self).volume_group_exists()
    }

    fn volume_exists(&self, name: &VolumeName) -> Result<bool, VolumeError> {
        (**self).volume_exists(name)
    }

    fn set_active(&self, name: &VolumeName, active: bool) -> Result<(), VolumeError> {
        (**self).set_active(name, active)
    }

    fn set_permission(&self, name: &VolumeName, read_only: bool) -> Result<(), VolumeError> {
        (**self).set_permission(name, read_only)
    }

    fn mount(&self, name: &VolumeName) -> Result<PathBuf, VolumeError> {
        (**self).mount(name)
    }

    fn unmount(&self, path: &Path) -> Result<(), VolumeError> {
        (**self).unmount(path)
    }

    fn mount_at(
        &self,
        name: &VolumeName,
        target: &Path,
        access: Access,
    ) -> Result<(), VolumeError> {
        (**self).mount_at(name, target, access)
    }

    fn unmount_at(&self, target: &Path) -> Result<(), VolumeError> {
        (**self).unmount_at(target)
    }
}
