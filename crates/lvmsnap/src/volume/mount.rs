//! Mount operations.

use std::ffi::CString;
use std::path::Path;

use lvmsnap_common::VolumeError;

/// Mount options.
#[derive(Debug, Clone, Default)]
pub struct MountOptions {
    /// Read-only mount.
    pub readonly: bool,
    /// No exec.
    pub noexec: bool,
    /// No suid.
    pub nosuid: bool,
    /// No dev.
    pub nodev: bool,
}

impl MountOptions {
    /// Options for a short-lived inspection mount.
    #[must_use]
    pub const fn inspect() -> Self {
        Self {
            readonly: true,
            noexec: true,
            nosuid: true,
            nodev: true,
        }
    }

    /// Options for the long-lived metadata mount.
    #[must_use]
    pub const fn metadata() -> Self {
        Self {
            readonly: false,
            noexec: true,
            nosuid: true,
            nodev: true,
        }
    }
}

/// Mount a block device.
///
/// # Errors
///
/// Returns [`VolumeError::Mount`] if the syscall fails.
pub fn mount_device(
    device: &Path,
    target: &Path,
    fstype: &str,
    options: &MountOptions,
    data: Option<&str>,
) -> Result<(), VolumeError> {
    use rustix::mount::{MountFlags, mount};

    tracing::debug!(
        device = %device.display(),
        target = %target.display(),
        fstype,
        ?options,
        data,
        "Mounting volume"
    );

    let mut flags = MountFlags::empty();
    if options.readonly {
        flags |= MountFlags::RDONLY;
    }
    if options.noexec {
        flags |= MountFlags::NOEXEC;
    }
    if options.nosuid {
        flags |= MountFlags::NOSUID;
    }
    if options.nodev {
        flags |= MountFlags::NODEV;
    }

    let fstype_c = c_string(fstype, target)?;
    let data_c = c_string(data.unwrap_or(""), target)?;

    mount(device, target, fstype_c.as_c_str(), flags, data_c.as_c_str()).map_err(|e| {
        VolumeError::Mount {
            target: target.to_path_buf(),
            source: e.into(),
        }
    })
}

/// Unmount a filesystem.
///
/// # Errors
///
/// Returns [`VolumeError::Mount`] if the syscall fails.
pub fn unmount(target: &Path) -> Result<(), VolumeError> {
    use rustix::mount::{UnmountFlags, unmount};

    tracing::debug!(target = %target.display(), "Unmounting volume");

    unmount(target, UnmountFlags::empty()).map_err(|e| VolumeError::Mount {
        target: target.to_path_buf(),
        source: e.into(),
    })
}

fn c_string(value: &str, target: &Path) -> Result<CString, VolumeError> {
    CString::new(value).map_err(|_| VolumeError::Mount {
        target: target.to_path_buf(),
        source: std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            "mount argument contains a null byte",
        ),
    })
}
