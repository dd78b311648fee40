//! Directory-backed volume driver for tests and development.
//!
//! Each volume is a directory under the driver root. Creating a volume from a
//! parent copies the parent's directory, so writes to a child never reach its
//! parent. State transitions (activation, permission, mounts) are tracked the
//! way LVM enforces them, and any operation can be made to fail once with
//! [`MemoryDriver::fail_next`].

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use lvmsnap_common::{CommandError, VolumeError, VolumeName};
use parking_lot::Mutex;
use walkdir::WalkDir;

use super::{Access, VolumeDriver};

/// Operations that can be made to fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailOp {
    /// `create_volume`.
    Create,
    /// `remove_volume`.
    Remove,
    /// `set_active(.., true)`.
    Activate,
    /// `set_active(.., false)`.
    Deactivate,
    /// `set_permission`.
    SetPermission,
    /// `mount` and `mount_at`.
    Mount,
}

/// State of one in-memory volume.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryVolume {
    /// Origin the volume was snapshotted from.
    pub parent: Option<VolumeName>,
    /// Read-only permission.
    pub read_only: bool,
    /// Device node present.
    pub active: bool,
}

#[derive(Debug, Default)]
struct State {
    volumes: BTreeMap<VolumeName, MemoryVolume>,
    mounts: BTreeMap<PathBuf, VolumeName>,
    failures: Vec<FailOp>,
}

/// In-memory [`VolumeDriver`].
#[derive(Debug)]
pub struct MemoryDriver {
    root: PathBuf,
    thin_pool: VolumeName,
    group_exists: bool,
    state: Mutex<State>,
}

impl MemoryDriver {
    /// Driver storing volume contents under `root`, with `thin_pool` present.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>, thin_pool: VolumeName) -> Self {
        let mut state = State::default();
        state.volumes.insert(
            thin_pool.clone(),
            MemoryVolume {
                parent: None,
                read_only: false,
                active: true,
            },
        );
        Self {
            root: root.into(),
            thin_pool,
            group_exists: true,
            state: Mutex::new(state),
        }
    }

    /// Pretend the volume group does not exist.
    #[must_use]
    pub const fn without_volume_group(mut self) -> Self {
        self.group_exists = false;
        self
    }

    /// Pretend the thin pool does not exist.
    #[must_use]
    pub fn without_thin_pool(self) -> Self {
        self.state.lock().volumes.remove(&self.thin_pool);
        self
    }

    /// Make the next `op` fail.
    pub fn fail_next(&self, op: FailOp) {
        self.state.lock().failures.push(op);
    }

    /// State of a volume.
    #[must_use]
    pub fn volume(&self, name: &VolumeName) -> Option<MemoryVolume> {
        self.state.lock().volumes.get(name).cloned()
    }

    /// Names of every volume except the thin pool.
    #[must_use]
    pub fn volume_names(&self) -> Vec<VolumeName> {
        self.state
            .lock()
            .volumes
            .keys()
            .filter(|name| **name != self.thin_pool)
            .cloned()
            .collect()
    }

    /// Directory holding a volume's contents.
    #[must_use]
    pub fn data_dir(&self, name: &VolumeName) -> PathBuf {
        self.root.join(name.as_str())
    }

    /// Whether anything is mounted at `path`.
    #[must_use]
    pub fn is_mounted(&self, path: &Path) -> bool {
        self.state.lock().mounts.contains_key(path)
    }

    fn injected(state: &mut State, op: FailOp, name: &str) -> Result<(), VolumeError> {
        match state.failures.iter().position(|f| *f == op) {
            Some(index) => {
                state.failures.remove(index);
                Err(VolumeError::Tool(CommandError::Failed {
                    command: format!("{op:?} {name}").to_lowercase(),
                    code: Some(5),
                    output: "injected failure".to_string(),
                }))
            }
            None => Ok(()),
        }
    }

    fn not_found(name: &VolumeName) -> VolumeError {
        VolumeError::NotFound {
            name: name.to_string(),
        }
    }
}

impl VolumeDriver for MemoryDriver {
    fn create_volume(
        &self,
        name: &VolumeName,
        parent: Option<&VolumeName>,
        access: Access,
    ) -> Result<(), VolumeError> {
        let mut state = self.state.lock();
        Self::injected(&mut state, FailOp::Create, name.as_str())?;

        if state.volumes.contains_key(name) {
            return Err(VolumeError::Io(io::Error::new(
                io::ErrorKind::AlreadyExists,
                format!("logical volume {name} already exists"),
            )));
        }

        let target = self.data_dir(name);
        match parent {
            Some(parent) => {
                if !state.volumes.contains_key(parent) {
                    return Err(Self::not_found(parent));
                }
                copy_tree(&self.data_dir(parent), &target)?;
            }
            None => fs::create_dir_all(&target)?,
        }

        state.volumes.insert(
            name.clone(),
            MemoryVolume {
                parent: parent.cloned(),
                read_only: access.is_read_only(),
                active: true,
            },
        );
        Ok(())
    }

    fn remove_volume(&self, name: &VolumeName) -> Result<(), VolumeError> {
        let mut state = self.state.lock();
        Self::injected(&mut state, FailOp::Remove, name.as_str())?;

        if !state.volumes.contains_key(name) {
            return Err(Self::not_found(name));
        }
        if state.mounts.values().any(|mounted| mounted == name) {
            return Err(VolumeError::Io(io::Error::new(
                io::ErrorKind::ResourceBusy,
                format!("logical volume {name} in use"),
            )));
        }

        state.volumes.remove(name);
        let dir = self.data_dir(name);
        if dir.exists() {
            fs::remove_dir_all(dir)?;
        }
        Ok(())
    }

    fn volume_group_exists(&self) -> Result<bool, VolumeError> {
        Ok(self.group_exists)
    }

    fn volume_exists(&self, name: &VolumeName) -> Result<bool, VolumeError> {
        Ok(self.group_exists && self.state.lock().volumes.contains_key(name))
    }

    fn set_active(&self, name: &VolumeName, active: bool) -> Result<(), VolumeError> {
        let mut state = self.state.lock();
        let op = if active {
            FailOp::Activate
        } else {
            FailOp::Deactivate
        };
        Self::injected(&mut state, op, name.as_str())?;

        let volume = state
            .volumes
            .get_mut(name)
            .ok_or_else(|| Self::not_found(name))?;
        volume.active = active;
        Ok(())
    }

    fn set_permission(&self, name: &VolumeName, read_only: bool) -> Result<(), VolumeError> {
        let mut state = self.state.lock();
        Self::injected(&mut state, FailOp::SetPermission, name.as_str())?;

        let volume = state
            .volumes
            .get_mut(name)
            .ok_or_else(|| Self::not_found(name))?;
        volume.read_only = read_only;
        Ok(())
    }

    fn mount(&self, name: &VolumeName) -> Result<PathBuf, VolumeError> {
        let dir = self.data_dir(name);
        self.mount_at(name, &dir, Access::ReadOnly)?;
        Ok(dir)
    }

    fn unmount(&self, path: &Path) -> Result<(), VolumeError> {
        self.unmount_at(path)
    }

    fn mount_at(
        &self,
        name: &VolumeName,
        target: &Path,
        _access: Access,
    ) -> Result<(), VolumeError> {
        let mut state = self.state.lock();
        Self::injected(&mut state, FailOp::Mount, name.as_str())?;

        let active = state.volumes.get(name).is_some_and(|v| v.active);
        if !active || state.mounts.contains_key(target) {
            let kind = if active {
                io::ErrorKind::ResourceBusy
            } else {
                io::ErrorKind::NotFound
            };
            return Err(VolumeError::Mount {
                target: target.to_path_buf(),
                source: io::Error::from(kind),
            });
        }

        fs::create_dir_all(target)?;
        state.mounts.insert(target.to_path_buf(), name.clone());
        Ok(())
    }

    fn unmount_at(&self, target: &Path) -> Result<(), VolumeError> {
        self.state
            .lock()
            .mounts
            .remove(target)
            .map(|_| ())
            .ok_or_else(|| VolumeError::Mount {
                target: target.to_path_buf(),
                source: io::Error::from(io::ErrorKind::InvalidInput),
            })
    }
}

/// Copy a directory tree, preserving symlinks.
fn copy_tree(from: &Path, to: &Path) -> io::Result<()> {
    fs::create_dir_all(to)?;
    if !from.exists() {
        return Ok(());
    }
    for entry in WalkDir::new(from).min_depth(1) {
        let entry = entry.map_err(io::Error::other)?;
        let relative = entry
            .path()
            .strip_prefix(from)
            .map_err(io::Error::other)?;
        let dest = to.join(relative);
        let file_type = entry.file_type();
        if file_type.is_dir() {
            fs::create_dir_all(&dest)?;
        } else if file_type.is_symlink() {
            std::os::unix::fs::symlink(fs::read_link(entry.path())?, &dest)?;
        } else {
            fs::copy(entry.path(), &dest)?;
        }
    }
    Ok(())
}
