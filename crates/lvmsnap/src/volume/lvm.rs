//! Volume driver backed by the LVM command-line tools.
//!
//! Every logical volume lives in the configured volume group; fresh volumes
//! are thin volumes in the configured pool, children are thin snapshots of
//! their parent. Device nodes are `<dev_root>/<vg>/<lv>`.

use std::fs;
use std::os::unix::fs::DirBuilderExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use lvmsnap_common::{CommandError, VolumeError, VolumeName};

use super::mount::{self, MountOptions};
use super::{Access, VolumeDriver};
use crate::config::SnapshotterConfig;
use crate::exec::{CommandRunner, HostRunner};

/// Exit status LVM tools use for a failed command (`ECMD_FAILED`).
///
/// It is what `vgs`/`lvs` return for a missing object and what `lvcreate`
/// returns when a pool cannot take more extents.
const ECMD_FAILED: i32 = 5;

/// Share of free extents a new thin pool claims.
const THIN_POOL_EXTENTS: &str = "90%FREE";

/// Outcome of an LVM command, classified once where the exit status is seen.
#[derive(Debug)]
pub enum LvmStatus {
    /// The command succeeded; carries its output.
    Ok(String),
    /// The probed object does not exist.
    NotFound,
    /// The pool already holds every extent it may claim.
    AlreadyAllocated,
    /// Any other failure.
    Failure(CommandError),
}

impl LvmStatus {
    /// Classify the result of an existence probe (`vgs`, `lvs`).
    #[must_use]
    pub fn probe(result: Result<String, CommandError>) -> Self {
        match result {
            Ok(output) => Self::Ok(output),
            Err(err) if err.exit_code() == Some(ECMD_FAILED) => Self::NotFound,
            Err(err) => Self::Failure(err),
        }
    }

    /// Classify the result of thin pool creation.
    #[must_use]
    pub fn pool_creation(result: Result<String, CommandError>) -> Self {
        match result {
            Ok(output) => Self::Ok(output),
            Err(err) if err.exit_code() == Some(ECMD_FAILED) => Self::AlreadyAllocated,
            Err(err) => Self::Failure(err),
        }
    }
}

/// LVM-backed [`VolumeDriver`].
#[derive(Debug)]
pub struct LvmDriver<R = HostRunner> {
    config: Arc<SnapshotterConfig>,
    runner: R,
}

impl LvmDriver<HostRunner> {
    /// Driver running commands on the host with the configured retry policy.
    #[must_use]
    pub fn new(config: Arc<SnapshotterConfig>) -> Self {
        let runner = HostRunner::new(config.retry);
        Self { config, runner }
    }
}

impl<R: CommandRunner> LvmDriver<R> {
    /// Driver using a custom command runner.
    #[must_use]
    pub const fn with_runner(config: Arc<SnapshotterConfig>, runner: R) -> Self {
        Self { config, runner }
    }

    /// The command runner.
    #[must_use]
    pub const fn runner(&self) -> &R {
        &self.runner
    }

    fn lvm(&self, program: &str, args: &[&str]) -> Result<String, CommandError> {
        let args: Vec<String> = args.iter().map(ToString::to_string).collect();
        self.runner.run(program, &args)
    }

    /// Run an LVM tool whose `ECMD_FAILED` status is an answer, not contention.
    fn lvm_settled(&self, program: &str, args: &[&str]) -> Result<String, CommandError> {
        let args: Vec<String> = args.iter().map(ToString::to_string).collect();
        self.runner.run_settled(program, &args, &[ECMD_FAILED])
    }

    /// Create the configured volume group on `device`.
    ///
    /// # Errors
    ///
    /// Fails if `vgcreate` fails.
    pub fn create_volume_group(&self, device: &Path) -> Result<(), VolumeError> {
        let device = device.to_string_lossy();
        self.lvm("vgcreate", &[self.config.volume_group.as_str(), device.as_ref()])?;
        tracing::info!(vg = %self.config.volume_group, %device, "Created volume group");
        Ok(())
    }

    /// Create the configured thin pool from the group's free extents.
    ///
    /// A pool that already holds its share of the group is left as is.
    ///
    /// # Errors
    ///
    /// Fails if `lvcreate` fails for any other reason.
    pub fn create_thin_pool(&self) -> Result<(), VolumeError> {
        let result = self.lvm_settled(
            "lvcreate",
            &[
                "--thinpool",
                self.config.thin_pool.as_str(),
                "--extents",
                THIN_POOL_EXTENTS,
                self.config.volume_group.as_str(),
            ],
        );
        match LvmStatus::pool_creation(result) {
            LvmStatus::Ok(_) => {
                tracing::info!(pool = %self.config.thin_pool, "Created thin pool");
                Ok(())
            }
            LvmStatus::AlreadyAllocated | LvmStatus::NotFound => {
                tracing::debug!(pool = %self.config.thin_pool, "Thin pool already allocated");
                Ok(())
            }
            LvmStatus::Failure(err) => Err(err.into()),
        }
    }

    /// Remove the configured volume group and everything in it.
    ///
    /// # Errors
    ///
    /// Fails if `vgremove` fails.
    pub fn delete_volume_group(&self) -> Result<(), VolumeError> {
        self.lvm("vgremove", &["-y", self.config.volume_group.as_str()])?;
        tracing::info!(vg = %self.config.volume_group, "Removed volume group");
        Ok(())
    }

    fn probe(&self, program: &str, args: &[&str]) -> Result<bool, VolumeError> {
        match LvmStatus::probe(self.lvm_settled(program, args)) {
            LvmStatus::Ok(_) => Ok(true),
            LvmStatus::NotFound | LvmStatus::AlreadyAllocated => Ok(false),
            LvmStatus::Failure(err) => Err(err.into()),
        }
    }

    fn format(&self, name: &VolumeName) -> Result<(), VolumeError> {
        let fs_type = self.config.fs_type.as_str();
        let mkfs = format!("mkfs.{fs_type}");
        let device = self.config.device_path(name);
        let device = device.to_string_lossy();
        let mut args = Vec::with_capacity(2);
        match fs_type {
            "xfs" => args.push("-f"),
            "ext2" | "ext3" | "ext4" => args.push("-F"),
            _ => {}
        }
        args.push(device.as_ref());
        self.lvm(&mkfs, &args)?;
        Ok(())
    }

    /// Activation, formatting and final permission of a just-created volume.
    fn finish_creation(
        &self,
        name: &VolumeName,
        fresh: bool,
        access: Access,
    ) -> Result<(), VolumeError> {
        self.set_active(name, true)?;
        if fresh {
            self.format(name)?;
            if access.is_read_only() {
                self.set_permission(name, true)?;
            }
        }
        Ok(())
    }

    fn mount_data(&self) -> Option<&'static str> {
        // Thin snapshots share their origin's filesystem UUID.
        (self.config.fs_type == "xfs").then_some("nouuid")
    }
}

impl<R: CommandRunner> VolumeDriver for LvmDriver<R> {
    fn create_volume(
        &self,
        name: &VolumeName,
        parent: Option<&VolumeName>,
        access: Access,
    ) -> Result<(), VolumeError> {
        let pool = self.config.lv_path(&self.config.thin_pool);
        let origin = parent.map(|p| self.config.lv_path(p));
        let size = self.config.image_size.to_lvm_arg();

        let mut args = vec!["--name", name.as_str()];
        match &origin {
            Some(origin) => {
                args.extend(["--snapshot", origin.as_str()]);
                if access.is_read_only() {
                    args.push("-pr");
                }
            }
            None => args.extend(["--virtualsize", size.as_str(), "--thin", pool.as_str()]),
        }

        tracing::debug!(volume = %name, ?parent, ?access, "Creating volume");
        self.lvm("lvcreate", &args)?;

        if let Err(err) = self.finish_creation(name, origin.is_none(), access) {
            if let Err(cleanup) = self.remove_volume(name) {
                tracing::warn!(volume = %name, error = %cleanup, "Failed to remove half-created volume");
            }
            return Err(err);
        }
        Ok(())
    }

    fn remove_volume(&self, name: &VolumeName) -> Result<(), VolumeError> {
        tracing::debug!(volume = %name, "Removing volume");
        self.lvm("lvremove", &["-y", self.config.lv_path(name).as_str()])?;
        Ok(())
    }

    fn volume_group_exists(&self) -> Result<bool, VolumeError> {
        self.probe(
            "vgs",
            &[
                self.config.volume_group.as_str(),
                "--options",
                "vg_name",
                "--no-headings",
            ],
        )
    }

    fn volume_exists(&self, name: &VolumeName) -> Result<bool, VolumeError> {
        self.probe(
            "lvs",
            &[
                self.config.lv_path(name).as_str(),
                "--options",
                "lv_name",
                "--no-headings",
            ],
        )
    }

    fn set_active(&self, name: &VolumeName, active: bool) -> Result<(), VolumeError> {
        let flag = if active { "y" } else { "n" };
        let lv = self.config.lv_path(name);
        self.lvm("lvchange", &["-K", lv.as_str(), "-a", flag])?;
        Ok(())
    }

    fn set_permission(&self, name: &VolumeName, read_only: bool) -> Result<(), VolumeError> {
        let flag = if read_only { "-pr" } else { "-prw" };
        let lv = self.config.lv_path(name);
        self.lvm("lvchange", &[flag, lv.as_str()])?;
        Ok(())
    }

    fn mount(&self, name: &VolumeName) -> Result<PathBuf, VolumeError> {
        let dir = tempfile::Builder::new()
            .prefix(&format!("{}-{}", self.config.volume_group, name))
            .tempdir_in(&self.config.root_path)?
            .keep();

        let device = self.config.device_path(name);
        if let Err(err) = mount::mount_device(
            &device,
            &dir,
            &self.config.fs_type,
            &MountOptions::inspect(),
            self.mount_data(),
        ) {
            if let Err(cleanup) = fs::remove_dir(&dir) {
                tracing::warn!(path = %dir.display(), error = %cleanup, "Failed to remove mount point");
            }
            return Err(err);
        }
        Ok(dir)
    }

    fn unmount(&self, path: &Path) -> Result<(), VolumeError> {
        mount::unmount(path)?;
        fs::remove_dir(path)?;
        Ok(())
    }

    fn mount_at(
        &self,
        name: &VolumeName,
        target: &Path,
        access: Access,
    ) -> Result<(), VolumeError> {
        fs::DirBuilder::new()
            .recursive(true)
            .mode(0o700)
            .create(target)?;

        let options = if access.is_read_only() {
            MountOptions::inspect()
        } else {
            MountOptions::metadata()
        };
        mount::mount_device(
            &self.config.device_path(name),
            target,
            &self.config.fs_type,
            &options,
            None,
        )
    }

    fn unmount_at(&self, target: &Path) -> Result<(), VolumeError> {
        mount::unmount(target)
    }
}
