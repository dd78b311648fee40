//! # lvmsnap-common
//!
//! Shared types for the lvmsnap snapshotter:
//! - Error taxonomy for commands, volumes and snapshots
//! - Logical volume name validation
//! - Human-readable sizes
//! - Well-known paths

#![warn(missing_docs)]

pub mod error;
pub mod name;
pub mod paths;
pub mod size;

pub use error::{CommandError, SnapError, SnapResult, VolumeError};
pub use name::VolumeName;
pub use paths::SnapPaths;
pub use size::ByteSize;
