//! # lvmsnap
//!
//! Copy-on-write container snapshots on LVM thin logical volumes.
//!
//! ## Features
//!
//! - **Thin snapshots**: every layer is a thin snapshot of its parent's volume
//! - **Transactional metadata**: snapshot records live in SQLite on a dedicated volume
//! - **Compensation**: volume changes are undone when the metadata commit fails
//! - **Pluggable volumes**: an in-memory driver runs the full lifecycle without root
//!
//! ## Usage
//!
//! ```no_run
//! use lvmsnap::{Snapshotter, SnapshotterConfig, SnapshotOptions};
//!
//! # fn example() -> lvmsnap_common::SnapResult<()> {
//! let config = SnapshotterConfig::new("vg0", "pool0")?;
//! let snapshotter = Snapshotter::new(config)?;
//!
//! let mounts = snapshotter.prepare("layer1", "", &SnapshotOptions::default())?;
//! // ... unpack the layer onto mounts[0].source ...
//! snapshotter.commit("base", "layer1", &SnapshotOptions::default())?;
//!
//! let view = snapshotter.view("inspect", "base", &SnapshotOptions::default())?;
//! assert_eq!(view[0].options, vec!["ro".to_string()]);
//! snapshotter.close()?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]

pub mod bootstrap;
pub mod cli;
pub mod config;
pub mod exec;
pub mod metadata;
pub mod server;
pub mod snapshotter;
pub mod types;
pub mod usage;
pub mod volume;

pub use config::{RawConfig, SnapshotterConfig};
pub use snapshotter::Snapshotter;
pub use types::{Info, Kind, Mount, Snapshot, SnapshotOptions, Usage};
