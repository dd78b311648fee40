//! Snapshot records and the values returned to callers.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use lvmsnap_common::{SnapError, VolumeName};
use serde::{Deserialize, Serialize};

/// Snapshot kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Kind {
    /// Writable layer in progress.
    Active,
    /// Read-only, ephemeral mount of a committed snapshot.
    View,
    /// Immutable layer, usable as a parent.
    Committed,
}

impl Kind {
    /// Stable name used in the metadata store.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::View => "view",
            Self::Committed => "committed",
        }
    }
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Kind {
    type Err = SnapError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(Self::Active),
            "view" => Ok(Self::View),
            "committed" => Ok(Self::Committed),
            other => Err(SnapError::InvalidArgument {
                message: format!("unknown snapshot kind {other:?}"),
            }),
        }
    }
}

/// Caller-visible snapshot information.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Info {
    /// Key of the snapshot (the committed name once committed).
    pub name: String,
    /// Name of the parent snapshot, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<String>,
    /// Snapshot kind.
    pub kind: Kind,
    /// Opaque labels.
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    /// Creation time.
    pub created: DateTime<Utc>,
    /// Last update time.
    pub updated: DateTime<Utc>,
}

/// Disk usage of a snapshot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    /// Bytes allocated on disk.
    pub size: i64,
    /// Number of distinct inodes.
    pub inodes: i64,
}

/// Mount descriptor handed back to the caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mount {
    /// Device node, `/dev/<vg>/<id>`.
    pub source: String,
    /// Filesystem type.
    #[serde(rename = "type")]
    pub fs_type: String,
    /// Mount options (`ro` for views).
    pub options: Vec<String>,
}

/// Internal view of a snapshot record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    /// Store-generated id, also the logical volume name.
    pub id: VolumeName,
    /// Snapshot kind.
    pub kind: Kind,
    /// Ancestor ids, nearest first.
    pub parent_ids: Vec<VolumeName>,
}

/// Options accepted by prepare, view and commit.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotOptions {
    /// Labels attached to the new record.
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

impl SnapshotOptions {
    /// Options carrying a single label.
    #[must_use]
    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }
}
