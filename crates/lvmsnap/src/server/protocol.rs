//! Wire format: one JSON object per line in each direction.
//!
//! ```text
//! → {"op":"prepare","key":"layer1","parent":""}
//! ← {"status":"ok","result":{"mounts":[{"source":"/dev/vg0/1","type":"xfs","options":[]}]}}
//! → {"op":"stat","key":"nope"}
//! ← {"status":"error","code":"not_found","message":"snapshot \"nope\": not found"}
//! ```

use std::collections::BTreeMap;

use lvmsnap_common::SnapError;
use serde::{Deserialize, Serialize};

use crate::types::{Info, Mount, Usage};

/// A request from the client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Request {
    /// Info of a snapshot.
    Stat {
        /// Snapshot key.
        key: String,
    },
    /// Patch labels.
    Update {
        /// Snapshot key.
        key: String,
        /// New label values.
        #[serde(default)]
        labels: BTreeMap<String, String>,
        /// Fields to apply, e.g. `labels.foo`.
        #[serde(default)]
        field_paths: Vec<String>,
    },
    /// Disk usage.
    Usage {
        /// Snapshot key.
        key: String,
    },
    /// Mount descriptors.
    Mounts {
        /// Snapshot key.
        key: String,
    },
    /// New active snapshot.
    Prepare {
        /// New snapshot key.
        key: String,
        /// Parent key, empty for a base layer.
        #[serde(default)]
        parent: String,
        /// Labels of the new snapshot.
        #[serde(default)]
        labels: BTreeMap<String, String>,
    },
    /// New read-only view.
    View {
        /// New snapshot key.
        key: String,
        /// Committed parent key.
        parent: String,
        /// Labels of the new snapshot.
        #[serde(default)]
        labels: BTreeMap<String, String>,
    },
    /// Commit an active snapshot.
    Commit {
        /// Committed name.
        name: String,
        /// Active snapshot key.
        key: String,
        /// Labels of the committed snapshot.
        #[serde(default)]
        labels: BTreeMap<String, String>,
    },
    /// Remove a snapshot.
    Remove {
        /// Snapshot key.
        key: String,
    },
    /// Info of every snapshot.
    Walk,
}

/// Result body of a successful request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Payload {
    /// From `stat` and `update`.
    Info(Info),
    /// From `usage`.
    Usage(Usage),
    /// From `mounts`, `prepare` and `view`.
    Mounts(Vec<Mount>),
    /// From `walk`.
    Infos(Vec<Info>),
}

/// Error class reported to the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// Unknown key.
    NotFound,
    /// Key or name taken.
    AlreadyExists,
    /// Wrong snapshot state.
    FailedPrecondition,
    /// Malformed request.
    InvalidArgument,
    /// Anything else.
    Internal,
}

impl From<&SnapError> for ErrorCode {
    fn from(err: &SnapError) -> Self {
        match err {
            SnapError::NotFound { .. } => Self::NotFound,
            SnapError::AlreadyExists { .. } => Self::AlreadyExists,
            SnapError::FailedPrecondition { .. } => Self::FailedPrecondition,
            SnapError::InvalidArgument { .. }
            | SnapError::InvalidSize { .. }
            | SnapError::InvalidVolumeName { .. } => Self::InvalidArgument,
            _ => Self::Internal,
        }
    }
}

/// A response to the client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Response {
    /// The request succeeded.
    Ok {
        /// Result body, absent for `commit`, `remove`.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        result: Option<Payload>,
    },
    /// The request failed.
    Error {
        /// Error class.
        code: ErrorCode,
        /// Human-readable message.
        message: String,
    },
}

impl Response {
    /// Success with a body.
    #[must_use]
    pub const fn ok(payload: Payload) -> Self {
        Self::Ok {
            result: Some(payload),
        }
    }

    /// Success without a body.
    #[must_use]
    pub const fn empty() -> Self {
        Self::Ok { result: None }
    }

    /// Failure with an explicit code.
    #[must_use]
    pub fn failure(code: ErrorCode, message: impl Into<String>) -> Self {
        Self::Error {
            code,
            message: message.into(),
        }
    }
}

impl From<&SnapError> for Response {
    fn from(err: &SnapError) -> Self {
        Self::failure(ErrorCode::from(err), err.to_string())
    }
}
