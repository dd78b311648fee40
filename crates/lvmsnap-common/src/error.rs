//! Error types shared across the lvmsnap crates.

use std::path::PathBuf;

use miette::Diagnostic;
use thiserror::Error;

/// Result type alias using [`SnapError`].
pub type SnapResult<T> = Result<T, SnapError>;

/// Errors surfaced by the snapshotter.
#[derive(Error, Diagnostic, Debug)]
pub enum SnapError {
    /// Snapshot (or parent) not found.
    #[error("{what}: not found")]
    #[diagnostic(code(lvmsnap::not_found))]
    NotFound {
        /// What was looked up, e.g. `snapshot "layer1"`.
        what: String,
    },

    /// Key or committed name already in use.
    #[error("{what}: already exists")]
    #[diagnostic(code(lvmsnap::already_exists))]
    AlreadyExists {
        /// The conflicting key or name.
        what: String,
    },

    /// The snapshot is not in a state that allows the operation.
    #[error("failed precondition: {message}")]
    #[diagnostic(code(lvmsnap::failed_precondition))]
    FailedPrecondition {
        /// Why the operation was refused.
        message: String,
    },

    /// Malformed request from the caller.
    #[error("invalid argument: {message}")]
    #[diagnostic(code(lvmsnap::invalid_argument))]
    InvalidArgument {
        /// What was wrong.
        message: String,
    },

    /// Configuration error.
    #[error("configuration error: {message}")]
    #[diagnostic(
        code(lvmsnap::config),
        help("Both vol_group and thin_pool must name existing LVM objects")
    )]
    Config {
        /// The error message.
        message: String,
    },

    /// Invalid human-readable size.
    #[error("invalid size: {value}")]
    #[diagnostic(
        code(lvmsnap::config::size),
        help("Use formats like '10G', '512MB', '1.5GiB' or a plain byte count")
    )]
    InvalidSize {
        /// The rejected value.
        value: String,
    },

    /// Name that LVM would refuse as a logical volume name.
    #[error("invalid volume name: {name}")]
    #[diagnostic(
        code(lvmsnap::volume::invalid_name),
        help("Volume names use [a-zA-Z0-9+_.-], must not start with '-' and are at most 127 characters")
    )]
    InvalidVolumeName {
        /// The rejected name.
        name: String,
    },

    /// A volume operation failed.
    #[error("{context}: {source}")]
    #[diagnostic(code(lvmsnap::volume))]
    Volume {
        /// Short static description of the failed step.
        context: &'static str,
        /// The underlying volume error.
        #[source]
        source: VolumeError,
    },

    /// Metadata store failure.
    #[error("metadata store error: {message}")]
    #[diagnostic(code(lvmsnap::store))]
    Store {
        /// The error message.
        message: String,
    },

    /// Metadata and volumes no longer agree.
    #[error("inconsistent state: {message}")]
    #[diagnostic(
        code(lvmsnap::inconsistent),
        help("Manual intervention required: compare `lvs` output with the snapshot metadata")
    )]
    Inconsistent {
        /// What is out of sync.
        message: String,
    },

    /// I/O error.
    #[error("I/O error: {0}")]
    #[diagnostic(code(lvmsnap::io))]
    Io(#[from] std::io::Error),

    /// Serialization error.
    #[error("serialization error: {0}")]
    #[diagnostic(code(lvmsnap::serialization))]
    Serialization(String),
}

impl SnapError {
    /// Wrap a volume error with a static context string.
    #[must_use]
    pub fn volume(context: &'static str, source: VolumeError) -> Self {
        Self::Volume { context, source }
    }

    /// Whether this error means the key (or name) does not exist.
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

impl From<serde_json::Error> for SnapError {
    fn from(err: serde_json::Error) -> Self {
        SnapError::Serialization(err.to_string())
    }
}

/// Failure of a single external command after all retries.
#[derive(Error, Debug)]
pub enum CommandError {
    /// The program could not be started at all.
    #[error("failed to run {program}: {source}")]
    Spawn {
        /// Program name.
        program: String,
        /// Spawn error.
        #[source]
        source: std::io::Error,
    },

    /// The program ran and exited unsuccessfully.
    #[error("{command} exited with {}: {output}", display_code(.code))]
    Failed {
        /// Program and arguments, space-joined.
        command: String,
        /// Exit code, `None` when killed by a signal.
        code: Option<i32>,
        /// Combined, trimmed output.
        output: String,
    },
}

impl CommandError {
    /// Exit code of a failed command, if it exited normally.
    #[must_use]
    pub const fn exit_code(&self) -> Option<i32> {
        match self {
            Self::Failed { code, .. } => *code,
            Self::Spawn { .. } => None,
        }
    }

    /// Combined output of a failed command.
    #[must_use]
    pub fn output(&self) -> &str {
        match self {
            Self::Failed { output, .. } => output,
            Self::Spawn { .. } => "",
        }
    }
}

fn display_code(code: &Option<i32>) -> String {
    code.map_or_else(|| "signal".to_string(), |c| format!("status {c}"))
}

/// Errors from the volume layer.
#[derive(Error, Debug)]
pub enum VolumeError {
    /// The volume group or logical volume does not exist.
    #[error("{name} not found")]
    NotFound {
        /// `vg` or `vg/lv`.
        name: String,
    },

    /// The external tool failed.
    #[error(transparent)]
    Tool(#[from] CommandError),

    /// A mount or unmount syscall failed.
    #[error("mount operation on {} failed: {source}", .target.display())]
    Mount {
        /// Mount point.
        target: PathBuf,
        /// Syscall error.
        #[source]
        source: std::io::Error,
    },

    /// Filesystem error around mount points.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let err = SnapError::NotFound {
            what: "snapshot \"layer1\"".to_string(),
        };
        assert_eq!(err.to_string(), "snapshot \"layer1\": not found");
        assert!(err.is_not_found());
    }

    #[test]
    fn volume_error_keeps_context() {
        let err = SnapError::volume(
            "unable to create volume",
            VolumeError::Tool(CommandError::Failed {
                command: "lvcreate --name 1".to_string(),
                code: Some(5),
                output: "Insufficient free space".to_string(),
            }),
        );
        assert_eq!(
            err.to_string(),
            "unable to create volume: lvcreate --name 1 exited with status 5: Insufficient free space"
        );
    }

    #[test]
    fn command_error_signal() {
        let err = CommandError::Failed {
            command: "mkfs.xfs".to_string(),
            code: None,
            output: String::new(),
        };
        assert_eq!(err.exit_code(), None);
        assert!(err.to_string().contains("signal"));
    }

    #[test]
    fn error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: SnapError = io_err.into();
        assert!(matches!(err, SnapError::Io(_)));
    }
}
