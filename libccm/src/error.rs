//! Error types.
//!
//! Engine components fail with [`CcmError`], a [`thiserror`] enum that keeps
//! the failing path and a human-readable reason.  Service handlers convert it
//! into a [`Status`], the RPC-facing pair of [`Code`] and message that
//! travels back to the caller over the transport.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Unified error type for engine operations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CcmError {
    /// The caller supplied a missing or malformed request field.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The configuration source has no bundle with this name.
    #[error("config bundle {0} not found")]
    SourceNotFound(String),

    /// The configuration source could not be queried.
    #[error("failed to fetch config bundle {name}: {reason}")]
    SourceFetch {
        /// Bundle name that was requested.
        name: String,
        /// Human-readable failure reason.
        reason: String,
    },

    /// Writing volume content or metadata failed.
    #[error("write failed at {path}: {reason}")]
    WriteFailed {
        /// Path that could not be written.
        path: String,
        /// Human-readable failure reason.
        reason: String,
    },

    /// No metadata record exists for the volume.
    #[error("metadata for volume {0} not found")]
    MetadataNotFound(String),

    /// The metadata record exists but cannot be decoded.
    #[error("metadata for volume {volume_id} is corrupt: {reason}")]
    MetadataCorrupt {
        /// Volume whose record failed to decode.
        volume_id: String,
        /// Decoder error.
        reason: String,
    },

    /// A mount operation failed.
    #[error("mount failed at {path}: {reason}")]
    MountFailed {
        /// Filesystem path where the mount was attempted.
        path: String,
        /// Human-readable failure reason.
        reason: String,
    },

    /// An unmount operation failed.
    #[error("unmount failed at {path}: {reason}")]
    UnmountFailed {
        /// Filesystem path where the unmount was attempted.
        path: String,
        /// Human-readable failure reason.
        reason: String,
    },

    /// The caller cancelled the request or its deadline passed.
    #[error("operation cancelled: {0}")]
    Cancelled(String),

    /// The operation is not supported by this plugin.
    #[error("not implemented: {0}")]
    Unimplemented(String),

    /// A socket / transport-level error.
    #[error("transport error: {0}")]
    TransportError(String),

    /// An unclassified internal error.
    #[error("internal error: {0}")]
    Internal(String),
}

impl CcmError {
    /// Create a [`CcmError::TransportError`] from anything that implements
    /// [`std::fmt::Display`].
    pub fn transport<E: fmt::Display>(e: E) -> Self {
        Self::TransportError(e.to_string())
    }

    /// Create a [`CcmError::Internal`] from anything that implements
    /// [`std::fmt::Display`].
    pub fn internal<E: fmt::Display>(e: E) -> Self {
        Self::Internal(e.to_string())
    }

    /// Create a [`CcmError::WriteFailed`] for `path`.
    pub fn write<P: fmt::Display, E: fmt::Display>(path: P, e: E) -> Self {
        Self::WriteFailed {
            path: path.to_string(),
            reason: e.to_string(),
        }
    }

    /// Classify this error into the status code reported to callers.
    pub fn code(&self) -> Code {
        match self {
            Self::InvalidArgument(_) => Code::InvalidArgument,
            Self::Cancelled(_) => Code::Cancelled,
            Self::Unimplemented(_) => Code::Unimplemented,
            _ => Code::Internal,
        }
    }
}

/// Status codes reported to RPC callers.
///
/// The numbering follows the gRPC status codes so callers can map them
/// one-to-one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Code {
    /// The operation completed successfully.
    Ok = 0,
    /// The operation was cancelled.
    Cancelled = 1,
    /// Client specified an invalid argument.
    InvalidArgument = 3,
    /// Some requested entity was not found.
    NotFound = 5,
    /// Operation is not implemented or not supported.
    Unimplemented = 12,
    /// Internal error.
    Internal = 13,
}

impl fmt::Display for Code {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Ok => "OK",
            Self::Cancelled => "Cancelled",
            Self::InvalidArgument => "InvalidArgument",
            Self::NotFound => "NotFound",
            Self::Unimplemented => "Unimplemented",
            Self::Internal => "Internal",
        };
        f.write_str(name)
    }
}

/// RPC status: a [`Code`] plus a message for the caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Status {
    code: Code,
    message: String,
}

impl Status {
    /// Create a status with an arbitrary code.
    pub fn new(code: Code, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    /// Shorthand for [`Code::InvalidArgument`].
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::new(Code::InvalidArgument, message)
    }

    /// Shorthand for [`Code::Internal`].
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(Code::Internal, message)
    }

    /// Shorthand for [`Code::Unimplemented`].
    pub fn unimplemented(message: impl Into<String>) -> Self {
        Self::new(Code::Unimplemented, message)
    }

    /// Status code.
    pub fn code(&self) -> Code {
        self.code
    }

    /// Message for the caller.
    pub fn message(&self) -> &str {
        &self.message
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl std::error::Error for Status {}

impl From<CcmError> for Status {
    fn from(e: CcmError) -> Self {
        Self::new(e.code(), e.to_string())
    }
}
