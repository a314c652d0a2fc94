//! Error envelope shared across the crate.
//!
//! All fallible operations in this crate return [`VmError`]. The variants
//! map onto the failure domains of the system: configuration, the
//! persistent store, the block codec, the external daemon, protocol
//! invariants, and missing keys. Callers that need to branch on "the key
//! simply wasn't there" use [`VmError::is_not_found`] rather than string
//! matching.

use std::fmt;

/// Sentinel daemon error code for failures that originate on our side of
/// the RPC boundary (transport, decoding) rather than in the daemon.
pub const CLIENT_SIDE_ERROR: i64 = -1;

/// Crate-wide error type.
#[derive(Debug)]
pub enum VmError {
    /// Malformed or disallowed configuration. Fatal at initialization.
    Config(String),
    /// Database read/write/iterator failure.
    Store(String),
    /// Block serialization or deserialization failure.
    Codec(String),
    /// Network, auth, malformed response, or daemon-reported error.
    Daemon { code: i64, message: String },
    /// Invariant violation: height mismatch, unknown parent, oversize
    /// payload, divergent daemon.
    Protocol(String),
    /// A key was missing from the store. Recoverable; drives the
    /// "not set yet" branches.
    NotFound(&'static str),
}

impl VmError {
    /// Constructs a [`VmError::Daemon`] for a client-side failure, using
    /// the [`CLIENT_SIDE_ERROR`] sentinel code.
    pub fn daemon_client(message: impl Into<String>) -> Self {
        VmError::Daemon {
            code: CLIENT_SIDE_ERROR,
            message: message.into(),
        }
    }

    /// Constructs a [`VmError::Daemon`] from an error the daemon itself
    /// reported in its response envelope.
    pub fn daemon_reported(code: i64, message: impl Into<String>) -> Self {
        VmError::Daemon {
            code,
            message: message.into(),
        }
    }

    /// Returns `true` if this error is a missing-key lookup.
    pub fn is_not_found(&self) -> bool {
        matches!(self, VmError::NotFound(_))
    }
}

impl fmt::Display for VmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VmError::Config(msg) => write!(f, "config error: {msg}"),
            VmError::Store(msg) => write!(f, "store error: {msg}"),
            VmError::Codec(msg) => write!(f, "codec error: {msg}"),
            VmError::Daemon { code, message } => {
                write!(f, "daemon error (code {code}): {message}")
            }
            VmError::Protocol(msg) => write!(f, "protocol error: {msg}"),
            VmError::NotFound(what) => write!(f, "not found: {what}"),
        }
    }
}

impl std::error::Error for VmError {}
