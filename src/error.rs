//! Error types for chanrelay.
//!
//! All errors are strongly typed using thiserror. Source failures carry
//! their classification, so the session state machine can match on them
//! instead of re-parsing messages.

use thiserror::Error;

/// Construction-time validation errors.
///
/// These are the only errors that reach callers as hard failures; everything
/// a running session encounters is handled inside the session.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Device id cannot be empty")]
    EmptyDeviceId,

    #[error("Invalid device address '{address}': {reason}")]
    InvalidAddress {
        address: String,
        reason: String,
    },

    #[error("Field '{field}' must be greater than zero")]
    ZeroValue {
        field: String,
    },

    #[error("Invalid hysteresis thresholds: exit ({exit}) must be below enter ({enter})")]
    InvalidHysteresis {
        enter: usize,
        exit: usize,
    },

    #[error("Channel position {position} is out of range for {total} channels")]
    ChannelPositionOutOfRange {
        position: usize,
        total: usize,
    },

    #[error("{count} consecutive ports starting at {base_port} exceed 65535")]
    PortRangeOverflow {
        base_port: u16,
        count: u16,
    },

    #[error("Duplicate device id: {id}")]
    DuplicateDevice {
        id: String,
    },

    #[error("Failed to read config file '{path}': {reason}")]
    Unreadable {
        path: String,
        reason: String,
    },

    #[error("Failed to parse config: {reason}")]
    Parse {
        reason: String,
    },
}

/// Classified failures of a chunk source.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SourceError {
    /// The remote endpoint could not be reached at all.
    #[error("Endpoint unavailable: {message}")]
    Unavailable {
        message: String,
    },

    /// Failure after the remote call was established, or an abrupt end of stream.
    #[error("Transient stream failure: {message}")]
    Transient {
        message: String,
    },

    /// No replay file configured, or the file could not be used.
    #[error("Replay file unusable: {reason}")]
    ConfigMissing {
        reason: String,
    },

    /// A chunk whose length does not match the session's shape.
    #[error("Malformed chunk of {len} samples (expected {expected})")]
    MalformedChunk {
        len: usize,
        expected: usize,
    },
}

impl SourceError {
    /// Creates an unavailable error.
    #[must_use]
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::Unavailable {
            message: message.into(),
        }
    }

    /// Creates a transient error.
    #[must_use]
    pub fn transient(message: impl Into<String>) -> Self {
        Self::Transient {
            message: message.into(),
        }
    }

    /// Creates a config-missing error.
    #[must_use]
    pub fn config_missing(reason: impl Into<String>) -> Self {
        Self::ConfigMissing {
            reason: reason.into(),
        }
    }

    /// Returns true if the endpoint was unreachable.
    #[must_use]
    pub const fn is_unavailable(&self) -> bool {
        matches!(self, Self::Unavailable { .. })
    }

    /// Returns true if the failure warrants a delayed reconnect.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Transient { .. })
    }
}

/// Transport errors for the gRPC surfaces.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Failed to bind {addr}: {message}")]
    BindFailed {
        addr: String,
        message: String,
    },

    #[error("Server error: {message}")]
    Serve {
        message: String,
    },
}

/// Top-level error type for chanrelay.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Source error: {0}")]
    Source(#[from] SourceError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Unknown device: {id}")]
    UnknownDevice {
        id: String,
    },

    #[error("Channel disconnected: {path}")]
    Disconnected {
        path: String,
    },

    #[error("Operation timed out after {duration_ms}ms")]
    Timeout {
        duration_ms: u64,
    },

    #[error("Internal error: {message}")]
    Internal {
        message: String,
    },
}

impl RelayError {
    /// Creates an internal error.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Returns true if this is a configuration error.
    #[must_use]
    pub const fn is_config(&self) -> bool {
        matches!(self, Self::Config(_))
    }

    /// Returns true if this is a source error.
    #[must_use]
    pub const fn is_source(&self) -> bool {
        matches!(self, Self::Source(_))
    }

    /// Returns true if retrying the same call may succeed.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        match self {
            Self::Config(_)
            | Self::UnknownDevice { .. }
            | Self::Disconnected { .. }
            | Self::Internal { .. } => false,
            Self::Timeout { .. } => true,
            Self::Source(e) => e.is_transient(),
            Self::Transport(e) => matches!(e, TransportError::Serve { .. }),
        }
    }
}

/// Result type alias for chanrelay operations.
pub type RelayResult<T> = Result<T, RelayError>;
