//! Common error types for baggageclaim.

use miette::Diagnostic;
use thiserror::Error;

/// Result type alias using [`ClaimError`].
pub type ClaimResult<T> = Result<T, ClaimError>;

/// Broad classes that callers map onto transport status codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// The addressed volume or path does not exist.
    NotFound,
    /// The request itself is malformed.
    Validation,
    /// Volume metadata exists but cannot be read.
    Corruption,
    /// I/O, mount or subprocess failure.
    Infra,
    /// A stream exceeded its byte limit.
    StreamLimit,
    /// The caller violated the promise protocol.
    Concurrency,
}

/// Errors raised by the volume engine.
#[derive(Error, Diagnostic, Debug)]
pub enum ClaimError {
    /// Volume not found.
    #[error("volume does not exist: {handle}")]
    #[diagnostic(code(baggageclaim::volume::not_found))]
    VolumeNotFound {
        /// The handle that was looked up.
        handle: String,
    },

    /// A volume with this handle is already initializing or live.
    #[error("volume already exists: {handle}")]
    #[diagnostic(code(baggageclaim::volume::already_exists))]
    VolumeAlreadyExists {
        /// The conflicting handle.
        handle: String,
    },

    /// Volume metadata could not be read.
    #[error("volume is corrupted: {handle}")]
    #[diagnostic(code(baggageclaim::volume::corrupted))]
    VolumeCorrupted {
        /// The corrupted handle.
        handle: String,
    },

    /// Handle rejected before touching the filesystem.
    #[error("invalid volume handle: {handle:?}")]
    #[diagnostic(
        code(baggageclaim::volume::invalid_handle),
        help("Handles must be non-empty and may not contain '/' or be '.' or '..'")
    )]
    InvalidHandle {
        /// The rejected handle.
        handle: String,
    },

    /// A copy-on-write strategy named no parent.
    #[error("no parent volume provided")]
    #[diagnostic(code(baggageclaim::strategy::no_parent))]
    NoParentVolumeProvided,

    /// A copy-on-write strategy named a parent that is not live.
    #[error("parent volume not found: {handle}")]
    #[diagnostic(code(baggageclaim::strategy::parent_not_found))]
    ParentVolumeNotFound {
        /// The missing parent handle.
        handle: String,
    },

    /// Strategy payload carried an unrecognised type tag.
    #[error("unknown strategy: {kind}")]
    #[diagnostic(
        code(baggageclaim::strategy::unknown),
        help("Supported strategies are 'empty', 'cow' and 'import'")
    )]
    UnknownStrategy {
        /// The tag that was received.
        kind: String,
    },

    /// Strategy payload could not be decoded.
    #[error("invalid strategy: {message}")]
    #[diagnostic(code(baggageclaim::strategy::invalid))]
    InvalidStrategy {
        /// What was wrong with it.
        message: String,
    },

    /// Stream encoding outside gzip/zstd/s2/raw.
    #[error("unsupported stream encoding: {encoding:?}")]
    #[diagnostic(
        code(baggageclaim::stream::unsupported_encoding),
        help("Use one of 'gzip', 'zstd', 's2' or 'raw'")
    )]
    UnsupportedEncoding {
        /// The rejected encoding.
        encoding: String,
    },

    /// More bytes arrived than the caller allowed.
    #[error("stream exceeded limit of {limit} bytes")]
    #[diagnostic(code(baggageclaim::stream::limit_exceeded))]
    StreamLimitExceeded {
        /// The configured limit.
        limit: u64,
    },

    /// The incoming archive is malformed.
    #[error("bad stream: {message}")]
    #[diagnostic(code(baggageclaim::stream::bad_stream))]
    BadStream {
        /// Decoder or archiver message.
        message: String,
    },

    /// The path to stream out does not exist inside the volume.
    #[error("no such file or directory: {path}")]
    #[diagnostic(code(baggageclaim::stream::source_not_found))]
    SourcePathNotFound {
        /// The sub-path that was requested.
        path: String,
    },

    /// A creation is already in flight for this handle.
    #[error("promise already exists in list: {handle}")]
    #[diagnostic(code(baggageclaim::promise::already_exists))]
    PromiseAlreadyExists {
        /// The handle with an in-flight creation.
        handle: String,
    },

    /// The promise was already settled.
    #[error("promise is not pending")]
    #[diagnostic(code(baggageclaim::promise::not_pending))]
    PromiseNotPending,

    /// The promise was canceled before it could be fulfilled.
    #[error("promise was canceled")]
    #[diagnostic(code(baggageclaim::promise::canceled))]
    PromiseCanceled,

    /// The promise has not been settled yet.
    #[error("promise is still pending")]
    #[diagnostic(code(baggageclaim::promise::still_pending))]
    PromiseStillPending,

    /// External command exited unsuccessfully.
    #[error("command `{command}` failed ({status}): {stderr}")]
    #[diagnostic(code(baggageclaim::command))]
    Command {
        /// The command line.
        command: String,
        /// Exit status description.
        status: String,
        /// Captured standard error.
        stderr: String,
    },

    /// A peer rejected a streamed volume.
    #[error("p2p streaming error {status}: {message}")]
    #[diagnostic(code(baggageclaim::stream::peer))]
    Peer {
        /// HTTP status returned by the peer.
        status: u16,
        /// Error message decoded from the peer's response.
        message: String,
    },

    /// HTTP client failure.
    #[error("HTTP error: {message}")]
    #[diagnostic(code(baggageclaim::http))]
    Http {
        /// The client error.
        message: String,
    },

    /// I/O error.
    #[error("I/O error: {0}")]
    #[diagnostic(code(baggageclaim::io))]
    Io(#[from] std::io::Error),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    #[diagnostic(code(baggageclaim::serialization))]
    Serialization(String),

    /// Configuration error.
    #[error("Configuration error: {message}")]
    #[diagnostic(code(baggageclaim::config))]
    Config {
        /// The error message.
        message: String,
    },

    /// Feature not supported on this platform.
    #[error("Feature not supported: {feature}")]
    #[diagnostic(
        code(baggageclaim::unsupported),
        help("Overlay and btrfs drivers require Linux")
    )]
    Unsupported {
        /// The unsupported feature.
        feature: String,
    },

    /// Internal error (should not happen).
    #[error("Internal error: {message}")]
    #[diagnostic(code(baggageclaim::internal))]
    Internal {
        /// The error message.
        message: String,
    },
}

impl ClaimError {
    /// Shorthand for [`ClaimError::VolumeNotFound`].
    pub fn not_found(handle: impl Into<String>) -> Self {
        Self::VolumeNotFound {
            handle: handle.into(),
        }
    }

    /// Which class of failure this is.
    #[must_use]
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::VolumeNotFound { .. } | Self::SourcePathNotFound { .. } => ErrorClass::NotFound,
            Self::VolumeAlreadyExists { .. }
            | Self::InvalidHandle { .. }
            | Self::NoParentVolumeProvided
            | Self::ParentVolumeNotFound { .. }
            | Self::UnknownStrategy { .. }
            | Self::InvalidStrategy { .. }
            | Self::UnsupportedEncoding { .. }
            | Self::BadStream { .. } => ErrorClass::Validation,
            Self::VolumeCorrupted { .. } => ErrorClass::Corruption,
            Self::StreamLimitExceeded { .. } => ErrorClass::StreamLimit,
            Self::PromiseAlreadyExists { .. }
            | Self::PromiseNotPending
            | Self::PromiseCanceled
            | Self::PromiseStillPending => ErrorClass::Concurrency,
            Self::Command { .. }
            | Self::Peer { .. }
            | Self::Http { .. }
            | Self::Io(_)
            | Self::Serialization(_)
            | Self::Config { .. }
            | Self::Unsupported { .. }
            | Self::Internal { .. } => ErrorClass::Infra,
        }
    }

    /// True for [`ClaimError::VolumeNotFound`].
    #[must_use]
    pub const fn is_volume_not_found(&self) -> bool {
        matches!(self, Self::VolumeNotFound { .. })
    }
}

impl From<serde_json::Error> for ClaimError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}
