//! Error types for bitflash.

use std::time::Duration;
use thiserror::Error;

/// Result type alias using the crate's error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Failure reported by a platform capability (network, transport, flash).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct PlatformError(String);

impl PlatformError {
    /// Create a platform error with the given message.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }

    /// The underlying message.
    #[must_use]
    pub fn message(&self) -> &str {
        &self.0
    }
}

impl From<std::io::Error> for PlatformError {
    fn from(e: std::io::Error) -> Self {
        Self(e.to_string())
    }
}

impl From<reqwest::Error> for PlatformError {
    fn from(e: reqwest::Error) -> Self {
        Self(e.to_string())
    }
}

/// Why a request against the update endpoint or firmware host failed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RequestFailure {
    /// The server answered with a non-success status.
    #[error("HTTP status {0}")]
    Status(u16),

    /// The transport could not be opened, or failed mid-exchange.
    #[error("transport error: {0}")]
    Transport(#[from] PlatformError),

    /// No bytes arrived for longer than the inactivity timeout.
    #[error("no data received for {0:?}")]
    Stalled(Duration),
}

/// Error type for bitflash operations.
#[derive(Debug, Error)]
pub enum Error {
    /// URL scheme is neither `http` nor `https`.
    #[error("invalid URL protocol: {0}")]
    InvalidProtocol(String),

    /// Network connectivity could not be established.
    #[error("network connection failed after {attempts} attempts")]
    ConnectionFailed {
        /// Number of connection attempts made.
        attempts: u32,
    },

    /// Version-check request failed.
    #[error("failed to fetch version info: {0}")]
    FetchFailed(RequestFailure),

    /// Version-check response body is not a JSON object.
    #[error("failed to parse version info: {0}")]
    ParseFailed(String),

    /// Version-check response lacks a required field.
    #[error("invalid version info format: missing `{0}`")]
    MalformedMetadata(&'static str),

    /// A version string is not `major.minor.patch`.
    #[error("malformed version string: {0:?}")]
    MalformedVersion(String),

    /// Firmware download request failed.
    #[error("failed to download firmware: {0}")]
    DownloadFailed(RequestFailure),

    /// Firmware host advertised no usable content length.
    #[error("invalid firmware size")]
    InvalidSize,

    /// Flash slot cannot hold the advertised image.
    #[error("not enough space for a {size} byte image: {reason}")]
    InsufficientSpace {
        /// Advertised image size in bytes.
        size: u64,
        /// Reason given by the flash writer.
        reason: PlatformError,
    },

    /// Stream ended before the advertised size was written.
    #[error("download incomplete: wrote {written} of {expected} bytes")]
    IncompleteDownload {
        /// Advertised image size in bytes.
        expected: u64,
        /// Bytes actually written to flash.
        written: u64,
    },

    /// Flash writer refused to finalize the image.
    #[error("flash commit failed: {0}")]
    CommitFailed(PlatformError),

    /// Background cycle was cancelled by its owner.
    #[error("update cycle cancelled")]
    Cancelled,

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Short status line reported to the observer for this error.
    #[must_use]
    pub fn status_text(&self) -> &'static str {
        match self {
            Self::InvalidProtocol(_) => "Invalid URL protocol",
            Self::ConnectionFailed { .. } => "WiFi connection failed",
            Self::FetchFailed(_) => "Failed to fetch version info",
            Self::ParseFailed(_) => "Failed to parse version info",
            Self::MalformedMetadata(_) => "Invalid version info format",
            Self::MalformedVersion(_) => "Invalid version string",
            Self::DownloadFailed(_) => "Failed to download firmware",
            Self::InvalidSize => "Invalid firmware size",
            Self::InsufficientSpace { .. } => "Not enough space for update",
            Self::IncompleteDownload { .. } => "Download incomplete",
            Self::CommitFailed(_) => "Update failed",
            Self::Cancelled => "Update cancelled",
            Self::Config(_) => "Invalid configuration",
            Self::Io(_) => "I/O error",
        }
    }
}
