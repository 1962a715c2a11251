//! Firmware update pipeline.
//!
//! This module handles:
//! - Choosing a plain or encrypted channel from a URL ([`transport`])
//! - Asking the update endpoint for the latest version ([`metadata`])
//! - Comparing version strings ([`version`])
//! - Streaming the image into flash ([`installer`])
//!
//! The [`crate::agent`] drives these in sequence.

pub mod installer;
pub mod metadata;
pub mod transport;
pub mod version;


pub use installer::{FlashInstaller, InstallOptions, InstallReport};
pub use metadata::{Metadata, MetadataFetcher};
pub use transport::{Channel, ConnectionSelector};
pub use version::{compare, is_newer, VersionTriple};

use crate::error::Error;
use std::fmt;
use tokio::sync::watch;

/// Where the agent is in an update cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UpdateState {
    /// Waiting for the next check.
    #[default]
    Idle,
    /// Version check in flight.
    Checking,
    /// Firmware download in flight.
    Downloading,
    /// Image committed, restart requested. Terminal.
    Rebooting,
}

impl fmt::Display for UpdateState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::Checking => "checking",
            Self::Downloading => "downloading",
            Self::Rebooting => "rebooting",
        };
        f.write_str(s)
    }
}

/// Result of one update cycle.
#[derive(Debug)]
pub enum CycleOutcome {
    /// The endpoint offered nothing newer.
    UpToDate {
        /// Version currently running.
        current: String,
        /// Version the endpoint advertised.
        available: String,
    },
    /// A new image was committed and the restart capability invoked.
    Installed {
        /// Version installed.
        version: String,
        /// Image size in bytes.
        bytes: u64,
    },
    /// The cycle failed. Already reported to the observer.
    Failed(Error),
}

impl CycleOutcome {
    /// Whether the cycle installed a new image.
    #[must_use]
    pub fn is_installed(&self) -> bool {
        matches!(self, Self::Installed { .. })
    }

    /// The error, if the cycle failed.
    #[must_use]
    pub fn error(&self) -> Option<&Error> {
        match self {
            Self::Failed(e) => Some(e),
            _ => None,
        }
    }
}

/// Cancellation signal observed by a running cycle.
#[derive(Debug, Clone)]
pub struct Cancellation {
    rx: Option<watch::Receiver<bool>>,
}

impl Cancellation {
    /// A signal that never fires.
    #[must_use]
    pub fn never() -> Self {
        Self { rx: None }
    }

    /// A sender/signal pair. Sending `true` cancels.
    #[must_use]
    pub fn channel() -> (watch::Sender<bool>, Self) {
        let (tx, rx) = watch::channel(false);
        (tx, Self { rx: Some(rx) })
    }

    /// Whether cancellation has been requested.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.rx.as_ref().is_some_and(|rx| *rx.borrow())
    }
}
