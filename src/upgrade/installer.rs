//! Streams a firmware image from the network into flash.
//!
//! ```text
//! open channel ── GET ── status 200? ── content length > 0?
//!                                              │
//!                                   flash.begin(len)   (nothing written yet)
//!                                              │
//!            ┌──── read ≤ chunk ── flash.write ── notify % ── yield ◄──┐
//!            │                                                         │
//!            └─────────── while open && written < len ─────────────────┘
//!                                              │
//!                                     close channel
//!                                              │
//!                          written == len ? commit : abort
//! ```

use crate::error::{Error, PlatformError, RequestFailure, Result};
use crate::event::{notify, Notification, Observer};
use crate::platform::{Clock, CooperativeYield, FlashWriter, Request};
use crate::upgrade::transport::{Channel, ConnectionSelector};
use crate::upgrade::Cancellation;
use std::time::Duration;
use tracing::{debug, info, warn};

/// HTTP status the firmware host must answer with.
const HTTP_OK: u16 = 200;

/// Status text attached to progress notifications.
pub const DOWNLOADING: &str = "Downloading update";

/// Outcome of a committed install.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InstallReport {
    /// Bytes written and committed.
    pub bytes: u64,
}

/// Download tuning for one install.
#[derive(Debug, Clone, Copy)]
pub struct InstallOptions {
    /// Upper bound on bytes read per iteration.
    pub chunk_size: usize,
    /// Fail when no bytes arrive for this long.
    pub inactivity_timeout: Duration,
}

/// A flash write that aborts unless explicitly committed.
struct PendingWrite<'f> {
    flash: &'f mut dyn FlashWriter,
    finished: bool,
}

impl<'f> PendingWrite<'f> {
    fn begin(flash: &'f mut dyn FlashWriter, size: u64) -> Result<Self> {
        flash
            .begin(size)
            .map_err(|reason| Error::InsufficientSpace { size, reason })?;
        Ok(Self {
            flash,
            finished: false,
        })
    }

    fn write(&mut self, data: &[u8]) -> std::result::Result<usize, PlatformError> {
        self.flash.write(data)
    }

    fn commit(mut self) -> Result<()> {
        self.finished = true;
        self.flash.end().map_err(Error::CommitFailed)
    }

    fn abort(mut self) {
        self.finished = true;
        self.flash.abort();
    }
}

impl Drop for PendingWrite<'_> {
    fn drop(&mut self) {
        if !self.finished {
            warn!("Pending flash write dropped before completion, aborting");
            self.flash.abort();
        }
    }
}

/// Downloads firmware and programs it into flash.
pub struct FlashInstaller<'a> {
    selector: &'a ConnectionSelector,
    clock: &'a dyn Clock,
    yielder: &'a dyn CooperativeYield,
    observer: Option<&'a Observer>,
    options: InstallOptions,
}

impl<'a> FlashInstaller<'a> {
    /// Installer using the given capabilities.
    #[must_use]
    pub fn new(
        selector: &'a ConnectionSelector,
        clock: &'a dyn Clock,
        yielder: &'a dyn CooperativeYield,
        observer: Option<&'a Observer>,
        options: InstallOptions,
    ) -> Self {
        Self {
            selector,
            clock,
            yielder,
            observer,
            options,
        }
    }

    /// Download `location` into `flash` and commit it.
    ///
    /// The channel is closed before the pending write is aborted or
    /// committed. No flash write happens before the size check passes.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidProtocol`] for an unsupported URL scheme
    /// - [`Error::DownloadFailed`] for transport failures, a non-200 status or a stalled stream
    /// - [`Error::InvalidSize`] if no positive content length is advertised
    /// - [`Error::InsufficientSpace`] if flash cannot hold the image
    /// - [`Error::IncompleteDownload`] if fewer bytes than advertised were written
    /// - [`Error::CommitFailed`] if flash refuses the finished image
    /// - [`Error::Cancelled`] if `cancel` fires mid-download
    pub async fn install(
        &self,
        location: &str,
        flash: &mut dyn FlashWriter,
        cancel: &Cancellation,
    ) -> Result<InstallReport> {
        let mut channel = self.selector.select(location)?.map_err(transport_failure)?;

        info!("Downloading firmware from {}", location);
        let response = channel
            .send(Request::get())
            .await
            .map_err(transport_failure)?;
        if response.status != HTTP_OK {
            warn!("Firmware download returned HTTP {}", response.status);
            return Err(Error::DownloadFailed(RequestFailure::Status(response.status)));
        }

        let expected = match response.content_length {
            Some(len) if len > 0 => len,
            _ => return Err(Error::InvalidSize),
        };

        let mut pending = PendingWrite::begin(flash, expected)?;
        let streamed = self.stream(&mut channel, &mut pending, expected, cancel).await;
        drop(channel);

        let written = match streamed {
            Ok(written) => written,
            Err(e) => {
                pending.abort();
                return Err(e);
            }
        };

        if written != expected {
            warn!("Download incomplete: {} of {} bytes", written, expected);
            pending.abort();
            return Err(Error::IncompleteDownload { expected, written });
        }

        pending.commit()?;
        info!("Firmware image committed ({} bytes)", written);
        Ok(InstallReport { bytes: written })
    }

    async fn stream(
        &self,
        channel: &mut Channel,
        pending: &mut PendingWrite<'_>,
        expected: u64,
        cancel: &Cancellation,
    ) -> Result<u64> {
        let mut buf = vec![0u8; self.options.chunk_size];
        let mut written = 0u64;
        let mut last_activity = self.clock.now();

        while channel.is_open() && written < expected {
            if cancel.is_cancelled() {
                info!("Download cancelled after {} bytes", written);
                return Err(Error::Cancelled);
            }

            let remaining = usize::try_from(expected - written).unwrap_or(usize::MAX);
            let want = buf.len().min(remaining);
            let n = channel
                .read(&mut buf[..want])
                .await
                .map_err(transport_failure)?;

            if n > 0 {
                let accepted = match pending.write(&buf[..n]) {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        warn!("Flash write failed: {}", e);
                        break;
                    }
                };
                written += accepted as u64;
                last_activity = self.clock.now();
                notify(
                    self.observer,
                    &Notification::progress(DOWNLOADING, percent(written, expected)),
                );
                if accepted < n {
                    warn!("Flash accepted {} of {} bytes", accepted, n);
                    break;
                }
            } else {
                let idle = self.clock.now().saturating_sub(last_activity);
                if idle >= self.options.inactivity_timeout {
                    warn!("No firmware data for {:?}, giving up", idle);
                    return Err(Error::DownloadFailed(RequestFailure::Stalled(idle)));
                }
            }

            self.yielder.yield_now().await;
        }

        debug!("Stream finished: {} of {} bytes", written, expected);
        Ok(written)
    }
}

fn transport_failure(e: PlatformError) -> Error {
    Error::DownloadFailed(RequestFailure::Transport(e))
}

#[allow(clippy::cast_possible_truncation)]
fn percent(written: u64, expected: u64) -> u8 {
    (written.saturating_mul(100) / expected).min(100) as u8
}
