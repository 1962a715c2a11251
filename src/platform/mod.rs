//! Capability interfaces the update core calls into.
//!
//! The core never touches sockets, flash or the wall clock directly. Each
//! of those is a trait here, injected into [`crate::UpdateAgent`] when it is
//! built. Host implementations live in the submodules:
//!
//! - [`http`]: `reqwest` transports (plain and TLS)
//! - [`flash`]: a file-backed flash slot
//! - [`host`]: clock, yield, network, time sync and restart for Linux hosts

pub mod flash;
pub mod host;
pub mod http;

use crate::config::WifiCredentials;
use crate::error::PlatformError;
use async_trait::async_trait;
use bytes::Bytes;
use std::time::Duration;

/// Result type for capability calls.
pub type PlatformResult<T> = std::result::Result<T, PlatformError>;

/// Which kind of channel a transport provides.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    /// Plaintext HTTP.
    Plain,
    /// TLS-encrypted HTTP.
    Encrypted {
        /// Verify the peer certificate against the transport's trust store.
        verify_peer: bool,
    },
}

impl TransportKind {
    /// Whether the channel is encrypted.
    #[must_use]
    pub fn is_encrypted(&self) -> bool {
        matches!(self, Self::Encrypted { .. })
    }
}

/// HTTP method used on a transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    /// GET.
    Get,
    /// POST.
    Post,
}

/// A single request sent over a transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    /// Request method.
    pub method: Method,
    /// Optional body.
    pub body: Option<Bytes>,
    /// `Content-Type` header for the body.
    pub content_type: Option<&'static str>,
}

impl Request {
    /// Bodyless GET.
    #[must_use]
    pub fn get() -> Self {
        Self {
            method: Method::Get,
            body: None,
            content_type: None,
        }
    }

    /// POST with a JSON body.
    #[must_use]
    pub fn post_json(body: impl Into<Bytes>) -> Self {
        Self {
            method: Method::Post,
            body: Some(body.into()),
            content_type: Some("application/json"),
        }
    }
}

/// Status line of a response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Response {
    /// HTTP status code.
    pub status: u16,
    /// Advertised body length, if any.
    pub content_length: Option<u64>,
}

/// An open connection to one URL.
#[async_trait]
pub trait Transport: Send {
    /// Send the request and wait for the response status.
    async fn send(&mut self, request: Request) -> PlatformResult<Response>;

    /// Whether the response body may still deliver bytes.
    fn is_open(&self) -> bool;

    /// Copy available body bytes into `buf`.
    ///
    /// Returns 0 when nothing is available yet; callers poll again after
    /// yielding. A closed stream reports `is_open() == false`.
    async fn read(&mut self, buf: &mut [u8]) -> PlatformResult<usize>;

    /// Read the remaining body, stopping once more than `limit` bytes
    /// have arrived. A result longer than `limit` means the body was cut.
    async fn body(&mut self, limit: usize) -> PlatformResult<Bytes>;

    /// Release the connection. Idempotent.
    fn close(&mut self);
}

/// Opens transports of a requested kind.
pub trait TransportProvider: Send + Sync {
    /// Open a transport to `url`.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection cannot be created.
    fn open(&self, url: &str, kind: TransportKind) -> PlatformResult<Box<dyn Transport>>;
}

/// Network connectivity (typically a Wi-Fi station).
#[async_trait]
pub trait Network: Send {
    /// Start joining the network. Success means the attempt was accepted;
    /// check [`Network::is_connected`] for the link state.
    async fn connect(&mut self, credentials: &WifiCredentials) -> PlatformResult<()>;

    /// Whether the link is up.
    fn is_connected(&self) -> bool;

    /// Drop the link.
    fn disconnect(&mut self);
}

/// Two-phase flash programming: stage bytes, then commit or abort.
pub trait FlashWriter: Send {
    /// Reserve space for an image of `size` bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if the slot cannot hold the image.
    fn begin(&mut self, size: u64) -> PlatformResult<()>;

    /// Stage bytes, returning how many were accepted.
    ///
    /// # Errors
    ///
    /// Returns an error if the write failed.
    fn write(&mut self, data: &[u8]) -> PlatformResult<usize>;

    /// Finalize the staged image as the next boot image.
    ///
    /// # Errors
    ///
    /// Returns an error if the image could not be committed.
    fn end(&mut self) -> PlatformResult<()>;

    /// Discard the staged image.
    fn abort(&mut self);
}

/// Monotonic time source.
#[async_trait]
pub trait Clock: Send + Sync {
    /// Time elapsed since an arbitrary fixed origin.
    fn now(&self) -> Duration;

    /// Wait for `duration`.
    async fn sleep(&self, duration: Duration);
}

/// Wall-clock synchronisation, needed before certificate checks.
#[async_trait]
pub trait TimeSync: Send + Sync {
    /// Block until the wall clock is sane.
    async fn sync(&self) -> PlatformResult<()>;
}

/// Device restart.
pub trait Restart: Send + Sync {
    /// Restart the device. On real hardware this does not return.
    fn restart(&self);
}

/// Cooperative scheduling point.
#[async_trait]
pub trait CooperativeYield: Send + Sync {
    /// Let other pending work run.
    async fn yield_now(&self);
}
