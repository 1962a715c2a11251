//! Connection strategy selection.
//!
//! Picks a plain or encrypted transport from the URL scheme and hands back a
//! [`Channel`]: the transport tagged with its kind, closed on drop.

use crate::error::{Error, PlatformError, Result};
use crate::platform::{
    PlatformResult, Request, Response, Transport, TransportKind, TransportProvider,
};
use bytes::Bytes;
use std::sync::Arc;
use tracing::debug;

/// Opens channels, choosing the transport kind from the URL.
#[derive(Clone)]
pub struct ConnectionSelector {
    provider: Arc<dyn TransportProvider>,
    verify_tls: bool,
}

impl ConnectionSelector {
    /// Selector over `provider`; `verify_tls` applies to encrypted channels.
    #[must_use]
    pub fn new(provider: Arc<dyn TransportProvider>, verify_tls: bool) -> Self {
        Self {
            provider,
            verify_tls,
        }
    }

    /// Transport kind required by `url`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidProtocol`] unless the scheme is `http` or `https`.
    pub fn kind_for(&self, url: &str) -> Result<TransportKind> {
        let scheme = url
            .split_once("://")
            .map(|(scheme, rest)| (scheme.to_ascii_lowercase(), rest))
            .filter(|(_, rest)| !rest.is_empty());

        match scheme {
            Some((s, _)) if s == "https" => Ok(TransportKind::Encrypted {
                verify_peer: self.verify_tls,
            }),
            Some((s, _)) if s == "http" => Ok(TransportKind::Plain),
            _ => Err(Error::InvalidProtocol(url.to_string())),
        }
    }

    /// Open a channel to `url`.
    ///
    /// The outer error is [`Error::InvalidProtocol`]; the inner one is the
    /// provider failing to open the transport, which callers map to their own
    /// failure kind.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidProtocol`] for unsupported schemes.
    pub fn select(&self, url: &str) -> Result<PlatformResult<Channel>> {
        let kind = self.kind_for(url)?;
        debug!("Selected {:?} transport for {}", kind, url);
        Ok(self.provider.open(url, kind).map(|transport| Channel {
            kind,
            url: url.to_string(),
            transport,
        }))
    }
}

/// An open transport plus the kind it was opened as.
///
/// Dropping the channel closes the transport.
pub struct Channel {
    kind: TransportKind,
    url: String,
    transport: Box<dyn Transport>,
}

impl Channel {
    /// Kind chosen by the selector.
    #[must_use]
    pub fn kind(&self) -> TransportKind {
        self.kind
    }

    /// URL the channel was opened for.
    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }

    /// See [`Transport::send`].
    ///
    /// # Errors
    ///
    /// Returns the transport's error.
    pub async fn send(&mut self, request: Request) -> std::result::Result<Response, PlatformError> {
        self.transport.send(request).await
    }

    /// See [`Transport::is_open`].
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.transport.is_open()
    }

    /// See [`Transport::read`].
    ///
    /// # Errors
    ///
    /// Returns the transport's error.
    pub async fn read(&mut self, buf: &mut [u8]) -> std::result::Result<usize, PlatformError> {
        self.transport.read(buf).await
    }

    /// See [`Transport::body`].
    ///
    /// # Errors
    ///
    /// Returns the transport's error.
    pub async fn body(&mut self, limit: usize) -> std::result::Result<Bytes, PlatformError> {
        self.transport.body(limit).await
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        self.transport.close();
        debug!("Closed transport to {}", self.url);
    }
}
