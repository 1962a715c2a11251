//! `reqwest` transports for plain and TLS endpoints.

use super::{Method, PlatformResult, Request, Response, Transport, TransportKind, TransportProvider};
use crate::error::PlatformError;
use async_trait::async_trait;
use bytes::Bytes;
use reqwest::header::CONTENT_TYPE;
use std::time::Duration;
use tracing::debug;

/// Opens HTTP(S) transports.
///
/// Keeps one client that verifies TLS peers and one that does not, so the
/// verification flag costs nothing per request.
#[derive(Debug, Clone)]
pub struct HttpTransportProvider {
    verified: reqwest::Client,
    insecure: reqwest::Client,
}

impl HttpTransportProvider {
    /// Build clients that give up on a body read after `read_timeout`.
    ///
    /// # Errors
    ///
    /// Returns an error if the TLS backend cannot be initialised.
    pub fn new(read_timeout: Duration) -> PlatformResult<Self> {
        let user_agent = format!("bitflash/{}", env!("CARGO_PKG_VERSION"));

        let verified = reqwest::Client::builder()
            .user_agent(&user_agent)
            .read_timeout(read_timeout)
            .build()?;

        let insecure = reqwest::Client::builder()
            .user_agent(&user_agent)
            .read_timeout(read_timeout)
            .danger_accept_invalid_certs(true)
            .build()?;

        Ok(Self { verified, insecure })
    }
}

impl TransportProvider for HttpTransportProvider {
    fn open(&self, url: &str, kind: TransportKind) -> PlatformResult<Box<dyn Transport>> {
        let client = match kind {
            TransportKind::Encrypted { verify_peer: false } => self.insecure.clone(),
            TransportKind::Plain | TransportKind::Encrypted { verify_peer: true } => {
                self.verified.clone()
            }
        };
        debug!("Opening {:?} transport to {}", kind, url);

        Ok(Box::new(HttpTransport {
            client,
            url: url.to_string(),
            response: None,
            pending: Bytes::new(),
        }))
    }
}

/// One request/response exchange over `reqwest`.
pub struct HttpTransport {
    client: reqwest::Client,
    url: String,
    response: Option<reqwest::Response>,
    pending: Bytes,
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(&mut self, request: Request) -> PlatformResult<Response> {
        let mut builder = match request.method {
            Method::Get => self.client.get(&self.url),
            Method::Post => self.client.post(&self.url),
        };
        if let Some(content_type) = request.content_type {
            builder = builder.header(CONTENT_TYPE, content_type);
        }
        if let Some(body) = request.body {
            builder = builder.body(body);
        }

        let response = builder.send().await?;
        let status = Response {
            status: response.status().as_u16(),
            content_length: response.content_length(),
        };
        self.response = Some(response);
        self.pending = Bytes::new();
        Ok(status)
    }

    fn is_open(&self) -> bool {
        self.response.is_some() || !self.pending.is_empty()
    }

    async fn read(&mut self, buf: &mut [u8]) -> PlatformResult<usize> {
        if self.pending.is_empty() {
            let Some(response) = self.response.as_mut() else {
                return Ok(0);
            };
            match response.chunk().await? {
                Some(chunk) => self.pending = chunk,
                None => {
                    self.response = None;
                    return Ok(0);
                }
            }
        }

        let n = buf.len().min(self.pending.len());
        let chunk = self.pending.split_to(n);
        buf[..n].copy_from_slice(&chunk);
        Ok(n)
    }

    async fn body(&mut self, limit: usize) -> PlatformResult<Bytes> {
        let mut response = self
            .response
            .take()
            .ok_or_else(|| PlatformError::new("no response to read"))?;

        let mut body = std::mem::take(&mut self.pending).to_vec();
        while body.len() <= limit {
            match response.chunk().await? {
                Some(chunk) => body.extend_from_slice(&chunk),
                None => break,
            }
        }
        Ok(Bytes::from(body))
    }

    fn close(&mut self) {
        self.response = None;
        self.pending = Bytes::new();
    }
}
