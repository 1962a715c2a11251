//! Version-check exchange with the update endpoint.
//!
//! The endpoint answers with a JSON object:
//!
//! ```json
//! { "version": "1.2.0", "firmware_url": "https://cdn.example.com/fw-1.2.0.bin" }
//! ```
//!
//! Additional fields are ignored.

use crate::config::MetadataRequest;
use crate::error::{Error, PlatformError, RequestFailure, Result};
use crate::platform::Request;
use crate::upgrade::transport::ConnectionSelector;
use serde_json::Value;
use tracing::{debug, warn};

/// HTTP status the endpoint must answer with.
const HTTP_OK: u16 = 200;

/// Default cap on a version-check response body, in bytes.
pub const DEFAULT_BODY_LIMIT: usize = 1024;

/// Candidate firmware advertised by the endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Metadata {
    /// Advertised version string.
    pub version: String,
    /// Where to download the image.
    pub firmware_url: String,
}

/// Performs version checks against the update endpoint.
pub struct MetadataFetcher<'a> {
    selector: &'a ConnectionSelector,
    request: MetadataRequest,
    body_limit: usize,
}

impl<'a> MetadataFetcher<'a> {
    /// Fetcher opening channels through `selector`, sending `request`-shaped checks.
    #[must_use]
    pub fn new(selector: &'a ConnectionSelector, request: MetadataRequest) -> Self {
        Self {
            selector,
            request,
            body_limit: DEFAULT_BODY_LIMIT,
        }
    }

    /// Reject response bodies longer than `limit` bytes.
    #[must_use]
    pub fn with_body_limit(mut self, limit: usize) -> Self {
        self.body_limit = limit;
        self
    }

    /// Ask `endpoint` which firmware `device_id` should run.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidProtocol`] for an unsupported endpoint scheme
    /// - [`Error::FetchFailed`] for transport failures or a non-200 status
    /// - [`Error::ParseFailed`] if the body is not a JSON object or exceeds the body limit
    /// - [`Error::MalformedMetadata`] if `version` or `firmware_url` is missing
    pub async fn fetch(&self, endpoint: &str, device_id: &str) -> Result<Metadata> {
        let mut channel = self.selector.select(endpoint)?.map_err(transport_failure)?;

        debug!("Checking {} for firmware updates ({:?})", endpoint, self.request);
        let response = channel
            .send(self.build_request(device_id))
            .await
            .map_err(transport_failure)?;

        if response.status != HTTP_OK {
            warn!("Version check returned HTTP {}", response.status);
            return Err(Error::FetchFailed(RequestFailure::Status(response.status)));
        }

        let limit = self.body_limit;
        if response
            .content_length
            .is_some_and(|len| len > limit as u64)
        {
            warn!("Version check body of {:?} bytes over limit", response.content_length);
            return Err(too_large(limit));
        }

        let body = channel.body(limit).await.map_err(transport_failure)?;
        drop(channel);
        if body.len() > limit {
            warn!("Version check body over {} bytes", limit);
            return Err(too_large(limit));
        }

        let metadata = parse_metadata(&body)?;
        debug!(
            "Endpoint offers {} at {}",
            metadata.version, metadata.firmware_url
        );
        Ok(metadata)
    }

    fn build_request(&self, device_id: &str) -> Request {
        match self.request {
            MetadataRequest::DeviceId => {
                Request::post_json(serde_json::json!({ "id": device_id }).to_string())
            }
            MetadataRequest::Bare => Request::get(),
        }
    }
}

fn transport_failure(e: PlatformError) -> Error {
    Error::FetchFailed(RequestFailure::Transport(e))
}

fn too_large(limit: usize) -> Error {
    Error::ParseFailed(format!("response body exceeds {limit} bytes"))
}

/// Parse a version-check response body.
///
/// # Errors
///
/// Returns [`Error::ParseFailed`] if `body` is not a JSON object, and
/// [`Error::MalformedMetadata`] if a required field is missing, empty or
/// not a string.
pub fn parse_metadata(body: &[u8]) -> Result<Metadata> {
    let value: Value =
        serde_json::from_slice(body).map_err(|e| Error::ParseFailed(e.to_string()))?;
    let object = value
        .as_object()
        .ok_or_else(|| Error::ParseFailed("expected a JSON object".to_string()))?;

    let field = |name: &'static str| {
        object
            .get(name)
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .ok_or(Error::MalformedMetadata(name))
    };

    Ok(Metadata {
        version: field("version")?,
        firmware_url: field("firmware_url")?,
    })
}
