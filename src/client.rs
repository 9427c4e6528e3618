//! Generation server client.
//!
//! The [`GenerationClient`] trait is the seam between the batch driver and
//! the network: one synchronous call per work item, returning a
//! [`GenerationResult`] that carries either decoded images or an error.
//! Failures are values, not `Err`s, because every failure here is
//! recoverable for the batch as a whole.
//!
//! The production implementation is [`HttpClient`], which speaks the
//! Automatic1111-style API exposed by Draw Things and similar servers:
//!
//! ```text
//! POST /sdapi/v1/txt2img   { "prompt": "...", "steps": 20, ... }
//! 200  { "images": ["iVBORw0KGgo...", ...], "parameters": {...}, "info": "..." }
//! ```
//!
//! Image payloads are base64, optionally wrapped in a data URI
//! (`data:image/png;base64,...`).

use crate::request::Params;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use reqwest::blocking::Client;
use serde::Deserialize;
use std::time::{Duration, Instant};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ClientError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("server returned {status}: {body}")]
    Status {
        status: reqwest::StatusCode,
        body: String,
    },
    #[error("malformed response: {0}")]
    MalformedResponse(String),
    #[error("image {index} is not valid base64: {source}")]
    Payload {
        index: usize,
        source: base64::DecodeError,
    },
    #[error("image {0} is empty")]
    EmptyPayload(usize),
}

/// Outcome of one generation call.
#[derive(Debug)]
pub struct GenerationResult {
    /// Raw image bytes in response order. Empty on failure.
    pub images: Vec<Vec<u8>>,
    /// Wall time of the call, including decoding.
    pub elapsed: Duration,
    pub error: Option<ClientError>,
}

impl GenerationResult {
    pub fn success(images: Vec<Vec<u8>>, elapsed: Duration) -> Self {
        Self {
            images,
            elapsed,
            error: None,
        }
    }

    pub fn failure(error: ClientError, elapsed: Duration) -> Self {
        Self {
            images: Vec::new(),
            elapsed,
            error: Some(error),
        }
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

/// Anything that can turn a request payload into images.
pub trait GenerationClient {
    fn generate(&self, request: &Params) -> GenerationResult;
}

impl<T: GenerationClient + ?Sized> GenerationClient for &T {
    fn generate(&self, request: &Params) -> GenerationResult {
        (**self).generate(request)
    }
}

#[derive(Deserialize)]
struct GenerationResponse {
    #[serde(default)]
    images: Vec<String>,
}

/// Blocking HTTP client bound to one generation endpoint.
#[derive(Clone)]
pub struct HttpClient {
    client: Client,
    url: String,
}

impl HttpClient {
    /// Builds a client posting to `base_url` + `endpoint`.
    pub fn new(base_url: &str, endpoint: &str, timeout: Duration) -> Result<Self, ClientError> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            url: endpoint_url(base_url, endpoint),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    fn post(&self, request: &Params) -> Result<Vec<Vec<u8>>, ClientError> {
        let resp = self.client.post(&self.url).json(request).send()?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp
                .text()
                .unwrap_or_else(|_| "<body unavailable>".to_string());
            return Err(ClientError::Status { status, body });
        }

        let text = resp.text()?;
        let parsed: GenerationResponse = serde_json::from_str(&text)
            .map_err(|e| ClientError::MalformedResponse(e.to_string()))?;

        parsed
            .images
            .iter()
            .enumerate()
            .map(|(index, payload)| decode_image_payload(index, payload))
            .collect()
    }
}

impl GenerationClient for HttpClient {
    fn generate(&self, request: &Params) -> GenerationResult {
        let start = Instant::now();
        match self.post(request) {
            Ok(images) => {
                tracing::debug!(url = %self.url, images = images.len(), "generation succeeded");
                GenerationResult::success(images, start.elapsed())
            }
            Err(e) => {
                tracing::debug!(url = %self.url, error = %e, "generation failed");
                GenerationResult::failure(e, start.elapsed())
            }
        }
    }
}

/// Join a base URL and an endpoint path with exactly one slash.
pub fn endpoint_url(base_url: &str, endpoint: &str) -> String {
    format!(
        "{}/{}",
        base_url.trim().trim_end_matches('/'),
        endpoint.trim().trim_start_matches('/')
    )
}

/// Decode one image payload from a response.
///
/// Strips an optional `data:<mime>;base64,` prefix and any embedded
/// whitespace before decoding. `index` is only used for error messages.
pub fn decode_image_payload(index: usize, payload: &str) -> Result<Vec<u8>, ClientError> {
    let trimmed = payload.trim();
    let b64_data = match trimmed.strip_prefix("data:") {
        Some(rest) => rest
            .split_once(',')
            .map(|(_, data)| data)
            .ok_or_else(|| {
                ClientError::MalformedResponse(format!("image {index} has a malformed data URI"))
            })?,
        None => trimmed,
    };

    let normalized: String = b64_data.chars().filter(|c| !c.is_whitespace()).collect();
    let decoded = STANDARD
        .decode(normalized.as_bytes())
        .map_err(|source| ClientError::Payload { index, source })?;
    if decoded.is_empty() {
        return Err(ClientError::EmptyPayload(index));
    }
    Ok(decoded)
}
