//! Shared test utilities for the drawbatch test suite.
//!
//! Provides a scripted [`MockClient`] that stands in for the generation
//! server, plus small in-memory image fixtures.
//!
//! # Usage
//!
//! ```rust
//! use crate::test_helpers::*;
//!
//! let client = MockClient::new(vec![MockReply::Images(2), MockReply::TransportError]);
//! // ... run a driver against &client ...
//! assert_eq!(client.requests().len(), 2);
//! ```

use crate::client::{ClientError, GenerationClient, GenerationResult};
use crate::request::Params;
use image::{ImageFormat, RgbImage};
use std::collections::VecDeque;
use std::io::Cursor;
use std::sync::Mutex;
use std::time::Duration;

// =========================================================================
// Image fixtures
// =========================================================================

fn encoded(format: ImageFormat) -> Vec<u8> {
    let img = RgbImage::from_fn(8, 6, |x, y| image::Rgb([(x * 30) as u8, (y * 40) as u8, 128]));
    let mut buf = Cursor::new(Vec::new());
    img.write_to(&mut buf, format).unwrap();
    buf.into_inner()
}

/// A small valid PNG.
pub fn png_bytes() -> Vec<u8> {
    encoded(ImageFormat::Png)
}

/// A small valid JPEG.
pub fn jpeg_bytes() -> Vec<u8> {
    encoded(ImageFormat::Jpeg)
}

// =========================================================================
// Mock generation client
// =========================================================================

/// One scripted response.
#[derive(Debug, Clone)]
pub enum MockReply {
    /// Success with this many valid PNGs.
    Images(usize),
    /// Success with these exact payloads.
    Raw(Vec<Vec<u8>>),
    /// The server answered 503.
    TransportError,
}

/// Replies from a script in call order and records every request.
///
/// Running past the end of the script yields a failure, so an unexpected
/// extra call shows up as a failed item rather than a silent success.
pub struct MockClient {
    replies: Mutex<VecDeque<MockReply>>,
    requests: Mutex<Vec<Params>>,
}

impl MockClient {
    pub fn new(replies: Vec<MockReply>) -> Self {
        Self {
            replies: Mutex::new(replies.into()),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Every request received so far, in order.
    pub fn requests(&self) -> Vec<Params> {
        self.requests.lock().unwrap().clone()
    }
}

impl GenerationClient for MockClient {
    fn generate(&self, request: &Params) -> GenerationResult {
        self.requests.lock().unwrap().push(request.clone());
        let elapsed = Duration::from_millis(250);
        match self.replies.lock().unwrap().pop_front() {
            Some(MockReply::Images(n)) => {
                GenerationResult::success((0..n).map(|_| png_bytes()).collect(), elapsed)
            }
            Some(MockReply::Raw(images)) => GenerationResult::success(images, elapsed),
            Some(MockReply::TransportError) => GenerationResult::failure(
                ClientError::Status {
                    status: reqwest::StatusCode::SERVICE_UNAVAILABLE,
                    body: "mock server unavailable".into(),
                },
                elapsed,
            ),
            None => GenerationResult::failure(
                ClientError::MalformedResponse("no scripted reply left".into()),
                elapsed,
            ),
        }
    }
}
