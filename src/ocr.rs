//! OCR port: text extraction from screenshots.
//!
//! The OCR engine itself is out of scope; this module defines the port
//! contract and a guard that bounds concurrency to one job per port
//! instance, since OCR backends are typically single-threaded and
//! expensive.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::Semaphore;

use crate::error::Result;
use crate::geom::Rect;

/// A single recognized text fragment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OcrResult {
    /// Recognized text
    pub text: String,
    /// Recognition confidence, 0-100
    pub confidence: f64,
    /// Bounding box in image pixels
    pub bbox: Rect,
}

/// OCR port contract: extract text and bounding boxes from an image.
#[async_trait]
pub trait OcrPort: Send + Sync {
    /// Recognize text fragments in the given image bytes.
    async fn recognize(&self, image: &[u8]) -> Result<Vec<OcrResult>>;
}

/// Wraps an OCR port with a one-job-at-a-time bound.
///
/// Callers share one guard per port instance; a second job awaits the
/// first instead of running concurrently.
pub struct SerializedOcr {
    inner: Arc<dyn OcrPort>,
    permit: Semaphore,
}

impl SerializedOcr {
    pub fn new(inner: Arc<dyn OcrPort>) -> Self {
        Self {
            inner,
            permit: Semaphore::new(1),
        }
    }

    pub async fn recognize(&self, image: &[u8]) -> Result<Vec<OcrResult>> {
        let _guard = self
            .permit
            .acquire()
            .await
            .map_err(|_| crate::error::Error::Internal("OCR guard closed".into()))?;
        self.inner.recognize(image).await
    }
}

/// OCR backend for tests: reads the word list the fake transport
/// embeds in its screenshot bytes.
#[cfg(test)]
pub struct FakeOcr;

#[cfg(test)]
#[async_trait]
impl OcrPort for FakeOcr {
    async fn recognize(&self, image: &[u8]) -> Result<Vec<OcrResult>> {
        let text = std::str::from_utf8(image)
            .map_err(|e| crate::error::Error::Internal(format!("bad fake image: {e}")))?;
        Ok(serde_json::from_str(text)?)
    }
}
