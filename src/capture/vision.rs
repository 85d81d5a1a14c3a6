//! Vision capture layer: screenshot plus OCR with fingerprint caching.
//!
//! A capture screenshots the viewport through the transport and runs
//! the OCR port over it. Results are cached by a fingerprint of the
//! screenshot content with a short TTL so successive actions reuse one
//! OCR pass. Jobs are serialized: a capture that arrives while another
//! is in flight awaits it and usually lands on the fresh cache entry.

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, warn};

use super::{CaptureLayer, LayerStatus};
use crate::error::{Error, Result};
use crate::evidence::VisionEvidence;
use crate::ocr::{OcrPort, OcrResult, SerializedOcr};
use crate::transport::{PageClient, TargetId};

/// Vision layer configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VisionConfig {
    /// OCR results below this confidence (0-100) are discarded
    pub ocr_confidence_min: f64,
    /// Deadline for one OCR pass
    pub ocr_timeout_ms: u64,
    /// Cache TTL for a viewport fingerprint
    pub cache_ttl_ms: u64,
}

impl Default for VisionConfig {
    fn default() -> Self {
        Self {
            ocr_confidence_min: 60.0,
            ocr_timeout_ms: 5_000,
            cache_ttl_ms: 2_000,
        }
    }
}

struct CacheEntry {
    fingerprint: String,
    results: Vec<OcrResult>,
    stored_at: Instant,
}

/// Screenshot + OCR with a fingerprint-keyed cache.
pub struct VisionCaptureLayer {
    client: PageClient,
    ocr: SerializedOcr,
    config: VisionConfig,
    cache: Mutex<Option<CacheEntry>>,
    /// Serializes whole captures so a pending job is awaited, never
    /// duplicated
    inflight: Mutex<()>,
    degraded: std::sync::Mutex<Option<String>>,
}

impl VisionCaptureLayer {
    pub fn new(client: PageClient, ocr: Arc<dyn OcrPort>, config: VisionConfig) -> Self {
        Self {
            client,
            ocr: SerializedOcr::new(ocr),
            config,
            cache: Mutex::new(None),
            inflight: Mutex::new(()),
            degraded: std::sync::Mutex::new(None),
        }
    }

    /// Capture the viewport's visible text.
    pub async fn capture(&self, target: &TargetId) -> Result<VisionEvidence> {
        let _job = self.inflight.lock().await;

        let image = self.client.screenshot(target).await?;
        let fingerprint = fingerprint_of(&image);

        {
            let cache = self.cache.lock().await;
            if let Some(entry) = cache.as_ref() {
                let ttl = Duration::from_millis(self.config.cache_ttl_ms);
                if entry.fingerprint == fingerprint && entry.stored_at.elapsed() < ttl {
                    debug!(fingerprint = %&fingerprint[..12], "vision cache hit");
                    return Ok(VisionEvidence {
                        results: entry.results.clone(),
                        captured_at: Utc::now(),
                        fingerprint,
                    });
                }
            }
        }

        let ocr_deadline = Duration::from_millis(self.config.ocr_timeout_ms);
        let recognized = tokio::time::timeout(ocr_deadline, self.ocr.recognize(&image))
            .await
            .map_err(|_| Error::timeout(self.config.ocr_timeout_ms))?;
        let results = match recognized {
            Ok(results) => {
                *self.degraded.lock().unwrap() = None;
                results
                    .into_iter()
                    .filter(|r| r.confidence >= self.config.ocr_confidence_min)
                    .collect::<Vec<_>>()
            }
            Err(e) => {
                warn!("OCR pass failed: {e}");
                *self.degraded.lock().unwrap() = Some(e.to_string());
                return Err(e);
            }
        };

        debug!(results = results.len(), "vision capture complete");
        *self.cache.lock().await = Some(CacheEntry {
            fingerprint: fingerprint.clone(),
            results: results.clone(),
            stored_at: Instant::now(),
        });
        Ok(VisionEvidence {
            results,
            captured_at: Utc::now(),
            fingerprint,
        })
    }
}

/// Content fingerprint of a screenshot.
pub fn fingerprint_of(image: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(image);
    format!("{:x}", hasher.finalize())
}

#[async_trait]
impl CaptureLayer for VisionCaptureLayer {
    fn name(&self) -> &'static str {
        "vision"
    }

    async fn start(&self, target: &TargetId) -> Result<()> {
        // Probe the screenshot path so a broken transport surfaces as
        // an init failure instead of degrading every capture.
        self.client
            .screenshot(target)
            .await
            .map_err(|e| Error::init_failed(self.name(), e.to_string()))?;
        debug!("vision capture layer started");
        Ok(())
    }

    async fn stop(&self, _target: &TargetId) -> Result<()> {
        *self.cache.lock().await = None;
        Ok(())
    }

    fn status(&self) -> LayerStatus {
        match self.degraded.lock().unwrap().clone() {
            Some(reason) => LayerStatus::degraded(self.name(), reason),
            None => LayerStatus::healthy(self.name()),
        }
    }
}
