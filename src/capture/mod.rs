//! Evidence capture layers.
//!
//! Four observers feed the recording orchestrator: DOM events (the
//! critical layer), mouse kinematics, visible-text OCR, and network
//! activity. Each layer isolates its own failures and degrades its
//! output instead of propagating errors to peers.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::transport::TargetId;

pub mod dom;
pub mod mouse;
pub mod network;
pub mod vision;

/// Transport event the page-side DOM interceptor emits.
pub const DOM_EVENT: &str = "page.domEvent";
/// Transport event for raw mouse activity.
pub const MOUSE_EVENT: &str = "page.mouse";
/// Transport event for request lifecycle notifications.
pub const NETWORK_EVENT: &str = "page.network";
/// Transport event for page load signals.
pub const LIFECYCLE_EVENT: &str = "page.lifecycle";

/// Health snapshot of one capture layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LayerStatus {
    pub name: String,
    pub enabled: bool,
    pub healthy: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub degraded_reason: Option<String>,
}

impl LayerStatus {
    pub fn healthy(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            enabled: true,
            healthy: true,
            degraded_reason: None,
        }
    }

    pub fn disabled(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            enabled: false,
            healthy: true,
            degraded_reason: None,
        }
    }

    pub fn degraded(name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            enabled: true,
            healthy: false,
            degraded_reason: Some(reason.into()),
        }
    }
}

/// Common lifecycle of a capture layer.
#[async_trait]
pub trait CaptureLayer: Send + Sync {
    fn name(&self) -> &'static str;

    /// Begin observing the target.
    async fn start(&self, target: &TargetId) -> Result<()>;

    /// Stop observing and release page-side hooks.
    async fn stop(&self, target: &TargetId) -> Result<()>;

    fn status(&self) -> LayerStatus;
}
