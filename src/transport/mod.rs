//! Command transport port and the typed page-command facade.
//!
//! The browser automation channel is an opaque request/response
//! transport: the engine sends named commands with structured
//! parameters and subscribes to out-of-band events. Responses are
//! serialized per target by the transport's own FIFO; replay-core
//! never assumes a wire format beyond JSON-shaped params and results.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::geom::{Point, Rect};

#[cfg(test)]
pub mod fake;

/// Identifier of an attached page target.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TargetId(String);

impl TargetId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for TargetId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// An out-of-band event delivered by the transport.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportEvent {
    /// Target the event originated from
    pub target: TargetId,
    /// Event name, e.g. `dom.event` or `network.requestFinished`
    pub event: String,
    /// Event payload
    pub params: Value,
}

/// Command transport port.
///
/// Implementations own command/response correlation and a per-target
/// FIFO so responses come back in send order. Commands are safe to
/// retry on transient failures.
#[async_trait]
pub trait CommandTransport: Send + Sync {
    /// Attach to a target before sending commands to it.
    async fn attach(&self, target: &TargetId) -> Result<()>;

    /// Detach from a target; outstanding subscriptions end.
    async fn detach(&self, target: &TargetId) -> Result<()>;

    /// Send a command and await its correlated response.
    async fn send(&self, target: &TargetId, method: &str, params: Value) -> Result<Value>;

    /// Subscribe to a named event on a target.
    ///
    /// Events are delivered on the returned channel in arrival order.
    async fn subscribe(
        &self,
        target: &TargetId,
        event: &str,
    ) -> Result<mpsc::Receiver<TransportEvent>>;
}

/// A resolved element handle the transport can act on.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeRef(pub i64);

/// Description of a live DOM node, as reported by the page.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeDescription {
    #[serde(rename = "backendNodeId")]
    pub node: Option<NodeRef>,
    #[serde(rename = "tagName", default)]
    pub tag_name: String,
    #[serde(default)]
    pub id: Option<String>,
    #[serde(rename = "classList", default)]
    pub class_list: Vec<String>,
    #[serde(default)]
    pub attributes: HashMap<String, String>,
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub rect: Option<Rect>,
    /// Effective opacity; 0 means invisible
    #[serde(default = "default_opacity")]
    pub opacity: f64,
    #[serde(default)]
    pub inert: bool,
}

fn default_opacity() -> f64 {
    1.0
}

/// Page-level metrics used for viewport fingerprints and scroll math.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PageMetrics {
    #[serde(default)]
    pub url: String,
    #[serde(rename = "scrollX", default)]
    pub scroll_x: f64,
    #[serde(rename = "scrollY", default)]
    pub scroll_y: f64,
    #[serde(rename = "viewportWidth", default)]
    pub viewport_width: f64,
    #[serde(rename = "viewportHeight", default)]
    pub viewport_height: f64,
}

/// Mouse button for input dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MouseButton {
    Left,
    Middle,
    Right,
}

/// Retry policy for commands that fail transiently.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportRetryConfig {
    /// Maximum retries for a single command
    pub max_retries: u32,
    /// Base delay between attempts
    pub base_delay_ms: u64,
}

impl Default for TransportRetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_delay_ms: 50,
        }
    }
}

/// Typed facade over the raw transport.
///
/// One method per command family the engine uses. Owns parameter and
/// result (de)serialization plus bounded retry on transport errors.
#[derive(Clone)]
pub struct PageClient {
    transport: Arc<dyn CommandTransport>,
    retry: TransportRetryConfig,
}

impl PageClient {
    pub fn new(transport: Arc<dyn CommandTransport>) -> Self {
        Self {
            transport,
            retry: TransportRetryConfig::default(),
        }
    }

    pub fn with_retry(mut self, retry: TransportRetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Access the underlying transport, e.g. for event subscription.
    pub fn transport(&self) -> &Arc<dyn CommandTransport> {
        &self.transport
    }

    async fn send(&self, target: &TargetId, method: &str, params: Value) -> Result<Value> {
        let mut attempt = 0;
        loop {
            match self.transport.send(target, method, params.clone()).await {
                Ok(result) => return Ok(result),
                Err(e @ Error::Transport { .. }) if attempt < self.retry.max_retries => {
                    attempt += 1;
                    warn!(method, attempt, "transport command failed, retrying: {e}");
                    tokio::time::sleep(std::time::Duration::from_millis(
                        self.retry.base_delay_ms * attempt as u64,
                    ))
                    .await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Query the DOM; returns every matching node.
    pub async fn query_selector_all(
        &self,
        target: &TargetId,
        selector: &str,
    ) -> Result<Vec<NodeRef>> {
        let result = self
            .send(target, "dom.query", json!({ "selector": selector }))
            .await?;
        let ids: Vec<i64> = serde_json::from_value(result["nodes"].clone())?;
        debug!(selector, matches = ids.len(), "dom query");
        Ok(ids.into_iter().map(NodeRef).collect())
    }

    /// Border-box rectangle of a node, in viewport coordinates.
    pub async fn box_model(&self, target: &TargetId, node: NodeRef) -> Result<Rect> {
        let result = self
            .send(target, "dom.boxModel", json!({ "backendNodeId": node.0 }))
            .await?;
        Ok(serde_json::from_value(result["rect"].clone())?)
    }

    /// Top-most node at a viewport point, if any.
    pub async fn node_at_point(
        &self,
        target: &TargetId,
        point: Point,
    ) -> Result<Option<NodeDescription>> {
        let result = self
            .send(
                target,
                "dom.nodeAtPoint",
                json!({ "x": point.x, "y": point.y }),
            )
            .await?;
        if result["node"].is_null() {
            return Ok(None);
        }
        Ok(Some(serde_json::from_value(result["node"].clone())?))
    }

    /// Full description of a node (tag, attributes, text, box, state).
    pub async fn describe_node(
        &self,
        target: &TargetId,
        node: NodeRef,
    ) -> Result<Option<NodeDescription>> {
        let result = self
            .send(target, "dom.describeNode", json!({ "backendNodeId": node.0 }))
            .await?;
        if result["node"].is_null() {
            return Ok(None);
        }
        Ok(Some(serde_json::from_value(result["node"].clone())?))
    }

    /// Fetch the full accessibility tree for the target.
    pub async fn accessibility_tree(&self, target: &TargetId) -> Result<Value> {
        self.send(target, "ax.tree", json!({})).await
    }

    /// Viewport screenshot as raw image bytes.
    pub async fn screenshot(&self, target: &TargetId) -> Result<Vec<u8>> {
        let result = self.send(target, "page.screenshot", json!({})).await?;
        let data = result["data"]
            .as_str()
            .ok_or_else(|| Error::transport("page.screenshot", "missing image data"))?;
        Ok(data.as_bytes().to_vec())
    }

    /// Current page metrics (url, scroll offsets, viewport size).
    pub async fn page_metrics(&self, target: &TargetId) -> Result<PageMetrics> {
        let result = self.send(target, "page.metrics", json!({})).await?;
        Ok(serde_json::from_value(result)?)
    }

    pub async fn mouse_move(&self, target: &TargetId, to: Point) -> Result<()> {
        self.send(target, "input.mouseMove", json!({ "x": to.x, "y": to.y }))
            .await?;
        Ok(())
    }

    pub async fn mouse_press(
        &self,
        target: &TargetId,
        at: Point,
        button: MouseButton,
        click_count: u32,
    ) -> Result<()> {
        self.send(
            target,
            "input.mousePress",
            json!({ "x": at.x, "y": at.y, "button": button, "clickCount": click_count }),
        )
        .await
        .map_err(|e| Error::DispatchFailed(e.to_string()))?;
        Ok(())
    }

    pub async fn mouse_release(
        &self,
        target: &TargetId,
        at: Point,
        button: MouseButton,
        click_count: u32,
    ) -> Result<()> {
        self.send(
            target,
            "input.mouseRelease",
            json!({ "x": at.x, "y": at.y, "button": button, "clickCount": click_count }),
        )
        .await
        .map_err(|e| Error::DispatchFailed(e.to_string()))?;
        Ok(())
    }

    pub async fn key_down(&self, target: &TargetId, key: &str, text: Option<&str>) -> Result<()> {
        self.send(target, "input.keyDown", json!({ "key": key, "text": text }))
            .await
            .map_err(|e| Error::DispatchFailed(e.to_string()))?;
        Ok(())
    }

    pub async fn key_up(&self, target: &TargetId, key: &str) -> Result<()> {
        self.send(target, "input.keyUp", json!({ "key": key }))
            .await
            .map_err(|e| Error::DispatchFailed(e.to_string()))?;
        Ok(())
    }

    pub async fn focus(&self, target: &TargetId, node: NodeRef) -> Result<()> {
        self.send(target, "dom.focus", json!({ "backendNodeId": node.0 }))
            .await?;
        Ok(())
    }

    pub async fn scroll_into_view(
        &self,
        target: &TargetId,
        node: NodeRef,
        margin: f64,
    ) -> Result<()> {
        self.send(
            target,
            "dom.scrollIntoView",
            json!({ "backendNodeId": node.0, "margin": margin }),
        )
        .await?;
        Ok(())
    }

    pub async fn scroll_by(&self, target: &TargetId, dx: f64, dy: f64) -> Result<()> {
        self.send(target, "input.wheel", json!({ "deltaX": dx, "deltaY": dy }))
            .await?;
        Ok(())
    }

    /// Evaluate a guarded script expression in the page.
    ///
    /// Used for the few operations with no dedicated command: select
    /// value assignment, instrumentation install/uninstall, read-backs.
    pub async fn eval(&self, target: &TargetId, expression: &str) -> Result<Value> {
        let result = self
            .send(target, "runtime.eval", json!({ "expression": expression }))
            .await?;
        Ok(result["result"].clone())
    }
}
