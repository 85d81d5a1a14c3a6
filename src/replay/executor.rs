//! Action executor: kinematic input dispatch with actionability gating.
//!
//! Before every dispatch the executor awaits actionability, refreshes
//! the click point from the live box model (the element may have moved
//! since evaluation), and scrolls the element into view when it sits
//! outside the viewport margin. Mouse movement is stepped from the
//! tracked cursor position; typing is per-character. Passwords type
//! normally here: redaction happens only at capture.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::actionability::{ActionabilityConfig, ActionabilityWaiter};
use crate::error::{Error, Result};
use crate::evidence::EventType;
use crate::geom::Point;
use crate::transport::{MouseButton, NodeRef, PageClient, TargetId};

/// Executor configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorConfig {
    /// Pause between the clicks of a double click
    pub click_delay_ms: u64,
    /// Delay between typed characters
    pub type_delay_ms: u64,
    /// Steps of the smoothed mouse move
    pub mouse_move_steps: u32,
    /// Pause between move steps
    pub mouse_step_interval_ms: u64,
    /// Viewport margin that triggers scroll-into-view
    pub scroll_margin: f64,
    pub focus_before_type: bool,
    pub clear_before_type: bool,
    pub verify_after_action: bool,
    /// Deadline for one action, dispatch plus verification
    pub action_timeout_ms: u64,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            click_delay_ms: 60,
            type_delay_ms: 20,
            mouse_move_steps: 10,
            mouse_step_interval_ms: 10,
            scroll_margin: 100.0,
            focus_before_type: true,
            clear_before_type: false,
            verify_after_action: true,
            action_timeout_ms: 30_000,
        }
    }
}

/// One action to dispatch.
#[derive(Debug, Clone)]
pub struct ActionRequest {
    pub event_type: EventType,
    pub node: Option<NodeRef>,
    pub click_point: Point,
    pub value: Option<String>,
    pub click_count: u32,
}

impl ActionRequest {
    pub fn click(node: Option<NodeRef>, click_point: Point) -> Self {
        Self {
            event_type: EventType::Click,
            node,
            click_point,
            value: None,
            click_count: 1,
        }
    }
}

/// Result of one dispatched action.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionResult {
    pub success: bool,
    pub duration_ms: u64,
    /// Post-action verification outcome, when enabled
    #[serde(skip_serializing_if = "Option::is_none")]
    pub verified: Option<bool>,
}

/// Dispatches input through the transport.
pub struct ActionExecutor {
    client: PageClient,
    waiter: ActionabilityWaiter,
    config: ExecutorConfig,
    /// Tracked cursor position per target
    cursors: Mutex<HashMap<TargetId, Point>>,
}

impl ActionExecutor {
    pub fn new(
        client: PageClient,
        actionability: ActionabilityConfig,
        config: ExecutorConfig,
    ) -> Self {
        let waiter = ActionabilityWaiter::new(client.clone(), actionability);
        Self {
            client,
            waiter,
            config,
            cursors: Mutex::new(HashMap::new()),
        }
    }

    /// Dispatch one action, bounded by the action timeout.
    pub async fn execute(&self, target: &TargetId, request: &ActionRequest) -> Result<ActionResult> {
        let deadline = Duration::from_millis(self.config.action_timeout_ms);
        match tokio::time::timeout(deadline, self.execute_inner(target, request)).await {
            Ok(result) => result,
            Err(_) => Err(Error::timeout(self.config.action_timeout_ms)),
        }
    }

    async fn execute_inner(
        &self,
        target: &TargetId,
        request: &ActionRequest,
    ) -> Result<ActionResult> {
        let started = Instant::now();
        let point = self.prepare(target, request).await?;

        match request.event_type {
            EventType::Click | EventType::Submit => {
                self.click_at(target, point, request.click_count).await?;
            }
            EventType::Type => {
                self.type_value(target, request, point).await?;
            }
            EventType::Select => {
                self.select_value(target, request).await?;
            }
            EventType::Scroll => {
                self.client.scroll_by(target, 0.0, point.y).await?;
            }
            EventType::Navigate => {
                return Err(Error::DispatchFailed(
                    "navigation is driven by the session, not the executor".into(),
                ));
            }
        }

        let verified = if self.config.verify_after_action {
            Some(self.verify(target, request).await)
        } else {
            None
        };

        Ok(ActionResult {
            success: true,
            duration_ms: started.elapsed().as_millis() as u64,
            verified,
        })
    }

    /// Gate on actionability, refresh the click point from the live
    /// box model, and scroll into view when needed.
    async fn prepare(&self, target: &TargetId, request: &ActionRequest) -> Result<Point> {
        let Some(node) = request.node else {
            // Point-only dispatch (coordinates and OCR strategies).
            return Ok(request.click_point);
        };

        let outcome = self.waiter.wait(target, node).await?;
        if !outcome.actionable {
            return Err(Error::not_actionable(
                outcome.reason.unwrap_or_else(|| "unknown".into()),
            ));
        }

        let rect = self.client.box_model(target, node).await?;
        let metrics = self.client.page_metrics(target).await?;
        let margin = self.config.scroll_margin;
        let inside = rect.y >= margin
            && rect.y + rect.height <= metrics.viewport_height - margin
            && rect.x >= 0.0
            && rect.x + rect.width <= metrics.viewport_width;
        if !inside {
            debug!(node = node.0, "scrolling element into view");
            self.client.scroll_into_view(target, node, margin).await?;
            return Ok(self.client.box_model(target, node).await?.center());
        }
        Ok(rect.center())
    }

    /// Smooth stepped move from the tracked cursor, then press/release.
    async fn click_at(&self, target: &TargetId, point: Point, click_count: u32) -> Result<()> {
        self.move_cursor(target, point).await?;
        self.client
            .mouse_press(target, point, MouseButton::Left, 1)
            .await?;
        self.client
            .mouse_release(target, point, MouseButton::Left, 1)
            .await?;
        if click_count >= 2 {
            tokio::time::sleep(Duration::from_millis(self.config.click_delay_ms)).await;
            self.client
                .mouse_press(target, point, MouseButton::Left, 2)
                .await?;
            self.client
                .mouse_release(target, point, MouseButton::Left, 2)
                .await?;
        }
        Ok(())
    }

    async fn move_cursor(&self, target: &TargetId, to: Point) -> Result<()> {
        let from = self
            .cursors
            .lock()
            .unwrap()
            .get(target)
            .copied()
            .unwrap_or_default();
        let steps = self.config.mouse_move_steps.max(1);
        for step in 1..=steps {
            let fraction = step as f64 / steps as f64;
            let at = Point::new(
                from.x + (to.x - from.x) * fraction,
                from.y + (to.y - from.y) * fraction,
            );
            self.client.mouse_move(target, at).await?;
            if step < steps {
                tokio::time::sleep(Duration::from_millis(self.config.mouse_step_interval_ms)).await;
            }
        }
        self.cursors.lock().unwrap().insert(target.clone(), to);
        Ok(())
    }

    async fn type_value(
        &self,
        target: &TargetId,
        request: &ActionRequest,
        point: Point,
    ) -> Result<()> {
        if self.config.focus_before_type {
            match request.node {
                Some(node) => self.client.focus(target, node).await?,
                None => self.click_at(target, point, 1).await?,
            }
        }
        if self.config.clear_before_type {
            self.client.key_down(target, "Control+A", None).await?;
            self.client.key_up(target, "Control+A").await?;
            self.client.key_down(target, "Backspace", None).await?;
            self.client.key_up(target, "Backspace").await?;
        }
        let Some(value) = request.value.as_deref() else {
            return Ok(());
        };
        for ch in value.chars() {
            let key = ch.to_string();
            self.client.key_down(target, &key, Some(&key)).await?;
            self.client.key_up(target, &key).await?;
            tokio::time::sleep(Duration::from_millis(self.config.type_delay_ms)).await;
        }
        Ok(())
    }

    /// Set a select's value through a guarded script evaluation; the
    /// page-side helper dispatches the change event.
    async fn select_value(&self, target: &TargetId, request: &ActionRequest) -> Result<()> {
        let Some(node) = request.node else {
            return Err(Error::DispatchFailed(
                "select needs a resolved element".into(),
            ));
        };
        let value = request.value.as_deref().unwrap_or_default();
        self.client.focus(target, node).await?;
        self.client
            .eval(
                target,
                &format!("__replay.setValue({}, {:?})", node.0, value),
            )
            .await?;
        Ok(())
    }

    /// Best-effort post-action verification.
    async fn verify(&self, target: &TargetId, request: &ActionRequest) -> bool {
        let Some(node) = request.node else {
            return true;
        };
        let exists = matches!(self.client.describe_node(target, node).await, Ok(Some(_)));
        if !exists {
            warn!(node = node.0, "element vanished after action");
            return false;
        }
        match request.event_type {
            EventType::Type if request.value.is_some() => {
                let read_back = self
                    .client
                    .eval(target, &format!("__replay.getValue({})", node.0))
                    .await;
                matches!(
                    read_back,
                    Ok(value) if value.as_str().is_some_and(|v| !v.is_empty())
                )
            }
            // A toggle click records the target checked state.
            EventType::Click if request.value.is_some() => {
                let expected = request.value.as_deref().unwrap_or_default();
                let read_back = self
                    .client
                    .eval(target, &format!("__replay.getValue({})", node.0))
                    .await;
                matches!(
                    read_back,
                    Ok(value) if value.as_str() == Some(expected)
                )
            }
            _ => true,
        }
    }

    /// Move the cursor over the element without pressing.
    pub async fn hover(&self, target: &TargetId, point: Point) -> Result<()> {
        self.move_cursor(target, point).await
    }

    /// Focus an element directly.
    pub async fn focus(&self, target: &TargetId, node: NodeRef) -> Result<()> {
        self.client.focus(target, node).await
    }

    /// Dispatch a bare key press.
    pub async fn press_key(&self, target: &TargetId, key: &str) -> Result<()> {
        self.client.key_down(target, key, None).await?;
        self.client.key_up(target, key).await
    }
}
