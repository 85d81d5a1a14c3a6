//! Actionability waiter: polls readiness predicates on a target node.
//!
//! An element is actionable when it still exists, its box model is
//! non-degenerate and stable across two polls, its center point is the
//! top-most hit at that position, its opacity is above zero, and it is
//! not inert. The executor gates every dispatch on this.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

use crate::error::Result;
use crate::geom::Rect;
use crate::transport::{NodeRef, PageClient, TargetId};

/// Actionability waiter configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionabilityConfig {
    /// Poll interval in milliseconds
    pub poll_interval_ms: u64,
    /// Overall deadline in milliseconds
    pub timeout_ms: u64,
}

impl Default for ActionabilityConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 100,
            timeout_ms: 30_000,
        }
    }
}

/// Outcome of an actionability wait.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Actionability {
    pub actionable: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl Actionability {
    fn ready() -> Self {
        Self {
            actionable: true,
            reason: None,
        }
    }

    fn blocked(reason: impl Into<String>) -> Self {
        Self {
            actionable: false,
            reason: Some(reason.into()),
        }
    }
}

/// Polls actionability predicates until all pass or the deadline hits.
pub struct ActionabilityWaiter {
    client: PageClient,
    config: ActionabilityConfig,
}

impl ActionabilityWaiter {
    pub fn new(client: PageClient, config: ActionabilityConfig) -> Self {
        Self { client, config }
    }

    /// Wait until the node is actionable, or report why it never was.
    pub async fn wait(&self, target: &TargetId, node: NodeRef) -> Result<Actionability> {
        let deadline = Instant::now() + Duration::from_millis(self.config.timeout_ms);
        let interval = Duration::from_millis(self.config.poll_interval_ms);
        let mut last_rect: Option<Rect> = None;
        let mut last_reason = String::from("never polled");

        loop {
            match self.check_once(target, node).await? {
                Ok(rect) => {
                    if last_rect == Some(rect) {
                        return Ok(Actionability::ready());
                    }
                    last_reason = "element still settling".into();
                    last_rect = Some(rect);
                }
                Err(reason) => {
                    last_reason = reason;
                    last_rect = None;
                }
            }
            if Instant::now() + interval > deadline {
                debug!(node = node.0, reason = %last_reason, "actionability timed out");
                return Ok(Actionability::blocked(last_reason));
            }
            tokio::time::sleep(interval).await;
        }
    }

    /// One predicate pass; `Ok(rect)` when everything but stability
    /// holds, `Err(reason)` naming the first failing predicate.
    async fn check_once(
        &self,
        target: &TargetId,
        node: NodeRef,
    ) -> Result<std::result::Result<Rect, String>> {
        let Some(description) = self.client.describe_node(target, node).await? else {
            return Ok(Err("element no longer exists".into()));
        };
        let Some(rect) = description.rect else {
            return Ok(Err("element has no box model".into()));
        };
        if rect.is_degenerate() {
            return Ok(Err("element box is degenerate".into()));
        }
        if description.opacity <= 0.0 {
            return Ok(Err("element is invisible (opacity 0)".into()));
        }
        if description.inert {
            return Ok(Err("element is inert".into()));
        }
        let center = rect.center();
        match self.client.node_at_point(target, center).await? {
            Some(top) if top.node == Some(node) => Ok(Ok(rect)),
            Some(_) => Ok(Err("element is occluded at its center".into())),
            None => Ok(Err("element center is not hit-testable".into())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::fake::{FakeNode, FakeTransport};
    use std::sync::Arc;

    fn waiter(transport: Arc<FakeTransport>, timeout_ms: u64) -> ActionabilityWaiter {
        ActionabilityWaiter::new(
            PageClient::new(transport),
            ActionabilityConfig {
                poll_interval_ms: 10,
                timeout_ms,
            },
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_visible_element_is_actionable() {
        let transport = Arc::new(FakeTransport::default());
        let id = transport
            .page()
            .add_button("ok", "OK", Rect::new(10.0, 10.0, 80.0, 30.0));
        let waiter = waiter(transport, 1_000);

        let outcome = waiter.wait(&TargetId::new("t1"), NodeRef(id)).await.unwrap();
        assert!(outcome.actionable);
        assert!(outcome.reason.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_element_times_out_with_reason() {
        let transport = Arc::new(FakeTransport::default());
        let waiter = waiter(transport, 100);

        let outcome = waiter.wait(&TargetId::new("t1"), NodeRef(999)).await.unwrap();
        assert!(!outcome.actionable);
        assert_eq!(outcome.reason.as_deref(), Some("element no longer exists"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_occluded_element_reports_occlusion() {
        let transport = Arc::new(FakeTransport::default());
        let below = transport
            .page()
            .add_button("target", "Buy", Rect::new(0.0, 0.0, 100.0, 40.0));
        // An overlay painted on top of the button's center.
        transport
            .page()
            .add_node(FakeNode::new("div").with_rect(Rect::new(0.0, 0.0, 200.0, 200.0)));
        let waiter = waiter(transport, 100);

        let outcome = waiter.wait(&TargetId::new("t1"), NodeRef(below)).await.unwrap();
        assert!(!outcome.actionable);
        assert_eq!(
            outcome.reason.as_deref(),
            Some("element is occluded at its center")
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_element_becoming_visible_is_waited_for() {
        let transport = Arc::new(FakeTransport::default());
        let id = transport.page().add_node(
            FakeNode::new("button")
                .with_id("late")
                .with_rect(Rect::new(10.0, 10.0, 50.0, 20.0))
                .with_hit_testable(false),
        );
        let waiter = waiter(transport.clone(), 5_000);
        let target = TargetId::new("t1");

        let page = transport.page();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            page.update_node(id, |n| n.hit_testable = true);
        });

        let outcome = waiter.wait(&target, NodeRef(id)).await.unwrap();
        handle.await.unwrap();
        assert!(outcome.actionable);
    }

    #[tokio::test(start_paused = true)]
    async fn test_degenerate_box_blocks() {
        let transport = Arc::new(FakeTransport::default());
        let id = transport
            .page()
            .add_node(FakeNode::new("button").with_rect(Rect::new(5.0, 5.0, 0.0, 0.0)));
        let waiter = waiter(transport, 100);

        let outcome = waiter.wait(&TargetId::new("t1"), NodeRef(id)).await.unwrap();
        assert!(!outcome.actionable);
        assert_eq!(outcome.reason.as_deref(), Some("element box is degenerate"));
    }
}
