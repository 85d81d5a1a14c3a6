//! Scripted in-memory transport for tests.
//!
//! Simulates a page just deeply enough to exercise the capture layers,
//! evaluators, and executor end-to-end: a flat node list with selector
//! matching, an accessibility projection, screenshot "pixels" that the
//! fake OCR port can read back, and a log of every dispatched command.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

use super::{CommandTransport, TargetId, TransportEvent};
use crate::error::{Error, Result};
use crate::geom::{Point, Rect};

/// A node in the fake page.
#[derive(Debug, Clone)]
pub struct FakeNode {
    pub backend_id: i64,
    pub tag: String,
    pub id: Option<String>,
    pub classes: Vec<String>,
    pub attributes: HashMap<String, String>,
    pub text: String,
    pub role: Option<String>,
    pub name: Option<String>,
    pub rect: Rect,
    pub hidden: bool,
    pub hit_testable: bool,
    pub opacity: f64,
    pub inert: bool,
    pub value: String,
}

impl FakeNode {
    pub fn new(tag: impl Into<String>) -> Self {
        Self {
            backend_id: 0,
            tag: tag.into(),
            id: None,
            classes: Vec::new(),
            attributes: HashMap::new(),
            text: String::new(),
            role: None,
            name: None,
            rect: Rect::new(0.0, 0.0, 100.0, 30.0),
            hidden: false,
            hit_testable: true,
            opacity: 1.0,
            inert: false,
            value: String::new(),
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_class(mut self, class: impl Into<String>) -> Self {
        self.classes.push(class.into());
        self
    }

    pub fn with_attr(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.text = text.into();
        self
    }

    pub fn with_role(mut self, role: impl Into<String>, name: impl Into<String>) -> Self {
        self.role = Some(role.into());
        self.name = Some(name.into());
        self
    }

    pub fn with_rect(mut self, rect: Rect) -> Self {
        self.rect = rect;
        self
    }

    pub fn with_hidden(mut self, hidden: bool) -> Self {
        self.hidden = hidden;
        self
    }

    pub fn with_hit_testable(mut self, hit: bool) -> Self {
        self.hit_testable = hit;
        self
    }

    fn describe(&self) -> Value {
        json!({
            "backendNodeId": self.backend_id,
            "tagName": self.tag,
            "id": self.id,
            "classList": self.classes,
            "attributes": self.attributes,
            "text": self.text,
            "rect": self.rect,
            "opacity": self.opacity,
            "inert": self.inert,
        })
    }
}

#[derive(Default)]
struct PageState {
    nodes: Vec<FakeNode>,
    next_id: i64,
    url: String,
    scroll: (f64, f64),
    viewport: (f64, f64),
    /// Words a screenshot of the current viewport would show
    ocr_words: Vec<(String, Rect, f64)>,
    focused: Option<i64>,
    select_all_pending: bool,
}

/// Shared, mutable fake page state.
#[derive(Clone, Default)]
pub struct FakePage {
    state: Arc<Mutex<PageState>>,
}

impl FakePage {
    pub fn add_node(&self, mut node: FakeNode) -> i64 {
        let mut state = self.state.lock().unwrap();
        state.next_id += 1;
        node.backend_id = state.next_id;
        let id = node.backend_id;
        state.nodes.push(node);
        id
    }

    /// Shorthand: a visible button with an id, text, and button role.
    pub fn add_button(&self, id: &str, text: &str, rect: Rect) -> i64 {
        self.add_node(
            FakeNode::new("button")
                .with_id(id)
                .with_text(text)
                .with_role("button", text)
                .with_rect(rect),
        )
    }

    pub fn remove_node(&self, backend_id: i64) {
        self.state
            .lock()
            .unwrap()
            .nodes
            .retain(|n| n.backend_id != backend_id);
    }

    pub fn update_node(&self, backend_id: i64, f: impl FnOnce(&mut FakeNode)) {
        let mut state = self.state.lock().unwrap();
        if let Some(node) = state.nodes.iter_mut().find(|n| n.backend_id == backend_id) {
            f(node);
        }
    }

    pub fn set_url(&self, url: &str) {
        self.state.lock().unwrap().url = url.to_string();
    }

    pub fn set_ocr_words(&self, words: Vec<(&str, Rect, f64)>) {
        self.state.lock().unwrap().ocr_words = words
            .into_iter()
            .map(|(t, r, c)| (t.to_string(), r, c))
            .collect();
    }

    pub fn node_value(&self, backend_id: i64) -> Option<String> {
        self.state
            .lock()
            .unwrap()
            .nodes
            .iter()
            .find(|n| n.backend_id == backend_id)
            .map(|n| n.value.clone())
    }

    fn find(&self, backend_id: i64) -> Option<FakeNode> {
        self.state
            .lock()
            .unwrap()
            .nodes
            .iter()
            .find(|n| n.backend_id == backend_id)
            .cloned()
    }

    fn matching(&self, selector: &str) -> Vec<FakeNode> {
        let segment = selector.split(" > ").last().unwrap_or(selector);
        let segment = strip_nth_child(segment);
        self.state
            .lock()
            .unwrap()
            .nodes
            .iter()
            .filter(|n| segment_matches(n, &segment))
            .cloned()
            .collect()
    }

    fn node_at(&self, p: Point) -> Option<FakeNode> {
        // Later nodes paint on top.
        self.state
            .lock()
            .unwrap()
            .nodes
            .iter()
            .rev()
            .find(|n| !n.hidden && n.hit_testable && n.rect.contains(&p))
            .cloned()
    }
}

fn strip_nth_child(segment: &str) -> String {
    match segment.find(":nth-child") {
        Some(idx) => segment[..idx].to_string(),
        None => segment.to_string(),
    }
}

/// Minimal CSS segment matcher: tag, `#id`, `.class` (repeatable),
/// `[attr=value]` with optional quotes, in any simple combination.
fn segment_matches(node: &FakeNode, segment: &str) -> bool {
    if segment.is_empty() {
        return false;
    }
    let mut rest = segment;

    // Leading tag name
    let tag_end = rest
        .find(|c| c == '#' || c == '.' || c == '[')
        .unwrap_or(rest.len());
    let tag = &rest[..tag_end];
    if !tag.is_empty() && !tag.eq_ignore_ascii_case(&node.tag) {
        return false;
    }
    rest = &rest[tag_end..];

    while !rest.is_empty() {
        if let Some(stripped) = rest.strip_prefix('#') {
            let end = stripped
                .find(|c| c == '.' || c == '[')
                .unwrap_or(stripped.len());
            if node.id.as_deref() != Some(&stripped[..end]) {
                return false;
            }
            rest = &stripped[end..];
        } else if let Some(stripped) = rest.strip_prefix('.') {
            let end = stripped
                .find(|c| c == '.' || c == '[' || c == '#')
                .unwrap_or(stripped.len());
            if !node.classes.iter().any(|c| c == &stripped[..end]) {
                return false;
            }
            rest = &stripped[end..];
        } else if let Some(stripped) = rest.strip_prefix('[') {
            let end = match stripped.find(']') {
                Some(e) => e,
                None => return false,
            };
            let body = &stripped[..end];
            match body.split_once('=') {
                Some((key, value)) => {
                    let value = value.trim_matches('"').trim_matches('\'');
                    if node.attributes.get(key).map(String::as_str) != Some(value) {
                        return false;
                    }
                }
                None => {
                    if !node.attributes.contains_key(body) {
                        return false;
                    }
                }
            }
            rest = &stripped[end + 1..];
        } else {
            return false;
        }
    }
    true
}

/// Scripted transport over a [`FakePage`].
#[derive(Default)]
pub struct FakeTransport {
    page: FakePage,
    fail: Mutex<HashMap<String, u32>>,
    subscribers: Mutex<HashMap<String, Vec<mpsc::Sender<TransportEvent>>>>,
    log: Mutex<Vec<(String, Value)>>,
}

impl FakeTransport {
    pub fn page(&self) -> FakePage {
        self.page.clone()
    }

    /// Make the next `count` invocations of `method` fail transiently.
    pub fn fail_next(&self, method: &str, count: u32) {
        self.fail.lock().unwrap().insert(method.to_string(), count);
    }

    /// All commands sent so far, in order.
    pub fn sent(&self) -> Vec<(String, Value)> {
        self.log.lock().unwrap().clone()
    }

    /// Commands whose method matches a prefix.
    pub fn sent_matching(&self, prefix: &str) -> Vec<(String, Value)> {
        self.sent()
            .into_iter()
            .filter(|(m, _)| m.starts_with(prefix))
            .collect()
    }

    /// Deliver an out-of-band event to subscribers of `event`.
    pub async fn emit(&self, target: &TargetId, event: &str, params: Value) {
        let senders = {
            let subs = self.subscribers.lock().unwrap();
            subs.get(event).cloned().unwrap_or_default()
        };
        for tx in senders {
            let _ = tx
                .send(TransportEvent {
                    target: target.clone(),
                    event: event.to_string(),
                    params: params.clone(),
                })
                .await;
        }
    }

    fn take_failure(&self, method: &str) -> bool {
        let mut fail = self.fail.lock().unwrap();
        if let Some(count) = fail.get_mut(method) {
            if *count > 0 {
                *count -= 1;
                return true;
            }
        }
        false
    }

    fn handle_eval(&self, expression: &str) -> Value {
        if let Some(args) = expression
            .strip_prefix("__replay.setValue(")
            .and_then(|s| s.strip_suffix(')'))
        {
            if let Some((id, value)) = args.split_once(',') {
                if let Ok(id) = id.trim().parse::<i64>() {
                    let value = value.trim().trim_matches('"').to_string();
                    self.page.update_node(id, |n| n.value = value);
                }
            }
            return json!({ "result": true });
        }
        if let Some(args) = expression
            .strip_prefix("__replay.getValue(")
            .and_then(|s| s.strip_suffix(')'))
        {
            if let Ok(id) = args.trim().parse::<i64>() {
                return json!({ "result": self.page.node_value(id) });
            }
        }
        json!({ "result": true })
    }

    fn ax_tree(&self) -> Value {
        let state = self.page.state.lock().unwrap();
        let nodes: Vec<Value> = state
            .nodes
            .iter()
            .filter_map(|n| {
                n.role.as_ref().map(|role| {
                    json!({
                        "backendNodeId": n.backend_id,
                        "role": role,
                        "name": n.name.clone().unwrap_or_default(),
                        "hidden": n.hidden,
                        "ignored": false,
                        "states": [],
                    })
                })
            })
            .collect();
        json!({ "nodes": nodes })
    }
}

#[async_trait]
impl CommandTransport for FakeTransport {
    async fn attach(&self, _target: &TargetId) -> Result<()> {
        Ok(())
    }

    async fn detach(&self, _target: &TargetId) -> Result<()> {
        Ok(())
    }

    async fn send(&self, _target: &TargetId, method: &str, params: Value) -> Result<Value> {
        self.log
            .lock()
            .unwrap()
            .push((method.to_string(), params.clone()));
        if self.take_failure(method) {
            return Err(Error::transport(method, "injected transient failure"));
        }

        match method {
            "dom.query" => {
                let selector = params["selector"].as_str().unwrap_or_default();
                let ids: Vec<i64> = self
                    .page
                    .matching(selector)
                    .iter()
                    .map(|n| n.backend_id)
                    .collect();
                Ok(json!({ "nodes": ids }))
            }
            "dom.boxModel" => {
                let id = params["backendNodeId"].as_i64().unwrap_or_default();
                match self.page.find(id) {
                    Some(node) => Ok(json!({ "rect": node.rect })),
                    None => Err(Error::not_found(format!("node {id}"))),
                }
            }
            "dom.nodeAtPoint" => {
                let p = Point::new(
                    params["x"].as_f64().unwrap_or_default(),
                    params["y"].as_f64().unwrap_or_default(),
                );
                Ok(json!({ "node": self.page.node_at(p).map(|n| n.describe()) }))
            }
            "dom.describeNode" => {
                let id = params["backendNodeId"].as_i64().unwrap_or_default();
                Ok(json!({ "node": self.page.find(id).map(|n| n.describe()) }))
            }
            "dom.focus" => {
                let id = params["backendNodeId"].as_i64().unwrap_or_default();
                self.page.state.lock().unwrap().focused = Some(id);
                Ok(json!({}))
            }
            "dom.scrollIntoView" | "input.wheel" | "input.mouseMove" => Ok(json!({})),
            "input.mousePress" => {
                // Toggle checkboxes and radios the way a page would.
                let p = Point::new(
                    params["x"].as_f64().unwrap_or_default(),
                    params["y"].as_f64().unwrap_or_default(),
                );
                if let Some(node) = self.page.node_at(p) {
                    let toggle = node.tag.eq_ignore_ascii_case("input")
                        && matches!(
                            node.attributes.get("type").map(String::as_str),
                            Some("checkbox") | Some("radio")
                        );
                    if toggle {
                        self.page.update_node(node.backend_id, |n| {
                            n.value = if n.value == "true" {
                                "false".to_string()
                            } else {
                                "true".to_string()
                            };
                        });
                    }
                }
                Ok(json!({}))
            }
            "input.mouseRelease" => Ok(json!({})),
            "input.keyDown" => {
                let key = params["key"].as_str().unwrap_or_default();
                let text = params["text"].as_str();
                let mut state = self.page.state.lock().unwrap();
                let focused = state.focused;
                if key == "Control+A" {
                    state.select_all_pending = true;
                } else if key == "Backspace" {
                    if let Some(id) = focused {
                        let select_all = state.select_all_pending;
                        if let Some(node) = state.nodes.iter_mut().find(|n| n.backend_id == id) {
                            if select_all {
                                node.value.clear();
                            } else {
                                node.value.pop();
                            }
                        }
                    }
                    state.select_all_pending = false;
                } else if let Some(text) = text {
                    if let Some(id) = focused {
                        if let Some(node) = state.nodes.iter_mut().find(|n| n.backend_id == id) {
                            node.value.push_str(text);
                        }
                    }
                    state.select_all_pending = false;
                }
                Ok(json!({}))
            }
            "input.keyUp" => Ok(json!({})),
            "ax.tree" => Ok(self.ax_tree()),
            "page.screenshot" => {
                let state = self.page.state.lock().unwrap();
                let words: Vec<Value> = state
                    .ocr_words
                    .iter()
                    .map(|(text, rect, conf)| {
                        json!({ "text": text, "confidence": conf, "bbox": rect })
                    })
                    .collect();
                let data = serde_json::to_string(&words).expect("serializable words");
                Ok(json!({ "data": data }))
            }
            "page.metrics" => {
                let state = self.page.state.lock().unwrap();
                let (vw, vh) = if state.viewport == (0.0, 0.0) {
                    (1280.0, 800.0)
                } else {
                    state.viewport
                };
                Ok(json!({
                    "url": if state.url.is_empty() { "https://example.test/page" } else { &state.url },
                    "scrollX": state.scroll.0,
                    "scrollY": state.scroll.1,
                    "viewportWidth": vw,
                    "viewportHeight": vh,
                }))
            }
            "runtime.eval" => {
                let expression = params["expression"].as_str().unwrap_or_default();
                Ok(self.handle_eval(expression))
            }
            other => Err(Error::transport(other, "unknown method")),
        }
    }

    async fn subscribe(
        &self,
        _target: &TargetId,
        event: &str,
    ) -> Result<mpsc::Receiver<TransportEvent>> {
        let (tx, rx) = mpsc::channel(256);
        self.subscribers
            .lock()
            .unwrap()
            .entry(event.to_string())
            .or_default()
            .push(tx);
        Ok(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_segment_matcher() {
        let node = FakeNode::new("button")
            .with_id("submit")
            .with_class("btn-primary")
            .with_attr("data-testid", "send");

        assert!(segment_matches(&node, "#submit"));
        assert!(segment_matches(&node, "button#submit"));
        assert!(segment_matches(&node, ".btn-primary"));
        assert!(segment_matches(&node, "button.btn-primary"));
        assert!(segment_matches(&node, "[data-testid=send]"));
        assert!(segment_matches(&node, "[data-testid=\"send\"]"));
        assert!(!segment_matches(&node, "#other"));
        assert!(!segment_matches(&node, "div.btn-primary"));
    }

    #[test]
    fn test_path_selector_matches_last_segment() {
        let page = FakePage::default();
        page.add_node(FakeNode::new("div").with_class("row"));
        page.add_node(FakeNode::new("div").with_class("row"));

        let matches = page.matching("main > section > div.row:nth-child(2)");
        assert_eq!(matches.len(), 2);
    }

    #[test]
    fn test_node_at_point_prefers_topmost() {
        let page = FakePage::default();
        let below = page.add_node(FakeNode::new("div").with_rect(Rect::new(0.0, 0.0, 100.0, 100.0)));
        let above = page.add_node(FakeNode::new("button").with_rect(Rect::new(0.0, 0.0, 50.0, 50.0)));

        assert_eq!(page.node_at(Point::new(10.0, 10.0)).unwrap().backend_id, above);
        assert_eq!(page.node_at(Point::new(90.0, 90.0)).unwrap().backend_id, below);
    }
}
