//! DOM capture layer: event interception and element descriptors.
//!
//! A page-world interceptor registers capture-phase listeners (so the
//! engine observes events before page handlers can stop propagation)
//! and wraps `attachShadow` to keep closed roots traversable. It ships
//! raw structural facts through the transport; this layer turns them
//! into rich element descriptors: selector preference order, ancestor
//! CSS path and XPath, the accessible-name cascade, shadow-host and
//! iframe chains, and redacted value extraction. Rapid repeats on one
//! target are debounced with the click count carried through.

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::{CaptureLayer, LayerStatus, DOM_EVENT};
use crate::chain::filter_stable_classes;
use crate::error::{Error, Result};
use crate::evidence::{ElementDescriptor, EventType, FormContext, IframeEntry};
use crate::geom::{Point, Rect};
use crate::transport::{CommandTransport, TargetId};

/// Token recorded in place of password values.
pub const REDACTED_VALUE: &str = "\u{ab}redacted\u{bb}";

/// Script evaluated in the page to install the capture-phase
/// interceptor and the `attachShadow` wrapper.
pub(crate) const INSTALL_EXPRESSION: &str = "__replay.domInstall()";
/// Script evaluated to remove the interceptor.
pub(crate) const RESTORE_EXPRESSION: &str = "__replay.domRestore()";

/// DOM layer configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DomConfig {
    /// Debounce window per target element, in milliseconds
    pub debounce_ms: u64,
}

impl Default for DomConfig {
    fn default() -> Self {
        Self { debounce_ms: 50 }
    }
}

/// One ancestor on the path from the target to the document root,
/// nearest first.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RawAncestor {
    pub tag_name: String,
    pub id: Option<String>,
    pub class_list: Vec<String>,
    /// 1-based position among the parent's element children
    pub nth_child: usize,
    /// Whether the tag is unique among its siblings
    pub tag_unique_among_siblings: bool,
}

/// Raw structural facts about the event target, as shipped by the
/// page-side interceptor.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RawElement {
    pub tag_name: String,
    pub id: Option<String>,
    pub class_list: Vec<String>,
    pub attributes: HashMap<String, String>,
    pub text: String,
    pub input_type: Option<String>,
    pub rect: Rect,
    pub role: Option<String>,
    pub aria_label: Option<String>,
    /// Text of the node referenced by aria-labelledby, pre-resolved
    pub aria_labelledby_text: Option<String>,
    /// Text of the associated label element, pre-resolved
    pub label_text: Option<String>,
    pub placeholder: Option<String>,
    pub title: Option<String>,
    pub value: Option<String>,
    /// Whether the `name` attribute is unique in the document
    pub name_unique: bool,
    pub nth_child: usize,
    pub tag_unique_among_siblings: bool,
    pub form: Option<FormContext>,
    pub ancestors: Vec<RawAncestor>,
}

/// One intercepted page event.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RawDomEvent {
    pub event_type: String,
    /// Epoch milliseconds
    pub timestamp: f64,
    pub click_count: u32,
    pub checked: Option<bool>,
    pub files: Vec<String>,
    pub key: Option<String>,
    pub element: RawElement,
    pub shadow_hosts: Vec<String>,
    pub iframes: Vec<IframeEntry>,
    pub click_point: Option<Point>,
}

/// The layer's callback payload: one captured DOM event with its
/// descriptor.
#[derive(Debug, Clone)]
pub struct DomCapture {
    pub event_type: EventType,
    pub descriptor: ElementDescriptor,
    pub value: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub click_count: u32,
}

/// Intercepts user events and produces element descriptors.
pub struct DomCaptureLayer {
    transport: Arc<dyn CommandTransport>,
    config: DomConfig,
    tx: mpsc::Sender<DomCapture>,
    rx: Mutex<Option<mpsc::Receiver<DomCapture>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    installed: Mutex<bool>,
}

impl DomCaptureLayer {
    pub fn new(transport: Arc<dyn CommandTransport>, config: DomConfig) -> Self {
        let (tx, rx) = mpsc::channel(256);
        Self {
            transport,
            config,
            tx,
            rx: Mutex::new(Some(rx)),
            tasks: Mutex::new(Vec::new()),
            installed: Mutex::new(false),
        }
    }

    /// Take the capture stream. Single consumer; the orchestrator.
    pub fn take_captures(&self) -> Option<mpsc::Receiver<DomCapture>> {
        self.rx.lock().unwrap().take()
    }

    /// Turn a raw event into the callback payload.
    pub fn process(raw: &RawDomEvent) -> DomCapture {
        let event_type = map_event_type(raw);
        let value = extract_value(raw);
        let descriptor = build_descriptor(raw);
        let timestamp = Utc
            .timestamp_millis_opt(raw.timestamp as i64)
            .single()
            .unwrap_or_else(Utc::now);
        DomCapture {
            event_type,
            descriptor,
            value,
            timestamp,
            click_count: raw.click_count.max(1),
        }
    }
}

#[async_trait]
impl CaptureLayer for DomCaptureLayer {
    fn name(&self) -> &'static str {
        "dom"
    }

    async fn start(&self, target: &TargetId) -> Result<()> {
        self.transport
            .send(
                target,
                "runtime.eval",
                serde_json::json!({ "expression": INSTALL_EXPRESSION }),
            )
            .await
            .map_err(|e| Error::init_failed(self.name(), e.to_string()))?;
        *self.installed.lock().unwrap() = true;

        let mut rx = self.transport.subscribe(target, DOM_EVENT).await?;
        let tx = self.tx.clone();
        let window = Duration::from_millis(self.config.debounce_ms);
        let pending: Arc<Mutex<HashMap<String, (DomCapture, u64)>>> =
            Arc::new(Mutex::new(HashMap::new()));

        let handle = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                let raw: RawDomEvent = match serde_json::from_value(event.params.clone()) {
                    Ok(raw) => raw,
                    Err(e) => {
                        warn!("undecodable DOM event dropped: {e}");
                        continue;
                    }
                };
                let capture = Self::process(&raw);
                let key = debounce_key(&capture);

                let generation = {
                    let mut pending = pending.lock().unwrap();
                    match pending.remove(&key) {
                        Some((earlier, generation)) => {
                            let mut merged = capture.clone();
                            merged.click_count = merged.click_count.max(earlier.click_count);
                            let next = generation + 1;
                            pending.insert(key.clone(), (merged, next));
                            next
                        }
                        None => {
                            pending.insert(key.clone(), (capture.clone(), 0));
                            0
                        }
                    }
                };

                let pending = pending.clone();
                let tx = tx.clone();
                let key = key.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(window).await;
                    let ready = {
                        let mut pending = pending.lock().unwrap();
                        match pending.get(&key) {
                            Some((_, current)) if *current == generation => {
                                pending.remove(&key).map(|(capture, _)| capture)
                            }
                            _ => None,
                        }
                    };
                    if let Some(capture) = ready {
                        let _ = tx.send(capture).await;
                    }
                });
            }
        });
        self.tasks.lock().unwrap().push(handle);
        debug!("dom capture layer started");
        Ok(())
    }

    async fn stop(&self, target: &TargetId) -> Result<()> {
        for task in self.tasks.lock().unwrap().drain(..) {
            task.abort();
        }
        let installed = *self.installed.lock().unwrap();
        if installed {
            let result = self
                .transport
                .send(
                    target,
                    "runtime.eval",
                    serde_json::json!({ "expression": RESTORE_EXPRESSION }),
                )
                .await;
            if let Err(e) = result {
                warn!("failed to remove DOM interceptor: {e}");
            } else {
                *self.installed.lock().unwrap() = false;
            }
        }
        Ok(())
    }

    fn status(&self) -> LayerStatus {
        LayerStatus::healthy(self.name())
    }
}

fn debounce_key(capture: &DomCapture) -> String {
    let element = capture
        .descriptor
        .selector
        .clone()
        .unwrap_or_else(|| capture.descriptor.css_path.clone());
    format!("{}:{element}", capture.event_type)
}

/// Map a raw page event to the recorded action kind.
fn map_event_type(raw: &RawDomEvent) -> EventType {
    let tag = raw.element.tag_name.to_ascii_lowercase();
    let toggle = matches!(
        raw.element.input_type.as_deref(),
        Some("checkbox") | Some("radio")
    );
    match raw.event_type.as_str() {
        "click" => EventType::Click,
        "submit" => EventType::Submit,
        "change" if tag == "select" => EventType::Select,
        // Toggles replay as clicks; the recorded checked state is the
        // verification target.
        "change" | "input" if toggle => EventType::Click,
        "change" | "input" | "keydown" => EventType::Type,
        "scroll" => EventType::Scroll,
        _ => EventType::Click,
    }
}

/// Extract the action value, redacting what must not be recorded.
fn extract_value(raw: &RawDomEvent) -> Option<String> {
    let input_type = raw
        .element
        .input_type
        .as_deref()
        .map(str::to_ascii_lowercase);
    match input_type.as_deref() {
        Some("password") => Some(REDACTED_VALUE.to_string()),
        Some("checkbox") | Some("radio") => raw.checked.map(|c| c.to_string()),
        Some("file") => Some(raw.files.join(",")),
        _ => {
            if raw.event_type == "keydown" {
                raw.key.clone()
            } else {
                raw.element.value.clone()
            }
        }
    }
}

/// Build the element descriptor from raw structural facts.
pub fn build_descriptor(raw: &RawDomEvent) -> ElementDescriptor {
    let element = &raw.element;
    let data_attributes: HashMap<String, String> = element
        .attributes
        .iter()
        .filter_map(|(k, v)| {
            k.strip_prefix("data-")
                .map(|stripped| (stripped.to_string(), v.clone()))
        })
        .collect();
    let test_id = element
        .attributes
        .get("data-testid")
        .or_else(|| element.attributes.get("data-test"))
        .cloned();

    let selector = preferred_selector(element, test_id.as_deref());
    let css_path = css_path(element);
    let xpath = xpath(element);
    let rect = element.rect;

    ElementDescriptor {
        tag_name: element.tag_name.to_ascii_lowercase(),
        id: element.id.clone(),
        class_list: element.class_list.clone(),
        attributes: element.attributes.clone(),
        data_attributes,
        test_id,
        role: element.role.clone().or_else(|| implicit_role(element)),
        accessible_name: accessible_name(element),
        text: element.text.trim().to_string(),
        placeholder: element.placeholder.clone(),
        bounding_rect: rect,
        click_point: raw.click_point.unwrap_or_else(|| rect.center()),
        selector,
        css_path,
        xpath,
        is_in_shadow_dom: !raw.shadow_hosts.is_empty(),
        shadow_host_chain: raw.shadow_hosts.clone(),
        iframe_chain: raw.iframes.clone(),
        form_context: element.form.clone(),
    }
}

/// Selector preference order: unique id, test id, unique name, none.
/// Without one of those the ancestor CSS path is the best available.
fn preferred_selector(element: &RawElement, test_id: Option<&str>) -> Option<String> {
    if let Some(id) = element.id.as_deref() {
        if !id.is_empty() {
            return Some(format!("#{id}"));
        }
    }
    if let Some(test_id) = test_id {
        return Some(format!("[data-testid=\"{test_id}\"]"));
    }
    if element.name_unique {
        if let Some(name) = element.attributes.get("name") {
            return Some(format!("[name=\"{name}\"]"));
        }
    }
    None
}

fn css_segment(
    tag: &str,
    classes: &[String],
    nth_child: usize,
    tag_unique: bool,
) -> String {
    let mut segment = tag.to_ascii_lowercase();
    for class in filter_stable_classes(classes) {
        segment.push('.');
        segment.push_str(&class);
    }
    if !tag_unique && nth_child > 0 {
        segment.push_str(&format!(":nth-child({nth_child})"));
    }
    segment
}

/// Ancestor CSS path, terminated at the first ancestor with an id.
fn css_path(element: &RawElement) -> String {
    let mut segments = vec![css_segment(
        &element.tag_name,
        &element.class_list,
        element.nth_child,
        element.tag_unique_among_siblings,
    )];
    for ancestor in &element.ancestors {
        if let Some(id) = ancestor.id.as_deref() {
            if !id.is_empty() {
                segments.push(format!("#{id}"));
                break;
            }
        }
        segments.push(css_segment(
            &ancestor.tag_name,
            &ancestor.class_list,
            ancestor.nth_child,
            ancestor.tag_unique_among_siblings,
        ));
    }
    segments.reverse();
    segments.join(" > ")
}

fn xpath_segment(tag: &str, nth_child: usize, tag_unique: bool) -> String {
    let tag = tag.to_ascii_lowercase();
    if tag_unique || nth_child == 0 {
        tag
    } else {
        format!("{tag}[{nth_child}]")
    }
}

/// The same ancestry walk in XPath syntax.
fn xpath(element: &RawElement) -> String {
    let mut segments = vec![xpath_segment(
        &element.tag_name,
        element.nth_child,
        element.tag_unique_among_siblings,
    )];
    let mut anchored = false;
    for ancestor in &element.ancestors {
        if let Some(id) = ancestor.id.as_deref() {
            if !id.is_empty() {
                segments.push(format!("//*[@id=\"{id}\"]"));
                anchored = true;
                break;
            }
        }
        segments.push(xpath_segment(
            &ancestor.tag_name,
            ancestor.nth_child,
            ancestor.tag_unique_among_siblings,
        ));
    }
    segments.reverse();
    if anchored {
        segments.join("/")
    } else {
        format!("/{}", segments.join("/"))
    }
}

/// Accessible-name priority cascade.
fn accessible_name(element: &RawElement) -> Option<String> {
    let candidates: [Option<&String>; 5] = [
        element.aria_label.as_ref(),
        element.aria_labelledby_text.as_ref(),
        element.label_text.as_ref(),
        element.title.as_ref(),
        element.placeholder.as_ref(),
    ];
    for candidate in candidates.into_iter().flatten() {
        let trimmed = candidate.trim();
        if !trimmed.is_empty() {
            return Some(trimmed.to_string());
        }
    }

    let tag = element.tag_name.to_ascii_lowercase();
    if matches!(tag.as_str(), "button" | "a") && !element.text.trim().is_empty() {
        return Some(element.text.trim().to_string());
    }
    if tag == "input"
        && element.input_type.as_deref() == Some("submit")
        && element.value.as_deref().is_some_and(|v| !v.is_empty())
    {
        return element.value.as_ref().map(|v| v.trim().to_string());
    }
    None
}

/// Implicit role for common interactive tags.
fn implicit_role(element: &RawElement) -> Option<String> {
    let tag = element.tag_name.to_ascii_lowercase();
    let role = match tag.as_str() {
        "button" => "button",
        "a" => {
            if element.attributes.contains_key("href") {
                "link"
            } else {
                return None;
            }
        }
        "select" => "combobox",
        "textarea" => "textbox",
        "input" => match element.input_type.as_deref().unwrap_or("text") {
            "checkbox" => "checkbox",
            "radio" => "radio",
            "submit" | "button" => "button",
            "range" => "slider",
            _ => "textbox",
        },
        _ => return None,
    };
    Some(role.to_string())
}
