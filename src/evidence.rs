//! Per-action evidence data model.
//!
//! Everything captured for one user action lives here: the DOM element
//! descriptor, the mouse trail and its derived summary, the vision
//! (OCR) snapshot, and the network snapshot. A [`CapturedAction`] owns
//! its evidence bundle together with the generated fallback chain and
//! is JSON-serializable as the emitted-record contract requires.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

use crate::chain::FallbackChain;
use crate::geom::{Point, Rect};
use crate::ocr::OcrResult;

/// The kinds of user actions the engine records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventType {
    Click,
    Type,
    Select,
    Submit,
    Navigate,
    Scroll,
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Click => "click",
            Self::Type => "type",
            Self::Select => "select",
            Self::Submit => "submit",
            Self::Navigate => "navigate",
            Self::Scroll => "scroll",
        };
        write!(f, "{s}")
    }
}

/// One ancestor frame of a target inside an iframe.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IframeEntry {
    pub src: Option<String>,
    pub id: Option<String>,
    pub name: Option<String>,
    pub index: usize,
}

/// Form the target participates in, if any.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FormContext {
    pub id: Option<String>,
    pub name: Option<String>,
    pub action: Option<String>,
}

/// Rich snapshot of the event target, immutable once captured.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ElementDescriptor {
    pub tag_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub class_list: Vec<String>,
    pub attributes: HashMap<String, String>,
    /// `data-*` attributes, keyed without the prefix
    pub data_attributes: HashMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub test_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub accessible_name: Option<String>,
    pub text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub placeholder: Option<String>,
    pub bounding_rect: Rect,
    pub click_point: Point,
    /// Best unique selector for the element, when one exists
    #[serde(skip_serializing_if = "Option::is_none")]
    pub selector: Option<String>,
    /// Ancestor CSS path, unique or not
    pub css_path: String,
    /// Ancestor XPath, terminated at the first ID
    pub xpath: String,
    pub is_in_shadow_dom: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub shadow_host_chain: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub iframe_chain: Vec<IframeEntry>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub form_context: Option<FormContext>,
}

impl ElementDescriptor {
    /// Whether the element is a form control.
    pub fn is_form_element(&self) -> bool {
        matches!(
            self.tag_name.to_ascii_lowercase().as_str(),
            "input" | "select" | "textarea" | "button" | "option" | "label" | "form"
        )
    }
}

/// A sampled point on the mouse trail.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TrailPoint {
    pub x: f64,
    pub y: f64,
    /// Epoch milliseconds
    pub t: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub velocity: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub acceleration: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pressed: Option<bool>,
}

impl TrailPoint {
    pub fn new(x: f64, y: f64, t: f64) -> Self {
        Self {
            x,
            y,
            t,
            velocity: None,
            acceleration: None,
            pressed: None,
        }
    }

    pub fn point(&self) -> Point {
        Point::new(self.x, self.y)
    }
}

/// Movement pattern classified from the trail.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MousePattern {
    Direct,
    Curved,
    Searching,
    Hesitant,
    Corrective,
    #[default]
    Unknown,
}

/// Metrics derived from a trail on read.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrailSummary {
    pub endpoint: Point,
    pub total_distance: f64,
    /// Pixels per second over the whole trail
    pub average_velocity: f64,
    pub direction_changes: usize,
    pub hesitation_points: Vec<Point>,
    pub pattern: MousePattern,
}

/// Mouse evidence: the raw trail plus its derived summary.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MouseEvidence {
    pub points: Vec<TrailPoint>,
    pub summary: TrailSummary,
}

/// Vision evidence: OCR results for the viewport at capture time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VisionEvidence {
    pub results: Vec<OcrResult>,
    pub captured_at: DateTime<Utc>,
    /// Viewport fingerprint the results were cached under
    pub fingerprint: String,
}

/// Page load progress as last signaled by the page.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PageLoadState {
    #[default]
    Loading,
    DomContentLoaded,
    Complete,
}

/// Network evidence: the pending picture at capture time.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkEvidence {
    pub pending_count: usize,
    pub pending_urls: Vec<String>,
    /// Milliseconds since the last network activity
    pub network_idle_ms: u64,
    pub page_load_state: PageLoadState,
}

/// Union of the per-layer snapshots taken for one action.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EvidenceBundle {
    pub dom: ElementDescriptor,
    pub mouse: Option<MouseEvidence>,
    pub vision: Option<VisionEvidence>,
    pub network: Option<NetworkEvidence>,
}

impl EvidenceBundle {
    pub fn new(dom: ElementDescriptor) -> Self {
        Self {
            dom,
            mouse: None,
            vision: None,
            network: None,
        }
    }

    pub fn with_mouse(mut self, mouse: MouseEvidence) -> Self {
        self.mouse = Some(mouse);
        self
    }

    pub fn with_vision(mut self, vision: VisionEvidence) -> Self {
        self.vision = Some(vision);
        self
    }

    pub fn with_network(mut self, network: NetworkEvidence) -> Self {
        self.network = Some(network);
        self
    }
}

/// One recorded user action with all its evidence and fallback chain.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CapturedAction {
    pub action_id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub event_type: EventType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    /// Click count carried through debouncing (2 = double click)
    #[serde(default = "default_click_count")]
    pub click_count: u32,
    pub dom_evidence: ElementDescriptor,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vision_evidence: Option<VisionEvidence>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mouse_evidence: Option<MouseEvidence>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub network_evidence: Option<NetworkEvidence>,
    pub fallback_chain: FallbackChain,
}

fn default_click_count() -> u32 {
    1
}

impl CapturedAction {
    /// Assemble an action from its evidence bundle and generated chain.
    pub fn new(
        event_type: EventType,
        timestamp: DateTime<Utc>,
        value: Option<String>,
        bundle: EvidenceBundle,
        fallback_chain: FallbackChain,
    ) -> Self {
        Self {
            action_id: Uuid::new_v4(),
            timestamp,
            event_type,
            value,
            click_count: 1,
            dom_evidence: bundle.dom,
            vision_evidence: bundle.vision,
            mouse_evidence: bundle.mouse,
            network_evidence: bundle.network,
            fallback_chain,
        }
    }

    pub fn with_click_count(mut self, count: u32) -> Self {
        self.click_count = count;
        self
    }

    /// Approximate in-memory footprint, used for buffer accounting.
    pub fn estimated_bytes(&self) -> usize {
        serde_json::to_vec(self).map(|v| v.len()).unwrap_or(0)
    }
}
