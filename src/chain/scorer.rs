//! Strategy scorer: evidence-derived candidates to final confidences.
//!
//! Pure and stateless: the same candidate and element context always
//! produce the same confidence. Pattern tables for framework-dynamic
//! ids and classes live here and are shared with the DOM capture
//! layer's selector generation.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::LazyLock;

use super::{StrategyMetadata, StrategyType};

/// Classes that reflect transient UI state, never structure.
static STATE_CLASSES: &[&str] = &[
    "active", "hover", "focus", "focused", "selected", "checked", "disabled", "open", "visible",
    "hidden",
];

/// Hashed / framework-emitted class shapes (CSS modules, styled
/// components, short hash tokens).
static HASHED_CLASS_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(css|sc|jss|chakra)-|^[a-z]{0,2}\d[a-z0-9]*$|__[A-Za-z0-9]*\d[A-Za-z0-9]*$")
        .expect("valid hashed-class pattern")
});

/// Default framework-dynamic id patterns; the exact cutoff drifts per
/// framework, so the set is configurable.
pub const DEFAULT_DYNAMIC_ID_PATTERNS: &[&str] = &["^(ember|react|ng-|_)", "^[a-z]{1,2}\\d+$"];

/// Attributes stable enough to locate by.
pub const DEFAULT_STABLE_ATTRIBUTES: &[&str] =
    &["name", "type", "href", "src", "alt", "title", "placeholder"];

/// Whether a class name is framework-generated or state-reflecting.
pub fn is_dynamic_class(class: &str) -> bool {
    class.starts_with('_')
        || STATE_CLASSES.contains(&class)
        || HASHED_CLASS_RE.is_match(class)
}

/// Classes that survive the dynamic-class filter, in original order.
pub fn filter_stable_classes(classes: &[String]) -> Vec<String> {
    classes
        .iter()
        .filter(|c| !is_dynamic_class(c))
        .cloned()
        .collect()
}

/// Where a candidate came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CandidateSource {
    Selector,
    Semantic,
    Vision,
    Mouse,
    Coordinates,
}

/// A raw candidate before scoring.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Candidate {
    #[serde(rename = "type")]
    pub strategy_type: StrategyType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub selector: Option<String>,
    pub metadata: StrategyMetadata,
    pub source: CandidateSource,
    pub raw_confidence: f64,
}

/// Element context the scorer weighs candidates against.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ElementContext {
    pub has_id: bool,
    pub has_test_id: bool,
    pub has_accessible_name: bool,
    pub is_form_element: bool,
    pub is_in_shadow_dom: bool,
    pub role: Option<String>,
}

/// Scorer configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScorerConfig {
    /// Regexes marking an id as framework-generated
    pub dynamic_id_patterns: Vec<String>,
    /// Confidence multiplier applied to dynamic ids
    pub dynamic_id_penalty: f64,
    /// Floor for test-id selectors
    pub test_id_floor: f64,
    /// Attribute allowlist for attribute selectors
    pub stable_attributes: Vec<String>,
    /// Longest attribute value worth locating by
    pub max_attribute_value_len: usize,
    /// Confidence for role-only semantic candidates
    pub role_only_confidence: f64,
}

impl Default for ScorerConfig {
    fn default() -> Self {
        Self {
            dynamic_id_patterns: DEFAULT_DYNAMIC_ID_PATTERNS
                .iter()
                .map(|s| s.to_string())
                .collect(),
            dynamic_id_penalty: 0.5,
            test_id_floor: 0.95,
            stable_attributes: DEFAULT_STABLE_ATTRIBUTES
                .iter()
                .map(|s| s.to_string())
                .collect(),
            max_attribute_value_len: 100,
            role_only_confidence: 0.75,
        }
    }
}

/// Compiled scorer.
///
/// Holds the compiled dynamic-id patterns; scoring itself is a pure
/// function of (candidate, context).
#[derive(Debug)]
pub struct StrategyScorer {
    config: ScorerConfig,
    dynamic_id: Vec<Regex>,
}

impl StrategyScorer {
    pub fn new(config: ScorerConfig) -> Self {
        let dynamic_id = config
            .dynamic_id_patterns
            .iter()
            .filter_map(|p| Regex::new(p).ok())
            .collect();
        Self { config, dynamic_id }
    }

    pub fn config(&self) -> &ScorerConfig {
        &self.config
    }

    fn is_dynamic_id(&self, id: &str) -> bool {
        self.dynamic_id.iter().any(|re| re.is_match(id))
    }

    /// Score a candidate to its final confidence in [0, 1].
    ///
    /// A score of 0 means the candidate is rejected outright.
    pub fn score(&self, candidate: &Candidate, ctx: &ElementContext) -> f64 {
        let mut confidence = candidate.raw_confidence;

        if let Some(selector) = candidate.selector.as_deref() {
            match classify_selector(selector) {
                SelectorClass::Id(id) => {
                    if self.is_dynamic_id(&id) {
                        confidence *= self.config.dynamic_id_penalty;
                    }
                }
                SelectorClass::TestId => {
                    confidence = confidence.max(self.config.test_id_floor);
                }
                SelectorClass::Classes(classes) => {
                    let stable = filter_stable_classes(&classes);
                    match stable.len() {
                        0 => return 0.0,
                        1 => confidence *= 0.8,
                        _ => {}
                    }
                }
                SelectorClass::Attribute { name, value } => {
                    let allowed = self
                        .config
                        .stable_attributes
                        .iter()
                        .any(|a| a == &name);
                    if !allowed || value.len() > self.config.max_attribute_value_len {
                        return 0.0;
                    }
                }
                SelectorClass::Path => {
                    // A path with no id/class/attribute discriminators
                    // pins nothing but tag structure.
                    if !selector.contains(['.', '#', '[', ':']) {
                        confidence *= 0.8;
                    }
                }
            }
        }

        match &candidate.metadata {
            StrategyMetadata::SemanticRole { name, .. } => {
                let named = name.as_deref().is_some_and(|n| !n.is_empty())
                    && ctx.has_accessible_name;
                if !named {
                    confidence = self.config.role_only_confidence;
                }
            }
            StrategyMetadata::SemanticText { text, .. } => {
                if text.trim().is_empty() {
                    return 0.0;
                }
            }
            StrategyMetadata::OcrText {
                text,
                ocr_confidence,
                ..
            } => {
                if text.trim().is_empty() {
                    return 0.0;
                }
                if let Some(ocr) = ocr_confidence {
                    confidence *= (ocr / 100.0).clamp(0.0, 1.0);
                }
            }
            _ => {}
        }

        confidence.clamp(0.0, 1.0)
    }
}

impl Default for StrategyScorer {
    fn default() -> Self {
        Self::new(ScorerConfig::default())
    }
}

/// Convenience wrapper: score one candidate with a fresh scorer.
pub fn score_candidate(candidate: &Candidate, ctx: &ElementContext, config: &ScorerConfig) -> f64 {
    StrategyScorer::new(config.clone()).score(candidate, ctx)
}

enum SelectorClass {
    Id(String),
    TestId,
    Classes(Vec<String>),
    Attribute { name: String, value: String },
    Path,
}

fn classify_selector(selector: &str) -> SelectorClass {
    if selector.contains(" > ") || selector.contains(' ') || selector.starts_with('/') {
        return SelectorClass::Path;
    }
    if let Some(id) = selector.strip_prefix('#') {
        return SelectorClass::Id(id.to_string());
    }
    // Attribute selector, with or without a tag prefix.
    if let Some(bracket) = selector.find('[') {
        let prefix = &selector[..bracket];
        if !prefix.contains(['.', '#']) && selector.ends_with(']') {
            let body = &selector[bracket + 1..selector.len() - 1];
            if body.starts_with("data-testid") {
                return SelectorClass::TestId;
            }
            if let Some((name, value)) = body.split_once('=') {
                return SelectorClass::Attribute {
                    name: name.to_string(),
                    value: value.trim_matches('"').trim_matches('\'').to_string(),
                };
            }
            return SelectorClass::Attribute {
                name: body.to_string(),
                value: String::new(),
            };
        }
    }
    if selector.contains('.') {
        let classes: Vec<String> = selector
            .split('.')
            .skip(1)
            .map(|c| c.to_string())
            .collect();
        if !classes.is_empty() {
            return SelectorClass::Classes(classes);
        }
    }
    SelectorClass::Path
}
