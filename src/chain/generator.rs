//! Chain generator: evidence bundle to candidate set to built chain.
//!
//! Each candidate family returns nothing when its evidence is absent;
//! the coordinates candidate is always produced from the descriptor's
//! click point so every action can fall back to a raw position.

use tracing::debug;

use super::scorer::{Candidate, CandidateSource, ElementContext, ScorerConfig, StrategyScorer};
use super::{
    filter_stable_classes, AttributeProfile, ChainBuildResult, ChainBuilder, ChainBuilderConfig,
    LocatorStrategy, PathSyntax, StrategyMetadata, StrategyType, TextSource, UniqueSelectorKind,
};
use crate::error::Result;
use crate::evidence::{ElementDescriptor, EvidenceBundle};

/// Number of trailing trail points carried into the evidence strategy.
const TRAIL_TAIL_LEN: usize = 5;

/// Recorded estimate for a role+name candidate. Semantic matches are
/// verified against the live tree at replay and re-scored there; the
/// recorded estimate stays below a verified unique selector.
const SEMANTIC_ROLE_RAW: f64 = 0.82;
/// Recorded estimate for a text/label/placeholder candidate.
const SEMANTIC_TEXT_RAW: f64 = 0.80;

/// Generates fallback chains from evidence bundles.
pub struct ChainGenerator {
    scorer: StrategyScorer,
    builder: ChainBuilder,
}

impl ChainGenerator {
    pub fn new(scorer_config: ScorerConfig, builder_config: ChainBuilderConfig) -> Self {
        Self {
            scorer: StrategyScorer::new(scorer_config),
            builder: ChainBuilder::new(builder_config),
        }
    }

    /// Derive the fallback chain for one captured action.
    pub fn generate(&self, bundle: &EvidenceBundle) -> Result<ChainBuildResult> {
        let descriptor = &bundle.dom;
        let ctx = ElementContext {
            has_id: descriptor.id.is_some(),
            has_test_id: descriptor.test_id.is_some(),
            has_accessible_name: descriptor
                .accessible_name
                .as_deref()
                .is_some_and(|n| !n.is_empty()),
            is_form_element: descriptor.is_form_element(),
            is_in_shadow_dom: descriptor.is_in_shadow_dom,
            role: descriptor.role.clone(),
        };

        let mut candidates = Vec::new();
        self.selector_candidates(descriptor, &mut candidates);
        self.semantic_candidates(descriptor, &mut candidates);
        self.vision_candidates(bundle, &mut candidates);
        self.mouse_candidates(bundle, &mut candidates);
        candidates.push(Candidate {
            strategy_type: StrategyType::Coordinates,
            selector: None,
            metadata: StrategyMetadata::Coordinates {
                point: descriptor.click_point,
            },
            source: CandidateSource::Coordinates,
            raw_confidence: StrategyType::Coordinates.base_weight(),
        });

        let scored: Vec<LocatorStrategy> = candidates
            .into_iter()
            .map(|c| {
                let confidence = self.scorer.score(&c, &ctx);
                LocatorStrategy::new(c.strategy_type, c.selector, c.metadata, confidence)
            })
            .collect();
        debug!(candidates = scored.len(), "scored chain candidates");

        self.builder.build(scored, descriptor.click_point)
    }

    fn selector_candidates(&self, descriptor: &ElementDescriptor, out: &mut Vec<Candidate>) {
        let unique = |selector: String, kind: UniqueSelectorKind| Candidate {
            strategy_type: StrategyType::SelectorUnique,
            selector: Some(selector),
            metadata: StrategyMetadata::SelectorUnique { kind },
            source: CandidateSource::Selector,
            raw_confidence: StrategyType::SelectorUnique.base_weight(),
        };
        let path = |selector: String, syntax: PathSyntax| Candidate {
            strategy_type: StrategyType::SelectorPath,
            selector: Some(selector),
            metadata: StrategyMetadata::SelectorPath { syntax },
            source: CandidateSource::Selector,
            raw_confidence: StrategyType::SelectorPath.base_weight(),
        };

        if let Some(id) = &descriptor.id {
            out.push(unique(format!("#{id}"), UniqueSelectorKind::Id));
        }
        if let Some(test_id) = &descriptor.test_id {
            out.push(unique(
                format!("[data-testid=\"{test_id}\"]"),
                UniqueSelectorKind::TestId,
            ));
        }
        if let Some(name) = descriptor.attributes.get("name") {
            out.push(unique(format!("[name=\"{name}\"]"), UniqueSelectorKind::Name));
        }
        if let Some(selector) = &descriptor.selector {
            if !selector.starts_with('#') && !selector.starts_with("[data-testid") {
                out.push(unique(selector.clone(), UniqueSelectorKind::Css));
            }
        }

        let stable = filter_stable_classes(&descriptor.class_list);
        if !stable.is_empty() {
            let selector = format!("{}.{}", descriptor.tag_name, stable.join("."));
            out.push(path(selector, PathSyntax::Css));
        }
        for attr in ["type", "href", "src", "alt", "title", "placeholder"] {
            if let Some(value) = descriptor.attributes.get(attr) {
                out.push(path(
                    format!("{}[{attr}=\"{value}\"]", descriptor.tag_name),
                    PathSyntax::Css,
                ));
                break;
            }
        }
        if !descriptor.xpath.is_empty() {
            out.push(path(descriptor.xpath.clone(), PathSyntax::Xpath));
        }
        if !descriptor.css_path.is_empty() {
            out.push(path(descriptor.css_path.clone(), PathSyntax::Css));
        }
    }

    fn semantic_candidates(&self, descriptor: &ElementDescriptor, out: &mut Vec<Candidate>) {
        let text_candidate = |text: &str, source: TextSource| Candidate {
            strategy_type: StrategyType::SemanticText,
            selector: None,
            metadata: StrategyMetadata::SemanticText {
                text: text.to_string(),
                source,
            },
            source: CandidateSource::Semantic,
            raw_confidence: SEMANTIC_TEXT_RAW,
        };

        if let Some(role) = &descriptor.role {
            if let Some(name) = &descriptor.accessible_name {
                out.push(Candidate {
                    strategy_type: StrategyType::SemanticRole,
                    selector: None,
                    metadata: StrategyMetadata::SemanticRole {
                        role: role.clone(),
                        name: Some(name.clone()),
                    },
                    source: CandidateSource::Semantic,
                    raw_confidence: SEMANTIC_ROLE_RAW,
                });
            }
            out.push(Candidate {
                strategy_type: StrategyType::SemanticRole,
                selector: None,
                metadata: StrategyMetadata::SemanticRole {
                    role: role.clone(),
                    name: None,
                },
                source: CandidateSource::Semantic,
                raw_confidence: SEMANTIC_ROLE_RAW,
            });
        }
        if !descriptor.text.trim().is_empty() {
            out.push(text_candidate(descriptor.text.trim(), TextSource::Text));
        }
        if let Some(name) = &descriptor.accessible_name {
            if !name.trim().is_empty() && name.trim() != descriptor.text.trim() {
                out.push(text_candidate(name.trim(), TextSource::Label));
            }
        }
        if let Some(placeholder) = &descriptor.placeholder {
            if !placeholder.trim().is_empty() {
                out.push(text_candidate(placeholder.trim(), TextSource::Placeholder));
            }
        }
    }

    /// OCR candidate: matched against live OCR when present, otherwise
    /// estimated from the element's own text. For elements with no
    /// text of their own (canvas content), the OCR word under the
    /// click point stands in.
    fn vision_candidates(&self, bundle: &EvidenceBundle, out: &mut Vec<Candidate>) {
        let descriptor = &bundle.dom;
        let needle = {
            let text = descriptor.text.trim();
            if !text.is_empty() {
                Some(text.to_string())
            } else {
                descriptor
                    .accessible_name
                    .as_deref()
                    .map(str::trim)
                    .filter(|n| !n.is_empty())
                    .map(String::from)
            }
        };

        let live = bundle.vision.as_ref();
        let live_match = match (&needle, live) {
            (Some(needle), Some(vision)) => vision
                .results
                .iter()
                .find(|r| r.text.to_lowercase().contains(&needle.to_lowercase())),
            // No element text: the word painted under the click point.
            (None, Some(vision)) => vision
                .results
                .iter()
                .find(|r| r.bbox.contains(&descriptor.click_point)),
            (_, None) => None,
        };

        let metadata = match (live_match, needle) {
            (Some(result), _) => StrategyMetadata::OcrText {
                text: result.text.clone(),
                bbox: Some(result.bbox),
                ocr_confidence: Some(result.confidence),
            },
            (None, Some(needle)) => StrategyMetadata::OcrText {
                text: needle,
                bbox: Some(descriptor.bounding_rect),
                ocr_confidence: None,
            },
            (None, None) => return,
        };
        out.push(Candidate {
            strategy_type: StrategyType::OcrText,
            selector: None,
            metadata,
            source: CandidateSource::Vision,
            raw_confidence: StrategyType::OcrText.base_weight(),
        });
    }

    fn mouse_candidates(&self, bundle: &EvidenceBundle, out: &mut Vec<Candidate>) {
        let Some(mouse) = &bundle.mouse else {
            return;
        };
        let descriptor = &bundle.dom;
        let tail_start = mouse.points.len().saturating_sub(TRAIL_TAIL_LEN);
        out.push(Candidate {
            strategy_type: StrategyType::EvidenceScored,
            selector: None,
            metadata: StrategyMetadata::EvidenceScored {
                endpoint: mouse.summary.endpoint,
                pattern: mouse.summary.pattern,
                trail_tail: mouse.points[tail_start..].to_vec(),
                profile: AttributeProfile {
                    tag_name: descriptor.tag_name.clone(),
                    id: descriptor.id.clone(),
                    class_list: descriptor.class_list.clone(),
                },
            },
            source: CandidateSource::Mouse,
            raw_confidence: StrategyType::EvidenceScored.base_weight(),
        });
    }
}

impl Default for ChainGenerator {
    fn default() -> Self {
        Self::new(ScorerConfig::default(), ChainBuilderConfig::default())
    }
}
