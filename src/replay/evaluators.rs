//! Strategy evaluators: selector, semantic, OCR, and coordinates.
//!
//! Each evaluator resolves one strategy family against the live page
//! and reports `{found, confidence, node?, clickPoint?, duration}`.
//! The evidence-scored evaluator lives in its own module.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Instant;
use tracing::debug;

use super::{CancelToken, Evaluation, StrategyEvaluator};
use crate::ax::{AccessibilityView, NameMatch, RoleQuery};
use crate::capture::vision::VisionCaptureLayer;
use crate::chain::{
    normalized_similarity, LocatorStrategy, StrategyMetadata, StrategyType, TextSource,
};
use crate::geom::{Point, Rect};
use crate::transport::{PageClient, TargetId};

/// Evaluates selector strategies through the transport's DOM query.
pub struct SelectorEvaluator {
    client: PageClient,
}

impl SelectorEvaluator {
    pub fn new(client: PageClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl StrategyEvaluator for SelectorEvaluator {
    fn handles(&self) -> &'static [StrategyType] {
        &[StrategyType::SelectorUnique, StrategyType::SelectorPath]
    }

    async fn evaluate(
        &self,
        target: &TargetId,
        strategy: &LocatorStrategy,
        cancel: &CancelToken,
    ) -> Evaluation {
        let started = Instant::now();
        let kind = strategy.strategy_type;
        let Some(selector) = strategy.selector.as_deref() else {
            return Evaluation::failed(kind, "evaluator_error: strategy has no selector");
        };

        let nodes = match self.client.query_selector_all(target, selector).await {
            Ok(nodes) => nodes,
            Err(e) => {
                return Evaluation::failed(kind, e.kind())
                    .with_duration(started.elapsed().as_millis() as u64)
            }
        };
        if cancel.is_cancelled() || nodes.is_empty() {
            return Evaluation::miss(kind).with_duration(started.elapsed().as_millis() as u64);
        }

        let match_count = nodes.len();
        let rect = match self.client.box_model(target, nodes[0]).await {
            Ok(rect) => rect,
            Err(e) => {
                return Evaluation::failed(kind, e.kind())
                    .with_duration(started.elapsed().as_millis() as u64)
            }
        };
        // Ambiguity scales confidence down; the caller may reject.
        let confidence = strategy.confidence / match_count as f64;
        if match_count > 1 {
            debug!(selector, match_count, "ambiguous selector match");
        }
        let mut eval = Evaluation::hit(kind, confidence, Some(nodes[0]), rect.center());
        if match_count > 1 {
            eval.error = Some("ambiguous_match".into());
        }
        eval.with_duration(started.elapsed().as_millis() as u64)
    }
}

/// Evaluates semantic strategies through the accessibility view.
pub struct SemanticEvaluator {
    client: PageClient,
    ax: Arc<AccessibilityView>,
}

impl SemanticEvaluator {
    pub fn new(client: PageClient, ax: Arc<AccessibilityView>) -> Self {
        Self { client, ax }
    }

    async fn find(
        &self,
        target: &TargetId,
        strategy: &LocatorStrategy,
    ) -> crate::error::Result<Vec<crate::ax::AxMatch>> {
        match &strategy.metadata {
            StrategyMetadata::SemanticRole { role, name } => {
                let query = RoleQuery {
                    role: role.clone(),
                    name: match name {
                        Some(name) => NameMatch::Contains(name.clone()),
                        None => NameMatch::Any,
                    },
                    ..Default::default()
                };
                self.ax.find_by_role(target, &query).await
            }
            StrategyMetadata::SemanticText { text, source } => match source {
                TextSource::Label | TextSource::Placeholder => {
                    self.ax.find_by_label(target, text, false).await
                }
                TextSource::Text => self.ax.find_by_text(target, text, false).await,
            },
            _ => Ok(Vec::new()),
        }
    }
}

#[async_trait]
impl StrategyEvaluator for SemanticEvaluator {
    fn handles(&self) -> &'static [StrategyType] {
        &[StrategyType::SemanticRole, StrategyType::SemanticText]
    }

    async fn evaluate(
        &self,
        target: &TargetId,
        strategy: &LocatorStrategy,
        cancel: &CancelToken,
    ) -> Evaluation {
        let started = Instant::now();
        let kind = strategy.strategy_type;

        let mut matches = match self.find(target, strategy).await {
            Ok(matches) => matches,
            Err(e) => {
                return Evaluation::failed(kind, e.kind())
                    .with_duration(started.elapsed().as_millis() as u64)
            }
        };
        // The cached tree may predate a mutation; refresh once.
        if matches.is_empty() && !cancel.is_cancelled() {
            if self.ax.refresh(target).await.is_ok() {
                matches = self.find(target, strategy).await.unwrap_or_default();
            }
        }
        let Some(best) = matches.first() else {
            return Evaluation::miss(kind).with_duration(started.elapsed().as_millis() as u64);
        };

        let confidence = if matches.len() > 1 {
            best.confidence / matches.len() as f64
        } else {
            best.confidence
        };
        let rect = match self.client.box_model(target, best.node.node).await {
            Ok(rect) => rect,
            Err(e) => {
                return Evaluation::failed(kind, e.kind())
                    .with_duration(started.elapsed().as_millis() as u64)
            }
        };
        Evaluation::hit(kind, confidence, Some(best.node.node), rect.center())
            .with_duration(started.elapsed().as_millis() as u64)
    }
}

/// OCR evaluator configuration.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct OcrEvalConfig {
    /// Normalized Levenshtein similarity for the fuzzy rung
    pub fuzzy_threshold: f64,
    /// Distance within which the recorded bbox boosts confidence
    pub position_tolerance_px: f64,
}

impl Default for OcrEvalConfig {
    fn default() -> Self {
        Self {
            fuzzy_threshold: 0.8,
            position_tolerance_px: 100.0,
        }
    }
}

/// Evaluates OCR-text strategies against a live OCR pass.
pub struct OcrEvaluator {
    vision: Arc<VisionCaptureLayer>,
    config: OcrEvalConfig,
}

enum MatchRung {
    Exact,
    Contains,
    Variation,
    Fuzzy(f64),
}

impl MatchRung {
    fn quality(&self) -> f64 {
        match self {
            Self::Exact => 1.0,
            Self::Contains => 0.85,
            Self::Variation => 0.7,
            Self::Fuzzy(similarity) => 0.5 * similarity,
        }
    }
}

impl OcrEvaluator {
    pub fn new(vision: Arc<VisionCaptureLayer>, config: OcrEvalConfig) -> Self {
        Self { vision, config }
    }

    /// Try the match ladder: exact, contains, normalized variations,
    /// fuzzy Levenshtein.
    fn match_text(&self, recorded: &str, live: &str) -> Option<MatchRung> {
        if live == recorded {
            return Some(MatchRung::Exact);
        }
        let live_lower = live.to_lowercase();
        let recorded_lower = recorded.to_lowercase();
        if live_lower.contains(&recorded_lower) || recorded_lower.contains(&live_lower) {
            return Some(MatchRung::Contains);
        }
        if normalize_text(live) == normalize_text(recorded) {
            return Some(MatchRung::Variation);
        }
        let similarity = normalized_similarity(&recorded_lower, &live_lower);
        if similarity >= self.config.fuzzy_threshold {
            return Some(MatchRung::Fuzzy(similarity));
        }
        None
    }
}

/// Case, whitespace, and punctuation normalization: only lowercase
/// alphanumerics survive.
fn normalize_text(text: &str) -> String {
    text.chars()
        .filter(|c| c.is_alphanumeric())
        .flat_map(|c| c.to_lowercase())
        .collect()
}

#[async_trait]
impl StrategyEvaluator for OcrEvaluator {
    fn handles(&self) -> &'static [StrategyType] {
        &[StrategyType::OcrText]
    }

    async fn evaluate(
        &self,
        target: &TargetId,
        strategy: &LocatorStrategy,
        cancel: &CancelToken,
    ) -> Evaluation {
        let started = Instant::now();
        let kind = strategy.strategy_type;
        let StrategyMetadata::OcrText {
            text: recorded_text,
            bbox: recorded_bbox,
            ..
        } = &strategy.metadata
        else {
            return Evaluation::failed(kind, "evaluator_error: wrong metadata");
        };

        let live = match self.vision.capture(target).await {
            Ok(evidence) => evidence,
            Err(e) => {
                return Evaluation::failed(kind, e.kind())
                    .with_duration(started.elapsed().as_millis() as u64)
            }
        };
        if cancel.is_cancelled() {
            return Evaluation::miss(kind).with_duration(started.elapsed().as_millis() as u64);
        }
        // Empty live OCR is a miss, not an error.
        let best = live
            .results
            .iter()
            .filter_map(|r| self.match_text(recorded_text, &r.text).map(|rung| (r, rung)))
            .max_by(|(a, ra), (b, rb)| {
                (ra.quality() * a.confidence)
                    .partial_cmp(&(rb.quality() * b.confidence))
                    .unwrap_or(std::cmp::Ordering::Equal)
            });
        let Some((result, rung)) = best else {
            return Evaluation::miss(kind).with_duration(started.elapsed().as_millis() as u64);
        };

        let position_boost = match recorded_bbox {
            Some(recorded) => {
                let drift = recorded.center().distance_to(&result.bbox.center());
                if drift <= self.config.position_tolerance_px {
                    0.15
                } else {
                    0.0
                }
            }
            None => 0.0,
        };
        let f = ((result.confidence / 100.0) * rung.quality() + position_boost).clamp(0.0, 1.0);
        let confidence = 0.70 + 0.20 * f;
        Evaluation::hit(kind, confidence, None, result.bbox.center())
            .with_duration(started.elapsed().as_millis() as u64)
    }
}

/// Verifies the recorded coordinates still hit an interactable element.
pub struct CoordinatesEvaluator {
    client: PageClient,
}

impl CoordinatesEvaluator {
    pub fn new(client: PageClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl StrategyEvaluator for CoordinatesEvaluator {
    fn handles(&self) -> &'static [StrategyType] {
        &[StrategyType::Coordinates]
    }

    async fn evaluate(
        &self,
        target: &TargetId,
        strategy: &LocatorStrategy,
        _cancel: &CancelToken,
    ) -> Evaluation {
        let started = Instant::now();
        let kind = strategy.strategy_type;
        let StrategyMetadata::Coordinates { point } = &strategy.metadata else {
            return Evaluation::failed(kind, "evaluator_error: wrong metadata");
        };

        let metrics = match self.client.page_metrics(target).await {
            Ok(metrics) => metrics,
            Err(e) => {
                return Evaluation::failed(kind, e.kind())
                    .with_duration(started.elapsed().as_millis() as u64)
            }
        };
        let viewport = Rect::new(0.0, 0.0, metrics.viewport_width, metrics.viewport_height);
        if !viewport.contains(point) {
            return Evaluation::miss(kind).with_duration(started.elapsed().as_millis() as u64);
        }

        match self.client.node_at_point(target, *point).await {
            Ok(Some(node)) => Evaluation::hit(
                kind,
                StrategyType::Coordinates.base_weight(),
                node.node,
                *point,
            )
            .with_duration(started.elapsed().as_millis() as u64),
            Ok(None) => Evaluation::miss(kind).with_duration(started.elapsed().as_millis() as u64),
            Err(e) => Evaluation::failed(kind, e.kind())
                .with_duration(started.elapsed().as_millis() as u64),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ax::AxConfig;
    use crate::capture::vision::VisionConfig;
    use crate::chain::UniqueSelectorKind;
    use crate::ocr::FakeOcr;
    use crate::transport::fake::{FakeNode, FakeTransport};

    fn unique(selector: &str, confidence: f64) -> LocatorStrategy {
        LocatorStrategy::new(
            StrategyType::SelectorUnique,
            Some(selector.to_string()),
            StrategyMetadata::SelectorUnique {
                kind: UniqueSelectorKind::Id,
            },
            confidence,
        )
    }

    fn path(selector: &str, confidence: f64) -> LocatorStrategy {
        LocatorStrategy::new(
            StrategyType::SelectorPath,
            Some(selector.to_string()),
            StrategyMetadata::SelectorPath {
                syntax: crate::chain::PathSyntax::Css,
            },
            confidence,
        )
    }

    #[tokio::test]
    async fn test_selector_single_match() {
        let transport = Arc::new(FakeTransport::default());
        transport
            .page()
            .add_button("submit", "OK", Rect::new(10.0, 10.0, 80.0, 30.0));
        let evaluator = SelectorEvaluator::new(PageClient::new(transport));
        let target = TargetId::new("t1");

        let eval = evaluator
            .evaluate(&target, &unique("#submit", 0.85), &CancelToken::never())
            .await;
        assert!(eval.found);
        assert_eq!(eval.confidence, 0.85);
        assert_eq!(eval.click_point, Some(Point::new(50.0, 25.0)));
    }

    #[tokio::test]
    async fn test_selector_zero_matches_is_miss() {
        let transport = Arc::new(FakeTransport::default());
        let evaluator = SelectorEvaluator::new(PageClient::new(transport));
        let target = TargetId::new("t1");

        let eval = evaluator
            .evaluate(&target, &unique("#gone", 0.85), &CancelToken::never())
            .await;
        assert!(!eval.found);
        assert!(eval.error.is_none());
    }

    #[tokio::test]
    async fn test_selector_ambiguity_scales_confidence() {
        let transport = Arc::new(FakeTransport::default());
        transport
            .page()
            .add_node(FakeNode::new("div").with_class("row"));
        transport
            .page()
            .add_node(FakeNode::new("div").with_class("row"));
        let evaluator = SelectorEvaluator::new(PageClient::new(transport));
        let target = TargetId::new("t1");

        let eval = evaluator
            .evaluate(&target, &path("div.row", 0.75), &CancelToken::never())
            .await;
        assert!(eval.found);
        assert_eq!(eval.confidence, 0.375);
        assert_eq!(eval.error.as_deref(), Some("ambiguous_match"));
    }

    #[tokio::test]
    async fn test_semantic_survives_renamed_class() {
        let transport = Arc::new(FakeTransport::default());
        transport.page().add_node(
            FakeNode::new("button")
                .with_class("_y9k")
                .with_text("Sign in")
                .with_role("button", "Sign in")
                .with_rect(Rect::new(5.0, 5.0, 100.0, 30.0)),
        );
        let client = PageClient::new(transport);
        let ax = Arc::new(AccessibilityView::new(client.clone(), AxConfig::default()));
        let evaluator = SemanticEvaluator::new(client, ax);
        let target = TargetId::new("t1");

        let strategy = LocatorStrategy::new(
            StrategyType::SemanticRole,
            None,
            StrategyMetadata::SemanticRole {
                role: "button".into(),
                name: Some("Sign in".into()),
            },
            0.95,
        );
        let eval = evaluator
            .evaluate(&target, &strategy, &CancelToken::never())
            .await;
        assert!(eval.found);
        assert!(eval.confidence >= 0.90);
    }

    #[tokio::test]
    async fn test_semantic_refreshes_cache_once_on_miss() {
        let transport = Arc::new(FakeTransport::default());
        let client = PageClient::new(transport.clone());
        let ax = Arc::new(AccessibilityView::new(client.clone(), AxConfig::default()));
        // Warm the cache with an empty tree, then mutate the page.
        let target = TargetId::new("t1");
        ax.tree(&target).await.unwrap();
        transport
            .page()
            .add_button("late", "Confirm", Rect::new(0.0, 0.0, 60.0, 20.0));

        let evaluator = SemanticEvaluator::new(client, ax);
        let strategy = LocatorStrategy::new(
            StrategyType::SemanticRole,
            None,
            StrategyMetadata::SemanticRole {
                role: "button".into(),
                name: Some("Confirm".into()),
            },
            0.95,
        );
        let eval = evaluator
            .evaluate(&target, &strategy, &CancelToken::never())
            .await;
        assert!(eval.found, "forced refresh should see the mutation");
    }

    #[tokio::test]
    async fn test_ocr_match_with_position_boost() {
        let transport = Arc::new(FakeTransport::default());
        transport
            .page()
            .set_ocr_words(vec![("Start", Rect::new(305.0, 412.0, 60.0, 20.0), 90.0)]);
        let client = PageClient::new(transport);
        let vision = Arc::new(VisionCaptureLayer::new(
            client,
            Arc::new(FakeOcr),
            VisionConfig::default(),
        ));
        let evaluator = OcrEvaluator::new(vision, OcrEvalConfig::default());
        let target = TargetId::new("t1");

        let strategy = LocatorStrategy::new(
            StrategyType::OcrText,
            None,
            StrategyMetadata::OcrText {
                text: "Start".into(),
                bbox: Some(Rect::new(302.0, 408.0, 60.0, 20.0)),
                ocr_confidence: Some(91.0),
            },
            0.70,
        );
        let eval = evaluator
            .evaluate(&target, &strategy, &CancelToken::never())
            .await;
        assert!(eval.found);
        assert!(eval.confidence >= 0.78, "confidence {}", eval.confidence);
    }

    #[tokio::test]
    async fn test_ocr_empty_live_results_is_miss_not_error() {
        let transport = Arc::new(FakeTransport::default());
        let client = PageClient::new(transport);
        let vision = Arc::new(VisionCaptureLayer::new(
            client,
            Arc::new(FakeOcr),
            VisionConfig::default(),
        ));
        let evaluator = OcrEvaluator::new(vision, OcrEvalConfig::default());
        let target = TargetId::new("t1");

        let strategy = LocatorStrategy::new(
            StrategyType::OcrText,
            None,
            StrategyMetadata::OcrText {
                text: "Start".into(),
                bbox: None,
                ocr_confidence: None,
            },
            0.70,
        );
        let eval = evaluator
            .evaluate(&target, &strategy, &CancelToken::never())
            .await;
        assert!(!eval.found);
        assert!(eval.error.is_none());
    }

    #[tokio::test]
    async fn test_ocr_fuzzy_ladder() {
        let evaluator = OcrEvaluator::new(
            Arc::new(VisionCaptureLayer::new(
                PageClient::new(Arc::new(FakeTransport::default())),
                Arc::new(FakeOcr),
                VisionConfig::default(),
            )),
            OcrEvalConfig::default(),
        );
        assert!(matches!(
            evaluator.match_text("Start", "Start"),
            Some(MatchRung::Exact)
        ));
        assert!(matches!(
            evaluator.match_text("Start", "start now"),
            Some(MatchRung::Contains)
        ));
        assert!(matches!(
            evaluator.match_text("Sign-in!", "sign in"),
            Some(MatchRung::Variation)
        ));
        assert!(matches!(
            evaluator.match_text("Continue", "Continve"),
            Some(MatchRung::Fuzzy(_))
        ));
        assert!(evaluator.match_text("Start", "Cancel").is_none());
    }

    #[tokio::test]
    async fn test_coordinates_hit() {
        let transport = Arc::new(FakeTransport::default());
        transport
            .page()
            .add_button("ok", "OK", Rect::new(10.0, 10.0, 80.0, 30.0));
        let evaluator = CoordinatesEvaluator::new(PageClient::new(transport));
        let target = TargetId::new("t1");

        let strategy = LocatorStrategy::new(
            StrategyType::Coordinates,
            None,
            StrategyMetadata::Coordinates {
                point: Point::new(50.0, 25.0),
            },
            0.60,
        );
        let eval = evaluator
            .evaluate(&target, &strategy, &CancelToken::never())
            .await;
        assert!(eval.found);
        assert_eq!(eval.confidence, 0.60);
        assert!(eval.node.is_some());
    }

    #[tokio::test]
    async fn test_coordinates_off_viewport_is_miss_with_zero_confidence() {
        let transport = Arc::new(FakeTransport::default());
        let evaluator = CoordinatesEvaluator::new(PageClient::new(transport));
        let target = TargetId::new("t1");

        let strategy = LocatorStrategy::new(
            StrategyType::Coordinates,
            None,
            StrategyMetadata::Coordinates {
                point: Point::new(5_000.0, 5_000.0),
            },
            0.60,
        );
        let eval = evaluator
            .evaluate(&target, &strategy, &CancelToken::never())
            .await;
        assert!(!eval.found);
        assert_eq!(eval.confidence, 0.0);
    }
}
