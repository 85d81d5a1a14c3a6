//! Evidence-scored evaluator: grid probing around the recorded mouse
//! endpoint.
//!
//! Probes the page's node-at-point over a concentric-ring grid around
//! the recorded endpoint, then scores each distinct candidate by a
//! weighted sum of attribute agreement, position proximity, and
//! mouse-trail alignment. The recorded movement pattern biases the
//! alignment term: a deliberate approach amplifies it, a searching
//! one de-emphasizes it.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::f64::consts::TAU;
use std::time::Instant;
use tracing::debug;

use super::{CancelToken, Evaluation, StrategyEvaluator};
use crate::chain::{AttributeProfile, LocatorStrategy, StrategyMetadata, StrategyType};
use crate::evidence::{MousePattern, TrailPoint};
use crate::geom::Point;
use crate::transport::{NodeDescription, PageClient, TargetId};

/// Scoring weights for candidate comparison.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvidenceWeights {
    pub tag_match: f64,
    pub id_match: f64,
    pub class_overlap: f64,
    pub position: f64,
    pub trail_alignment: f64,
}

impl Default for EvidenceWeights {
    fn default() -> Self {
        Self {
            tag_match: 0.25,
            id_match: 0.20,
            class_overlap: 0.15,
            position: 0.20,
            trail_alignment: 0.20,
        }
    }
}

/// Evidence evaluator configuration. The grid geometry and weight
/// vector are uncalibrated defaults and deliberately overridable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvidenceEvalConfig {
    /// Outermost probe ring radius
    pub radius_px: f64,
    /// Number of concentric rings
    pub rings: u32,
    /// Probe points per ring
    pub points_per_ring: u32,
    pub weights: EvidenceWeights,
    /// Candidates scoring below this are rejected
    pub min_score: f64,
}

impl Default for EvidenceEvalConfig {
    fn default() -> Self {
        Self {
            radius_px: 50.0,
            rings: 3,
            points_per_ring: 8,
            weights: EvidenceWeights::default(),
            min_score: 0.4,
        }
    }
}

/// Probes and scores candidates around the recorded endpoint.
pub struct EvidenceEvaluator {
    client: PageClient,
    config: EvidenceEvalConfig,
}

impl EvidenceEvaluator {
    pub fn new(client: PageClient, config: EvidenceEvalConfig) -> Self {
        Self { client, config }
    }

    /// The endpoint itself plus `rings` concentric rings of probes.
    fn probe_points(&self, endpoint: Point) -> Vec<Point> {
        let mut points = vec![endpoint];
        for ring in 1..=self.config.rings {
            let radius = self.config.radius_px * ring as f64 / self.config.rings as f64;
            for step in 0..self.config.points_per_ring {
                let angle = TAU * step as f64 / self.config.points_per_ring as f64;
                points.push(Point::new(
                    endpoint.x + radius * angle.cos(),
                    endpoint.y + radius * angle.sin(),
                ));
            }
        }
        points
    }

    fn score(
        &self,
        candidate: &NodeDescription,
        profile: &AttributeProfile,
        endpoint: Point,
        trail_tail: &[TrailPoint],
        pattern: MousePattern,
    ) -> f64 {
        let weights = &self.config.weights;
        let mut score = 0.0;

        if candidate.tag_name.eq_ignore_ascii_case(&profile.tag_name) {
            score += weights.tag_match;
        }
        if candidate.id.is_some() && candidate.id == profile.id {
            score += weights.id_match;
        }
        score += weights.class_overlap * class_overlap(&candidate.class_list, &profile.class_list);

        let center = candidate
            .rect
            .map(|r| r.center())
            .unwrap_or(endpoint);
        let proximity = 1.0 - (endpoint.distance_to(&center) / self.config.radius_px).min(1.0);
        score += weights.position * proximity;

        score += weights.trail_alignment * trail_alignment(trail_tail, center, pattern);
        score
    }
}

/// Overlap of recorded and live class lists, relative to the larger.
fn class_overlap(live: &[String], recorded: &[String]) -> f64 {
    if live.is_empty() && recorded.is_empty() {
        return 1.0;
    }
    let larger = live.len().max(recorded.len());
    if larger == 0 {
        return 1.0;
    }
    let shared = recorded.iter().filter(|c| live.contains(c)).count();
    shared as f64 / larger as f64
}

/// Cosine of the last trail segment's direction against the vector
/// from the last point to the candidate center, rescaled to [0, 1]
/// and biased by the recorded movement pattern.
fn trail_alignment(trail_tail: &[TrailPoint], center: Point, pattern: MousePattern) -> f64 {
    if trail_tail.len() < 2 {
        return 0.5;
    }
    let last = trail_tail[trail_tail.len() - 1];
    let previous = trail_tail[trail_tail.len() - 2];
    let segment = (last.x - previous.x, last.y - previous.y);
    let to_candidate = (center.x - last.x, center.y - last.y);
    let seg_mag = (segment.0 * segment.0 + segment.1 * segment.1).sqrt();
    let cand_mag = (to_candidate.0 * to_candidate.0 + to_candidate.1 * to_candidate.1).sqrt();
    if seg_mag == 0.0 || cand_mag == 0.0 {
        return 0.5;
    }
    let cosine = (segment.0 * to_candidate.0 + segment.1 * to_candidate.1) / (seg_mag * cand_mag);
    let rescaled = (cosine + 1.0) / 2.0;
    let bias = match pattern {
        MousePattern::Direct => 1.15,
        MousePattern::Searching => 0.6,
        _ => 1.0,
    };
    (rescaled * bias).clamp(0.0, 1.0)
}

#[async_trait]
impl StrategyEvaluator for EvidenceEvaluator {
    fn handles(&self) -> &'static [StrategyType] {
        &[StrategyType::EvidenceScored]
    }

    async fn evaluate(
        &self,
        target: &TargetId,
        strategy: &LocatorStrategy,
        cancel: &CancelToken,
    ) -> Evaluation {
        let started = Instant::now();
        let kind = strategy.strategy_type;
        let StrategyMetadata::EvidenceScored {
            endpoint,
            pattern,
            trail_tail,
            profile,
        } = &strategy.metadata
        else {
            return Evaluation::failed(kind, "evaluator_error: wrong metadata");
        };

        let mut candidates: HashMap<i64, NodeDescription> = HashMap::new();
        for probe in self.probe_points(*endpoint) {
            if cancel.is_cancelled() {
                break;
            }
            match self.client.node_at_point(target, probe).await {
                Ok(Some(node)) => {
                    if let Some(id) = node.node {
                        candidates.entry(id.0).or_insert(node);
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    return Evaluation::failed(kind, e.kind())
                        .with_duration(started.elapsed().as_millis() as u64)
                }
            }
        }
        if candidates.is_empty() {
            return Evaluation::miss(kind).with_duration(started.elapsed().as_millis() as u64);
        }

        let best = candidates
            .values()
            .map(|candidate| {
                let score = self.score(candidate, profile, *endpoint, trail_tail, *pattern);
                (candidate, score)
            })
            .max_by(|(_, a), (_, b)| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        let Some((candidate, score)) = best else {
            return Evaluation::miss(kind).with_duration(started.elapsed().as_millis() as u64);
        };
        debug!(
            candidates = candidates.len(),
            score, "evidence grid probe complete"
        );
        if score < self.config.min_score {
            return Evaluation::miss(kind).with_duration(started.elapsed().as_millis() as u64);
        }

        let click_point = candidate
            .rect
            .map(|r| r.center())
            .unwrap_or(*endpoint);
        Evaluation::hit(kind, score, candidate.node, click_point)
            .with_duration(started.elapsed().as_millis() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geom::Rect;
    use crate::transport::fake::{FakeNode, FakeTransport};
    use std::sync::Arc;

    fn strategy(endpoint: Point, profile: AttributeProfile, pattern: MousePattern) -> LocatorStrategy {
        let trail_tail = vec![
            TrailPoint::new(endpoint.x - 40.0, endpoint.y, 0.0),
            TrailPoint::new(endpoint.x - 10.0, endpoint.y, 60.0),
        ];
        LocatorStrategy::new(
            StrategyType::EvidenceScored,
            None,
            StrategyMetadata::EvidenceScored {
                endpoint,
                pattern,
                trail_tail,
                profile,
            },
            0.80,
        )
    }

    #[test]
    fn test_probe_grid_shape() {
        let evaluator = EvidenceEvaluator::new(
            PageClient::new(Arc::new(FakeTransport::default())),
            EvidenceEvalConfig::default(),
        );
        let points = evaluator.probe_points(Point::new(100.0, 100.0));
        // Endpoint plus 3 rings of 8.
        assert_eq!(points.len(), 25);
        // Outermost ring sits at the configured radius.
        let max_dist = points
            .iter()
            .map(|p| p.distance_to(&Point::new(100.0, 100.0)))
            .fold(0.0, f64::max);
        assert!((max_dist - 50.0).abs() < 1e-6);
    }

    #[test]
    fn test_trail_alignment_biases() {
        let tail = vec![
            TrailPoint::new(0.0, 0.0, 0.0),
            TrailPoint::new(10.0, 0.0, 50.0),
        ];
        // Candidate dead ahead: cosine 1, rescaled 1.
        let ahead = trail_alignment(&tail, Point::new(30.0, 0.0), MousePattern::Unknown);
        assert!((ahead - 1.0).abs() < 1e-9);
        // Behind: cosine -1, rescaled 0.
        let behind = trail_alignment(&tail, Point::new(-30.0, 0.0), MousePattern::Unknown);
        assert!(behind.abs() < 1e-9);
        // Searching de-emphasizes alignment.
        let searching = trail_alignment(&tail, Point::new(30.0, 0.0), MousePattern::Searching);
        assert!((searching - 0.6).abs() < 1e-9);
        // Short tails are neutral.
        assert_eq!(trail_alignment(&tail[..1], Point::new(5.0, 5.0), MousePattern::Direct), 0.5);
    }

    #[test]
    fn test_class_overlap_ratio() {
        let recorded = vec!["row".to_string(), "selected".to_string()];
        assert_eq!(class_overlap(&["row".to_string()], &recorded), 0.5);
        assert_eq!(class_overlap(&recorded.clone(), &recorded), 1.0);
        assert_eq!(class_overlap(&[], &recorded), 0.0);
        assert_eq!(class_overlap(&[], &[]), 1.0);
    }

    #[tokio::test]
    async fn test_finds_matching_candidate_near_endpoint() {
        let transport = Arc::new(FakeTransport::default());
        transport.page().add_node(
            FakeNode::new("div")
                .with_class("row")
                .with_rect(Rect::new(0.0, 0.0, 200.0, 30.0)),
        );
        let target_node = transport.page().add_node(
            FakeNode::new("div")
                .with_class("row")
                .with_rect(Rect::new(0.0, 40.0, 200.0, 30.0)),
        );
        let evaluator = EvidenceEvaluator::new(
            PageClient::new(transport),
            EvidenceEvalConfig::default(),
        );

        // The recorded endpoint sits on the second row.
        let eval = evaluator
            .evaluate(
                &TargetId::new("t1"),
                &strategy(
                    Point::new(100.0, 55.0),
                    AttributeProfile {
                        tag_name: "div".into(),
                        id: None,
                        class_list: vec!["row".into()],
                    },
                    MousePattern::Direct,
                ),
                &CancelToken::never(),
            )
            .await;

        assert!(eval.found);
        assert_eq!(eval.node, Some(crate::transport::NodeRef(target_node)));
        assert!(eval.confidence >= 0.4);
    }

    #[tokio::test]
    async fn test_empty_area_is_miss() {
        let transport = Arc::new(FakeTransport::default());
        let evaluator = EvidenceEvaluator::new(
            PageClient::new(transport),
            EvidenceEvalConfig::default(),
        );

        let eval = evaluator
            .evaluate(
                &TargetId::new("t1"),
                &strategy(
                    Point::new(400.0, 400.0),
                    AttributeProfile::default(),
                    MousePattern::Unknown,
                ),
                &CancelToken::never(),
            )
            .await;
        assert!(!eval.found);
        assert!(eval.error.is_none());
    }

    #[tokio::test]
    async fn test_low_scoring_candidate_rejected() {
        let transport = Arc::new(FakeTransport::default());
        // A node that shares nothing with the recorded profile, well
        // away from the endpoint but inside the outer ring.
        transport.page().add_node(
            FakeNode::new("img")
                .with_class("banner")
                .with_rect(Rect::new(140.0, 95.0, 20.0, 10.0)),
        );
        let evaluator = EvidenceEvaluator::new(
            PageClient::new(transport),
            EvidenceEvalConfig::default(),
        );

        let eval = evaluator
            .evaluate(
                &TargetId::new("t1"),
                &strategy(
                    Point::new(100.0, 100.0),
                    AttributeProfile {
                        tag_name: "button".into(),
                        id: Some("save".into()),
                        class_list: vec!["primary".into()],
                    },
                    MousePattern::Searching,
                ),
                &CancelToken::never(),
            )
            .await;
        assert!(!eval.found);
    }
}
