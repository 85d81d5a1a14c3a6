//! Fallback-chain data model: strategy families, typed metadata, and
//! the chain container with its invariants.
//!
//! A chain is an ordered list of locator strategies recorded with an
//! action and replayed top to bottom. Invariants enforced here:
//! descending confidence, unique dedupe keys, bounded length, and the
//! "at least one strong strategy or a coordinates fallback" rule.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::evidence::{MousePattern, TrailPoint};
use crate::geom::{Point, Rect};

mod builder;
mod generator;
#[cfg(test)]
mod proptest;
mod scorer;

pub use builder::{
    normalized_similarity, ChainBuildResult, ChainBuilder, ChainBuilderConfig, RejectReason,
    RejectedCandidate,
};
pub use generator::ChainGenerator;
pub use scorer::{
    filter_stable_classes, is_dynamic_class, score_candidate, Candidate, CandidateSource,
    ElementContext, ScorerConfig, StrategyScorer,
};

/// Maximum number of strategies a chain may carry.
pub const MAX_CHAIN_LENGTH: usize = 7;

/// Confidence at which a chain needs no coordinates fallback.
pub const STRONG_CONFIDENCE: f64 = 0.7;

/// The closed set of locator strategy families.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyType {
    SemanticRole,
    SemanticText,
    SelectorUnique,
    EvidenceScored,
    SelectorPath,
    OcrText,
    Coordinates,
}

impl StrategyType {
    /// All families, strongest base weight first.
    pub const ALL: [StrategyType; 7] = [
        Self::SemanticRole,
        Self::SemanticText,
        Self::SelectorUnique,
        Self::EvidenceScored,
        Self::SelectorPath,
        Self::OcrText,
        Self::Coordinates,
    ];

    /// Fixed base weight of the family, applied at decision time.
    pub fn base_weight(&self) -> f64 {
        match self {
            Self::SemanticRole => 0.95,
            Self::SemanticText => 0.90,
            Self::SelectorUnique => 0.85,
            Self::EvidenceScored => 0.80,
            Self::SelectorPath => 0.75,
            Self::OcrText => 0.70,
            Self::Coordinates => 0.60,
        }
    }

    /// Diversity category the family belongs to.
    pub fn category(&self) -> StrategyCategory {
        match self {
            Self::SemanticRole | Self::SemanticText => StrategyCategory::Semantic,
            Self::SelectorUnique | Self::SelectorPath => StrategyCategory::Selector,
            Self::OcrText => StrategyCategory::Vision,
            Self::EvidenceScored => StrategyCategory::Evidence,
            Self::Coordinates => StrategyCategory::Coordinates,
        }
    }
}

impl std::fmt::Display for StrategyType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::SemanticRole => "semantic_role",
            Self::SemanticText => "semantic_text",
            Self::SelectorUnique => "selector_unique",
            Self::EvidenceScored => "evidence_scored",
            Self::SelectorPath => "selector_path",
            Self::OcrText => "ocr_text",
            Self::Coordinates => "coordinates",
        };
        write!(f, "{s}")
    }
}

/// Diversity categories used by the chain builder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StrategyCategory {
    Semantic,
    Selector,
    Vision,
    Evidence,
    Coordinates,
}

impl StrategyCategory {
    pub const ALL: [StrategyCategory; 5] = [
        Self::Semantic,
        Self::Selector,
        Self::Vision,
        Self::Evidence,
        Self::Coordinates,
    ];
}

/// Syntax of a path selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PathSyntax {
    Css,
    Xpath,
}

/// What made a unique selector unique.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UniqueSelectorKind {
    Id,
    TestId,
    Name,
    Css,
}

/// Where a semantic text came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TextSource {
    Label,
    Text,
    Placeholder,
}

/// Attribute profile of the recorded element, carried by the
/// evidence-scored strategy for replay-time comparison.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttributeProfile {
    pub tag_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub class_list: Vec<String>,
}

/// Type-specific strategy payload.
///
/// The variant must match the strategy's declared type; the pairing is
/// validated at every chain boundary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StrategyMetadata {
    SemanticRole {
        role: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        name: Option<String>,
    },
    SemanticText {
        text: String,
        source: TextSource,
    },
    SelectorUnique {
        #[serde(rename = "selector_kind")]
        kind: UniqueSelectorKind,
    },
    SelectorPath {
        syntax: PathSyntax,
    },
    EvidenceScored {
        endpoint: Point,
        pattern: MousePattern,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        trail_tail: Vec<TrailPoint>,
        profile: AttributeProfile,
    },
    OcrText {
        text: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        bbox: Option<Rect>,
        #[serde(skip_serializing_if = "Option::is_none")]
        ocr_confidence: Option<f64>,
    },
    Coordinates {
        point: Point,
    },
}

impl StrategyMetadata {
    /// The strategy type this payload shape belongs to.
    pub fn expected_type(&self) -> StrategyType {
        match self {
            Self::SemanticRole { .. } => StrategyType::SemanticRole,
            Self::SemanticText { .. } => StrategyType::SemanticText,
            Self::SelectorUnique { .. } => StrategyType::SelectorUnique,
            Self::SelectorPath { .. } => StrategyType::SelectorPath,
            Self::EvidenceScored { .. } => StrategyType::EvidenceScored,
            Self::OcrText { .. } => StrategyType::OcrText,
            Self::Coordinates { .. } => StrategyType::Coordinates,
        }
    }
}

/// One locator strategy in a fallback chain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocatorStrategy {
    #[serde(rename = "type")]
    pub strategy_type: StrategyType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub selector: Option<String>,
    pub metadata: StrategyMetadata,
    /// Final confidence in [0, 1]
    pub confidence: f64,
}

impl LocatorStrategy {
    pub fn new(
        strategy_type: StrategyType,
        selector: Option<String>,
        metadata: StrategyMetadata,
        confidence: f64,
    ) -> Self {
        Self {
            strategy_type,
            selector,
            metadata,
            confidence: confidence.clamp(0.0, 1.0),
        }
    }

    /// Check the metadata shape against the declared type.
    pub fn validate(&self) -> Result<()> {
        if self.metadata.expected_type() != self.strategy_type {
            return Err(Error::Config(format!(
                "metadata shape {:?} does not match strategy type {}",
                self.metadata.expected_type(),
                self.strategy_type
            )));
        }
        if !(0.0..=1.0).contains(&self.confidence) {
            return Err(Error::Config(format!(
                "confidence {} outside [0, 1]",
                self.confidence
            )));
        }
        Ok(())
    }

    /// Dedupe key: type plus selector, or the stringified metadata for
    /// strategies that carry no selector.
    pub fn candidate_key(&self) -> String {
        match &self.selector {
            Some(selector) => format!("{}:{selector}", self.strategy_type),
            None => format!(
                "{}:{}",
                self.strategy_type,
                serde_json::to_string(&self.metadata).unwrap_or_default()
            ),
        }
    }
}

/// Ordered strategies recorded with one action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FallbackChain {
    pub strategies: Vec<LocatorStrategy>,
    pub primary_strategy_type: StrategyType,
    pub recorded_at: DateTime<Utc>,
}

impl FallbackChain {
    /// Build a chain from strategies already sorted by the builder.
    ///
    /// Validates every chain invariant; the first strategy becomes the
    /// primary.
    pub fn new(strategies: Vec<LocatorStrategy>) -> Result<Self> {
        let primary = strategies
            .first()
            .map(|s| s.strategy_type)
            .ok_or_else(|| Error::Config("fallback chain cannot be empty".into()))?;
        let chain = Self {
            strategies,
            primary_strategy_type: primary,
            recorded_at: Utc::now(),
        };
        chain.validate()?;
        Ok(chain)
    }

    /// Revalidate every invariant; called at chain boundaries
    /// (construction, deserialized input to the decision engine).
    pub fn validate(&self) -> Result<()> {
        if self.strategies.is_empty() {
            return Err(Error::Config("fallback chain cannot be empty".into()));
        }
        if self.strategies.len() > MAX_CHAIN_LENGTH {
            return Err(Error::Config(format!(
                "chain length {} exceeds {MAX_CHAIN_LENGTH}",
                self.strategies.len()
            )));
        }
        let has_coordinates = self.contains_type(StrategyType::Coordinates);
        if self.strategies.len() < 2 && !has_coordinates {
            return Err(Error::Config(
                "chain needs at least 2 strategies or a coordinates fallback".into(),
            ));
        }
        let has_strong = self
            .strategies
            .iter()
            .any(|s| s.confidence >= STRONG_CONFIDENCE);
        if !has_strong && !has_coordinates {
            return Err(Error::Config(
                "chain needs a strategy at confidence >= 0.7 or a coordinates fallback".into(),
            ));
        }
        for pair in self.strategies.windows(2) {
            if pair[0].confidence < pair[1].confidence {
                return Err(Error::Config(
                    "chain strategies must be sorted by descending confidence".into(),
                ));
            }
        }
        let mut keys = std::collections::HashSet::new();
        for strategy in &self.strategies {
            strategy.validate()?;
            if !keys.insert(strategy.candidate_key()) {
                return Err(Error::Config(format!(
                    "duplicate candidate key {}",
                    strategy.candidate_key()
                )));
            }
        }
        if self.primary_strategy_type != self.strategies[0].strategy_type {
            return Err(Error::Config(
                "primary strategy type must match the first strategy".into(),
            ));
        }
        Ok(())
    }

    pub fn contains_type(&self, strategy_type: StrategyType) -> bool {
        self.strategies
            .iter()
            .any(|s| s.strategy_type == strategy_type)
    }

    /// Number of distinct diversity categories present.
    pub fn category_count(&self) -> usize {
        self.strategies
            .iter()
            .map(|s| s.strategy_type.category())
            .collect::<std::collections::HashSet<_>>()
            .len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn coords(confidence: f64) -> LocatorStrategy {
        LocatorStrategy::new(
            StrategyType::Coordinates,
            None,
            StrategyMetadata::Coordinates {
                point: Point::new(10.0, 20.0),
            },
            confidence,
        )
    }

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

    #[test]
    fn test_base_weights_descend_with_table() {
        assert_eq!(StrategyType::SemanticRole.base_weight(), 0.95);
        assert_eq!(StrategyType::Coordinates.base_weight(), 0.60);
        let weights: Vec<f64> = StrategyType::ALL.iter().map(|t| t.base_weight()).collect();
        let mut sorted = weights.clone();
        sorted.sort_by(|a, b| b.partial_cmp(a).unwrap());
        assert_eq!(weights, sorted);
    }

    #[test]
    fn test_metadata_type_mismatch_rejected() {
        let bad = LocatorStrategy::new(
            StrategyType::SemanticRole,
            None,
            StrategyMetadata::Coordinates {
                point: Point::new(0.0, 0.0),
            },
            0.9,
        );
        assert!(bad.validate().is_err());
    }

    #[test]
    fn test_single_coordinates_chain_is_valid() {
        let chain = FallbackChain::new(vec![coords(0.6)]).unwrap();
        assert_eq!(chain.primary_strategy_type, StrategyType::Coordinates);
    }

    #[test]
    fn test_single_non_coordinates_chain_is_invalid() {
        assert!(FallbackChain::new(vec![unique("#a", 0.9)]).is_err());
    }

    #[test]
    fn test_weak_chain_without_coordinates_is_invalid() {
        let weak = vec![
            LocatorStrategy::new(
                StrategyType::OcrText,
                None,
                StrategyMetadata::OcrText {
                    text: "a".into(),
                    bbox: None,
                    ocr_confidence: None,
                },
                0.5,
            ),
            LocatorStrategy::new(
                StrategyType::SelectorPath,
                Some("div > p".into()),
                StrategyMetadata::SelectorPath {
                    syntax: PathSyntax::Css,
                },
                0.4,
            ),
        ];
        assert!(FallbackChain::new(weak).is_err());
    }

    #[test]
    fn test_out_of_order_confidence_rejected() {
        let strategies = vec![coords(0.6), unique("#a", 0.9)];
        assert!(FallbackChain::new(strategies).is_err());
    }

    #[test]
    fn test_duplicate_keys_rejected() {
        let strategies = vec![unique("#a", 0.9), unique("#a", 0.8), coords(0.6)];
        assert!(FallbackChain::new(strategies).is_err());
    }

    #[test]
    fn test_chain_round_trips_through_json() {
        let chain = FallbackChain::new(vec![unique("#submit", 0.85), coords(0.6)]).unwrap();
        let json = serde_json::to_string(&chain).unwrap();
        let back: FallbackChain = serde_json::from_str(&json).unwrap();
        back.validate().unwrap();
        assert_eq!(back, chain);
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["primaryStrategyType"], "selector_unique");
        assert_eq!(value["strategies"][0]["type"], "selector_unique");
    }

    #[test]
    fn test_category_count() {
        let chain = FallbackChain::new(vec![unique("#submit", 0.85), coords(0.6)]).unwrap();
        assert_eq!(chain.category_count(), 2);
    }
}
