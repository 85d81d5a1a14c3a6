//! Property tests for the pure chain machinery.

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use crate::chain::{
        normalized_similarity, Candidate, CandidateSource, ChainBuilder, ChainBuilderConfig,
        ElementContext, LocatorStrategy, ScorerConfig, StrategyMetadata, StrategyScorer,
        StrategyType, TextSource, UniqueSelectorKind,
    };
    use crate::geom::Point;

    fn candidate_strategy(
        pick: u8,
        selector_seed: String,
        confidence: f64,
    ) -> LocatorStrategy {
        match pick % 4 {
            0 => LocatorStrategy::new(
                StrategyType::SelectorUnique,
                Some(format!("#{selector_seed}")),
                StrategyMetadata::SelectorUnique {
                    kind: UniqueSelectorKind::Id,
                },
                confidence,
            ),
            1 => LocatorStrategy::new(
                StrategyType::SemanticText,
                None,
                StrategyMetadata::SemanticText {
                    text: selector_seed,
                    source: TextSource::Text,
                },
                confidence,
            ),
            2 => LocatorStrategy::new(
                StrategyType::OcrText,
                None,
                StrategyMetadata::OcrText {
                    text: selector_seed,
                    bbox: None,
                    ocr_confidence: None,
                },
                confidence,
            ),
            _ => LocatorStrategy::new(
                StrategyType::SelectorPath,
                Some(format!("main > div.{selector_seed}")),
                StrategyMetadata::SelectorPath {
                    syntax: crate::chain::PathSyntax::Css,
                },
                confidence,
            ),
        }
    }

    proptest! {
        /// Every built chain satisfies the chain invariants, whatever
        /// the candidate soup looked like.
        #[test]
        fn built_chain_always_valid(
            seeds in proptest::collection::vec((0u8..4, "[a-z]{1,8}", 0.0f64..1.0), 0..12)
        ) {
            let builder = ChainBuilder::new(ChainBuilderConfig::default());
            let candidates = seeds
                .into_iter()
                .map(|(pick, seed, conf)| candidate_strategy(pick, seed, conf))
                .collect();
            let result = builder.build(candidates, Point::new(10.0, 10.0)).unwrap();

            result.chain.validate().unwrap();
            prop_assert!(result.chain.contains_type(StrategyType::Coordinates));
            prop_assert!(result.chain.strategies.len() <= 7);
        }

        /// The scorer is a pure function: repeated calls agree, and
        /// the output stays in [0, 1].
        #[test]
        fn scorer_is_pure_and_bounded(
            raw in 0.0f64..1.0,
            text in "[a-zA-Z ]{1,20}",
            has_name in proptest::bool::ANY,
        ) {
            let scorer = StrategyScorer::new(ScorerConfig::default());
            let candidate = Candidate {
                strategy_type: StrategyType::SemanticText,
                selector: None,
                metadata: StrategyMetadata::SemanticText {
                    text,
                    source: TextSource::Text,
                },
                source: CandidateSource::Semantic,
                raw_confidence: raw,
            };
            let ctx = ElementContext {
                has_accessible_name: has_name,
                ..Default::default()
            };
            let first = scorer.score(&candidate, &ctx);
            prop_assert!((0.0..=1.0).contains(&first));
            for _ in 0..3 {
                prop_assert_eq!(scorer.score(&candidate, &ctx), first);
            }
        }

        /// Similarity is symmetric and bounded.
        #[test]
        fn similarity_symmetric(a in "[a-z#>. ]{0,20}", b in "[a-z#>. ]{0,20}") {
            let ab = normalized_similarity(&a, &b);
            let ba = normalized_similarity(&b, &a);
            prop_assert!((ab - ba).abs() < 1e-12);
            prop_assert!((0.0..=1.0).contains(&ab));
        }
    }
}
