//! Chain builder: scored candidates to a final fallback chain.
//!
//! Dedupes exact and near-identical candidates, orders by caller
//! priority then confidence, enforces category diversity and the
//! coordinates fallback, and reports every rejection with a reason.

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{
    FallbackChain, LocatorStrategy, StrategyCategory, StrategyMetadata, StrategyType,
};
use crate::error::Result;
use crate::geom::Point;

/// Chain builder configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainBuilderConfig {
    /// Candidates below this confidence are rejected
    pub min_candidate_confidence: f64,
    /// Hard cap on chain length
    pub max_strategies: usize,
    /// Minimum distinct diversity categories
    pub min_diverse_types: usize,
    /// Normalized Levenshtein similarity at which two selectors collapse
    pub similarity_threshold: f64,
    /// Guarantee a coordinates strategy in every chain
    pub always_include_coordinates: bool,
    /// Caller-preferred types, ordered; they sort ahead of the rest
    pub preferred_types: Vec<StrategyType>,
    /// Types that must appear when a candidate for them exists
    pub required_types: Vec<StrategyType>,
}

impl Default for ChainBuilderConfig {
    fn default() -> Self {
        Self {
            min_candidate_confidence: 0.3,
            max_strategies: 7,
            min_diverse_types: 3,
            similarity_threshold: 0.9,
            always_include_coordinates: true,
            preferred_types: Vec::new(),
            required_types: Vec::new(),
        }
    }
}

/// Why a candidate did not make the chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    Duplicate,
    Similar,
    LowConfidence,
    Capacity,
    TypeCovered,
    Invalid,
}

/// A rejected candidate with its reason, for observability.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RejectedCandidate {
    pub strategy: LocatorStrategy,
    pub reason: RejectReason,
}

/// Output of a build: the chain plus every rejection.
#[derive(Debug, Clone)]
pub struct ChainBuildResult {
    pub chain: FallbackChain,
    pub rejected: Vec<RejectedCandidate>,
}

/// Builds fallback chains from scored candidates.
#[derive(Debug, Clone, Default)]
pub struct ChainBuilder {
    config: ChainBuilderConfig,
}

impl ChainBuilder {
    pub fn new(config: ChainBuilderConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ChainBuilderConfig {
        &self.config
    }

    /// Build a chain.
    ///
    /// `fallback_point` seeds a synthesized coordinates strategy when
    /// the policy requires one and no candidate supplies it.
    pub fn build(
        &self,
        candidates: Vec<LocatorStrategy>,
        fallback_point: Point,
    ) -> Result<ChainBuildResult> {
        let mut rejected = Vec::new();
        let mut pool = Vec::new();

        for candidate in candidates {
            if candidate.validate().is_err() {
                rejected.push(RejectedCandidate {
                    strategy: candidate,
                    reason: RejectReason::Invalid,
                });
                continue;
            }
            let exempt = candidate.strategy_type == StrategyType::Coordinates
                && self.config.always_include_coordinates;
            if candidate.confidence < self.config.min_candidate_confidence && !exempt {
                rejected.push(RejectedCandidate {
                    strategy: candidate,
                    reason: RejectReason::LowConfidence,
                });
                continue;
            }
            pool.push(candidate);
        }

        self.dedupe_exact(&mut pool, &mut rejected);
        self.dedupe_similar(&mut pool, &mut rejected);
        self.order_by_priority(&mut pool);

        let mut selected: Vec<LocatorStrategy> = Vec::new();
        let mut leftovers: Vec<LocatorStrategy> = Vec::new();
        for candidate in pool {
            if selected.len() < self.config.max_strategies {
                selected.push(candidate);
            } else {
                leftovers.push(candidate);
            }
        }

        self.enforce_diversity(&mut selected, &mut leftovers, &mut rejected);
        self.enforce_required(&mut selected, &mut leftovers, &mut rejected);
        if self.config.always_include_coordinates {
            self.enforce_coordinates(&mut selected, &mut leftovers, &mut rejected, fallback_point);
        }
        for candidate in leftovers {
            rejected.push(RejectedCandidate {
                strategy: candidate,
                reason: RejectReason::Capacity,
            });
        }

        selected.sort_by(|a, b| {
            b.confidence
                .partial_cmp(&a.confidence)
                .unwrap_or(std::cmp::Ordering::Equal)
        });

        debug!(
            selected = selected.len(),
            rejected = rejected.len(),
            "built fallback chain"
        );
        let chain = FallbackChain::new(selected)?;
        Ok(ChainBuildResult { chain, rejected })
    }

    /// Keep the higher-confidence candidate per dedupe key.
    fn dedupe_exact(&self, pool: &mut Vec<LocatorStrategy>, rejected: &mut Vec<RejectedCandidate>) {
        let mut best: std::collections::HashMap<String, usize> = std::collections::HashMap::new();
        let mut losers = Vec::new();
        for (idx, candidate) in pool.iter().enumerate() {
            let key = candidate.candidate_key();
            match best.get(&key) {
                Some(&winner) if pool[winner].confidence >= candidate.confidence => {
                    losers.push(idx);
                }
                Some(&winner) => {
                    losers.push(winner);
                    best.insert(key, idx);
                }
                None => {
                    best.insert(key, idx);
                }
            }
        }
        losers.sort_unstable();
        for idx in losers.into_iter().rev() {
            rejected.push(RejectedCandidate {
                strategy: pool.remove(idx),
                reason: RejectReason::Duplicate,
            });
        }
    }

    /// Collapse near-identical selector strings.
    fn dedupe_similar(
        &self,
        pool: &mut Vec<LocatorStrategy>,
        rejected: &mut Vec<RejectedCandidate>,
    ) {
        let mut losers: Vec<usize> = Vec::new();
        for i in 0..pool.len() {
            if losers.contains(&i) {
                continue;
            }
            let Some(a) = pool[i].selector.clone() else {
                continue;
            };
            for j in (i + 1)..pool.len() {
                if losers.contains(&j) {
                    continue;
                }
                let Some(b) = pool[j].selector.as_deref() else {
                    continue;
                };
                if normalized_similarity(&a, b) >= self.config.similarity_threshold {
                    let loser = if pool[i].confidence >= pool[j].confidence {
                        j
                    } else {
                        i
                    };
                    losers.push(loser);
                    if loser == i {
                        break;
                    }
                }
            }
        }
        losers.sort_unstable();
        losers.dedup();
        for idx in losers.into_iter().rev() {
            rejected.push(RejectedCandidate {
                strategy: pool.remove(idx),
                reason: RejectReason::Similar,
            });
        }
    }

    /// Preferred types first, then descending confidence.
    fn order_by_priority(&self, pool: &mut [LocatorStrategy]) {
        let rank = |t: StrategyType| {
            self.config
                .preferred_types
                .iter()
                .position(|p| *p == t)
                .unwrap_or(usize::MAX)
        };
        pool.sort_by(|a, b| {
            rank(a.strategy_type)
                .cmp(&rank(b.strategy_type))
                .then_with(|| {
                    b.confidence
                        .partial_cmp(&a.confidence)
                        .unwrap_or(std::cmp::Ordering::Equal)
                })
        });
    }

    /// Promote candidates from missing categories until diverse enough.
    fn enforce_diversity(
        &self,
        selected: &mut Vec<LocatorStrategy>,
        leftovers: &mut Vec<LocatorStrategy>,
        rejected: &mut Vec<RejectedCandidate>,
    ) {
        for category in StrategyCategory::ALL {
            let covered: std::collections::HashSet<StrategyCategory> = selected
                .iter()
                .map(|s| s.strategy_type.category())
                .collect();
            if covered.len() >= self.config.min_diverse_types {
                return;
            }
            if covered.contains(&category) {
                continue;
            }
            let Some(pos) = best_of(leftovers, |s| s.strategy_type.category() == category) else {
                continue;
            };
            let promoted = leftovers.remove(pos);
            self.make_room(selected, rejected);
            if selected.len() < self.config.max_strategies {
                selected.push(promoted);
            } else {
                leftovers.push(promoted);
            }
        }
    }

    /// Promote caller-required types that have a surviving candidate.
    fn enforce_required(
        &self,
        selected: &mut Vec<LocatorStrategy>,
        leftovers: &mut Vec<LocatorStrategy>,
        rejected: &mut Vec<RejectedCandidate>,
    ) {
        for required in self.config.required_types.clone() {
            if selected.iter().any(|s| s.strategy_type == required) {
                continue;
            }
            let Some(pos) = best_of(leftovers, |s| s.strategy_type == required) else {
                continue;
            };
            let promoted = leftovers.remove(pos);
            self.make_room(selected, rejected);
            if selected.len() >= self.config.max_strategies {
                if let Some(pos) = worst_of(selected) {
                    rejected.push(RejectedCandidate {
                        strategy: selected.remove(pos),
                        reason: RejectReason::Capacity,
                    });
                }
            }
            selected.push(promoted);
        }
    }

    /// Guarantee exactly one coordinates strategy.
    fn enforce_coordinates(
        &self,
        selected: &mut Vec<LocatorStrategy>,
        leftovers: &mut Vec<LocatorStrategy>,
        rejected: &mut Vec<RejectedCandidate>,
        fallback_point: Point,
    ) {
        // Drop extra coordinates candidates, keeping the strongest.
        let mut seen = false;
        let mut idx = 0;
        while idx < selected.len() {
            if selected[idx].strategy_type == StrategyType::Coordinates {
                if seen {
                    rejected.push(RejectedCandidate {
                        strategy: selected.remove(idx),
                        reason: RejectReason::TypeCovered,
                    });
                    continue;
                }
                seen = true;
            }
            idx += 1;
        }
        if seen {
            return;
        }

        let coordinate = match best_of(leftovers, |s| {
            s.strategy_type == StrategyType::Coordinates
        }) {
            Some(pos) => leftovers.remove(pos),
            None => LocatorStrategy::new(
                StrategyType::Coordinates,
                None,
                StrategyMetadata::Coordinates {
                    point: fallback_point,
                },
                StrategyType::Coordinates.base_weight(),
            ),
        };
        if selected.len() >= self.config.max_strategies {
            // Replace the weakest strategy with the coordinate fallback.
            if let Some(pos) = worst_of(selected) {
                rejected.push(RejectedCandidate {
                    strategy: selected.remove(pos),
                    reason: RejectReason::Capacity,
                });
            }
        }
        selected.push(coordinate);
    }

    /// Evict the weakest redundantly-covered strategy when at capacity.
    fn make_room(&self, selected: &mut Vec<LocatorStrategy>, rejected: &mut Vec<RejectedCandidate>) {
        if selected.len() < self.config.max_strategies {
            return;
        }
        let mut counts: std::collections::HashMap<StrategyCategory, usize> =
            std::collections::HashMap::new();
        for s in selected.iter() {
            *counts.entry(s.strategy_type.category()).or_default() += 1;
        }
        let evict = selected
            .iter()
            .enumerate()
            .filter(|(_, s)| counts[&s.strategy_type.category()] > 1)
            .min_by(|(_, a), (_, b)| {
                a.confidence
                    .partial_cmp(&b.confidence)
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
            .map(|(idx, _)| idx);
        if let Some(idx) = evict {
            rejected.push(RejectedCandidate {
                strategy: selected.remove(idx),
                reason: RejectReason::TypeCovered,
            });
        }
    }
}

fn best_of(pool: &[LocatorStrategy], pred: impl Fn(&LocatorStrategy) -> bool) -> Option<usize> {
    pool.iter()
        .enumerate()
        .filter(|(_, s)| pred(s))
        .max_by(|(_, a), (_, b)| {
            a.confidence
                .partial_cmp(&b.confidence)
                .unwrap_or(std::cmp::Ordering::Equal)
        })
        .map(|(idx, _)| idx)
}

fn worst_of(pool: &[LocatorStrategy]) -> Option<usize> {
    pool.iter()
        .enumerate()
        .min_by(|(_, a), (_, b)| {
            a.confidence
                .partial_cmp(&b.confidence)
                .unwrap_or(std::cmp::Ordering::Equal)
        })
        .map(|(idx, _)| idx)
}

/// Normalized Levenshtein similarity of two strings in [0, 1].
pub fn normalized_similarity(a: &str, b: &str) -> f64 {
    let max_len = a.chars().count().max(b.chars().count());
    if max_len == 0 {
        return 1.0;
    }
    1.0 - levenshtein(a, b) as f64 / max_len as f64
}

fn levenshtein(a: &str, b: &str) -> usize {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    if a.is_empty() {
        return b.len();
    }
    if b.is_empty() {
        return a.len();
    }
    let mut prev: Vec<usize> = (0..=b.len()).collect();
    let mut current = vec![0usize; b.len() + 1];
    for (i, ca) in a.iter().enumerate() {
        current[0] = i + 1;
        for (j, cb) in b.iter().enumerate() {
            let substitution = prev[j] + usize::from(ca != cb);
            current[j + 1] = substitution.min(prev[j + 1] + 1).min(current[j] + 1);
        }
        std::mem::swap(&mut prev, &mut current);
    }
    prev[b.len()]
}
