//! Replay decision engine, strategy evaluators, and action executor.
//!
//! A captured action replays in three stages: the chain's strategies
//! are raced in parallel by family-specific evaluators, the weighted
//! winner is selected once every result (or its timeout) is in, and
//! the action executor dispatches kinematic input gated on
//! actionability.

use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::chain::{LocatorStrategy, StrategyType};
use crate::geom::Point;
use crate::transport::{NodeRef, TargetId};

mod decision;
mod evaluators;
mod evidence;
mod executor;

pub use decision::{DecisionConfig, DecisionEngine, DecisionOutcome};
pub use evaluators::{
    CoordinatesEvaluator, OcrEvalConfig, OcrEvaluator, SelectorEvaluator, SemanticEvaluator,
};
pub use evidence::{EvidenceEvalConfig, EvidenceEvaluator, EvidenceWeights};
pub use executor::{ActionExecutor, ActionRequest, ActionResult, ExecutorConfig};

/// Cooperative cancellation for parallel evaluation fan-outs.
///
/// Evaluators check the token at their await points; the decision
/// engine trips it once a winner is chosen so outstanding transport
/// queries short-circuit.
#[derive(Clone)]
pub struct CancelToken {
    rx: watch::Receiver<bool>,
}

impl CancelToken {
    /// A token that never cancels.
    ///
    /// The sender is dropped immediately; the receiver keeps reporting
    /// the last value, which stays `false` forever.
    pub fn never() -> Self {
        let (_tx, rx) = watch::channel(false);
        Self { rx }
    }

    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }
}

/// The cancelling side of a [`CancelToken`].
pub struct CancelSource {
    tx: watch::Sender<bool>,
}

impl CancelSource {
    pub fn new() -> (Self, CancelToken) {
        let (tx, rx) = watch::channel(false);
        (Self { tx }, CancelToken { rx })
    }

    pub fn cancel(&self) {
        let _ = self.tx.send(true);
    }
}

/// Result of evaluating one strategy against the live page.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Evaluation {
    #[serde(rename = "type")]
    pub strategy_type: StrategyType,
    pub found: bool,
    pub confidence: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub node: Option<NodeRef>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub click_point: Option<Point>,
    pub duration_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Evaluation {
    /// A hit, without timing (the caller stamps duration).
    pub fn hit(
        strategy_type: StrategyType,
        confidence: f64,
        node: Option<NodeRef>,
        click_point: Point,
    ) -> Self {
        Self {
            strategy_type,
            found: true,
            confidence,
            node,
            click_point: Some(click_point),
            duration_ms: 0,
            error: None,
        }
    }

    /// A clean miss.
    pub fn miss(strategy_type: StrategyType) -> Self {
        Self {
            strategy_type,
            found: false,
            confidence: 0.0,
            node: None,
            click_point: None,
            duration_ms: 0,
            error: None,
        }
    }

    /// A failed evaluation with its error kind.
    pub fn failed(strategy_type: StrategyType, error: impl Into<String>) -> Self {
        Self {
            strategy_type,
            found: false,
            confidence: 0.0,
            node: None,
            click_point: None,
            duration_ms: 0,
            error: Some(error.into()),
        }
    }

    pub fn with_duration(mut self, duration_ms: u64) -> Self {
        self.duration_ms = duration_ms;
        self
    }
}

/// Contract shared by the five evaluator families.
#[async_trait::async_trait]
pub trait StrategyEvaluator: Send + Sync {
    /// The strategy families this evaluator is routed.
    fn handles(&self) -> &'static [StrategyType];

    /// Evaluate one strategy against the live page.
    ///
    /// Failures are embedded in the returned evaluation, never raised:
    /// a miss is a normal outcome for a fallback chain.
    async fn evaluate(
        &self,
        target: &TargetId,
        strategy: &LocatorStrategy,
        cancel: &CancelToken,
    ) -> Evaluation;
}
