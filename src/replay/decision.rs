//! Decision engine: parallel strategy evaluation and winner selection.
//!
//! Routes each strategy of a captured action's chain to its evaluator,
//! races them under per-strategy timeouts, and picks the strongest
//! qualified result by base weight times reported confidence, with
//! chain position breaking ties. The winner's click point drives the
//! action executor; every step emits one telemetry event summarizing
//! all evaluations.

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::evaluators::{
    CoordinatesEvaluator, OcrEvalConfig, OcrEvaluator, SelectorEvaluator, SemanticEvaluator,
};
use super::evidence::{EvidenceEvalConfig, EvidenceEvaluator};
use super::executor::{ActionExecutor, ActionRequest};
use super::{CancelSource, CancelToken, Evaluation, StrategyEvaluator};
use crate::ax::AccessibilityView;
use crate::capture::vision::VisionCaptureLayer;
use crate::chain::{LocatorStrategy, StrategyType};
use crate::error::Result;
use crate::evidence::CapturedAction;
use crate::telemetry::{domain_only, ReplayTelemetryEvent, StrategyOutcome, TelemetryLogger};
use crate::transport::{PageClient, TargetId};

/// Decision engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecisionConfig {
    /// Per-strategy evaluation deadline
    pub eval_timeout_ms: u64,
    /// Results below this confidence never win
    pub min_confidence: f64,
    /// Evaluate the chain in parallel (sequential otherwise)
    pub parallel: bool,
    /// Retry once with a forced cache refresh when nothing qualifies
    pub retry_on_failure: bool,
    pub max_retries: u32,
    pub ocr: OcrEvalConfig,
    pub evidence: EvidenceEvalConfig,
}

impl Default for DecisionConfig {
    fn default() -> Self {
        Self {
            eval_timeout_ms: 3_000,
            min_confidence: 0.5,
            parallel: true,
            retry_on_failure: true,
            max_retries: 1,
            ocr: OcrEvalConfig::default(),
            evidence: EvidenceEvalConfig::default(),
        }
    }
}

/// Result of replaying one captured action.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DecisionOutcome {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub used_strategy_type: Option<StrategyType>,
    pub confidence: f64,
    pub evaluations: Vec<Evaluation>,
    pub duration_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub verified: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Replays captured actions against a live target.
pub struct DecisionEngine {
    client: PageClient,
    ax: Arc<AccessibilityView>,
    evaluators: Vec<Arc<dyn StrategyEvaluator>>,
    executor: ActionExecutor,
    telemetry: Arc<dyn TelemetryLogger>,
    config: DecisionConfig,
    run_id: Uuid,
}

impl DecisionEngine {
    pub fn new(
        client: PageClient,
        ax: Arc<AccessibilityView>,
        vision: Arc<VisionCaptureLayer>,
        executor: ActionExecutor,
        telemetry: Arc<dyn TelemetryLogger>,
        config: DecisionConfig,
    ) -> Self {
        let evaluators: Vec<Arc<dyn StrategyEvaluator>> = vec![
            Arc::new(SelectorEvaluator::new(client.clone())),
            Arc::new(SemanticEvaluator::new(client.clone(), ax.clone())),
            Arc::new(OcrEvaluator::new(vision, config.ocr.clone())),
            Arc::new(CoordinatesEvaluator::new(client.clone())),
            Arc::new(EvidenceEvaluator::new(client.clone(), config.evidence.clone())),
        ];
        Self {
            client,
            ax,
            evaluators,
            executor,
            telemetry,
            config,
            run_id: Uuid::new_v4(),
        }
    }

    /// Replace the evaluator set (tests, custom routing).
    pub fn with_evaluators(mut self, evaluators: Vec<Arc<dyn StrategyEvaluator>>) -> Self {
        self.evaluators = evaluators;
        self
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    /// Replay one captured action.
    pub async fn replay_action(
        &self,
        target: &TargetId,
        action: &CapturedAction,
        step_index: usize,
    ) -> Result<DecisionOutcome> {
        let started = Instant::now();
        // Chains can arrive from persisted JSON; revalidate at the boundary.
        action.fallback_chain.validate()?;
        let strategies = &action.fallback_chain.strategies;
        let (cancel_source, cancel) = CancelSource::new();

        let mut evaluations = self.evaluate_all(target, strategies, &cancel).await;
        let mut winner = self.pick_winner(&evaluations, strategies);

        let mut retries = 0;
        while winner.is_none() && self.config.retry_on_failure && retries < self.config.max_retries
        {
            retries += 1;
            debug!(retries, "no strategy qualified, refreshing caches and retrying misses");
            self.ax.invalidate(target).await;
            for idx in 0..strategies.len() {
                if !evaluations[idx].found {
                    evaluations[idx] = self
                        .evaluate_one(target, &strategies[idx], &cancel)
                        .await;
                }
            }
            winner = self.pick_winner(&evaluations, strategies);
        }
        cancel_source.cancel();

        let outcome = match winner {
            Some(idx) => {
                let evaluation = evaluations[idx].clone();
                let click_point = evaluation
                    .click_point
                    .unwrap_or(action.dom_evidence.click_point);
                let request = ActionRequest {
                    event_type: action.event_type,
                    node: evaluation.node,
                    click_point,
                    value: action.value.clone(),
                    click_count: action.click_count,
                };
                info!(
                    strategy = %evaluation.strategy_type,
                    confidence = evaluation.confidence,
                    "dispatching with winning strategy"
                );
                match self.executor.execute(target, &request).await {
                    Ok(result) => DecisionOutcome {
                        success: result.success,
                        used_strategy_type: Some(evaluation.strategy_type),
                        confidence: evaluation.confidence,
                        evaluations,
                        duration_ms: started.elapsed().as_millis() as u64,
                        verified: result.verified,
                        error: None,
                    },
                    Err(e) => {
                        warn!("action dispatch failed: {e}");
                        DecisionOutcome {
                            success: false,
                            used_strategy_type: Some(evaluation.strategy_type),
                            confidence: evaluation.confidence,
                            evaluations,
                            duration_ms: started.elapsed().as_millis() as u64,
                            verified: None,
                            error: Some(e.kind().to_string()),
                        }
                    }
                }
            }
            None => DecisionOutcome {
                success: false,
                used_strategy_type: None,
                confidence: 0.0,
                evaluations,
                duration_ms: started.elapsed().as_millis() as u64,
                verified: None,
                error: Some("no strategy qualified".into()),
            },
        };

        self.emit_telemetry(target, action, step_index, &outcome).await;
        Ok(outcome)
    }

    async fn evaluate_all(
        &self,
        target: &TargetId,
        strategies: &[LocatorStrategy],
        cancel: &CancelToken,
    ) -> Vec<Evaluation> {
        if self.config.parallel {
            join_all(
                strategies
                    .iter()
                    .map(|strategy| self.evaluate_one(target, strategy, cancel)),
            )
            .await
        } else {
            let mut evaluations = Vec::with_capacity(strategies.len());
            for strategy in strategies {
                evaluations.push(self.evaluate_one(target, strategy, cancel).await);
            }
            evaluations
        }
    }

    async fn evaluate_one(
        &self,
        target: &TargetId,
        strategy: &LocatorStrategy,
        cancel: &CancelToken,
    ) -> Evaluation {
        let Some(evaluator) = self
            .evaluators
            .iter()
            .find(|e| e.handles().contains(&strategy.strategy_type))
        else {
            return Evaluation::failed(strategy.strategy_type, "evaluator_error: no route");
        };
        let deadline = Duration::from_millis(self.config.eval_timeout_ms);
        match tokio::time::timeout(deadline, evaluator.evaluate(target, strategy, cancel)).await {
            Ok(evaluation) => evaluation,
            Err(_) => Evaluation::failed(strategy.strategy_type, "timeout")
                .with_duration(self.config.eval_timeout_ms),
        }
    }

    /// Highest base weight times reported confidence among qualified
    /// results; earlier chain position wins ties.
    fn pick_winner(
        &self,
        evaluations: &[Evaluation],
        strategies: &[LocatorStrategy],
    ) -> Option<usize> {
        let mut best: Option<(usize, f64)> = None;
        for (idx, evaluation) in evaluations.iter().enumerate() {
            if !evaluation.found || evaluation.confidence < self.config.min_confidence {
                continue;
            }
            let weight =
                strategies[idx].strategy_type.base_weight() * evaluation.confidence;
            match best {
                Some((_, best_weight)) if weight <= best_weight => {}
                _ => best = Some((idx, weight)),
            }
        }
        best.map(|(idx, _)| idx)
    }

    async fn emit_telemetry(
        &self,
        target: &TargetId,
        action: &CapturedAction,
        step_index: usize,
        outcome: &DecisionOutcome,
    ) {
        let page_domain = match self.client.page_metrics(target).await {
            Ok(metrics) => domain_only(&metrics.url),
            Err(_) => String::new(),
        };
        let event = ReplayTelemetryEvent {
            run_id: self.run_id,
            step_index,
            action_type: action.event_type,
            timestamp: chrono::Utc::now(),
            strategies_evaluated: outcome
                .evaluations
                .iter()
                .map(|e| StrategyOutcome {
                    strategy_type: e.strategy_type,
                    found: e.found,
                    confidence: e.confidence,
                    duration_ms: e.duration_ms,
                    error: e.error.clone(),
                })
                .collect(),
            used_strategy: outcome.used_strategy_type,
            used_confidence: outcome.used_strategy_type.map(|_| outcome.confidence),
            success: outcome.success,
            error: outcome.error.clone(),
            duration_ms: outcome.duration_ms,
            page_domain,
        };
        if let Err(e) = self.telemetry.log_event(event).await {
            warn!("telemetry sink rejected event: {e}");
        }
    }
}
