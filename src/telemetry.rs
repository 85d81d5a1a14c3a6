//! Replay telemetry port and built-in sinks.
//!
//! The decision engine emits one event per replayed step summarizing
//! every strategy evaluation plus the chosen one. Durable persistence
//! is the consumer's concern; this module defines the port and two
//! in-process sinks (tracing output, in-memory collection).

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Mutex;
use tracing::info;
use uuid::Uuid;

use crate::chain::StrategyType;
use crate::error::Result;
use crate::evidence::EventType;

/// Outcome of one strategy evaluation, as logged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StrategyOutcome {
    #[serde(rename = "type")]
    pub strategy_type: StrategyType,
    pub found: bool,
    pub confidence: f64,
    pub duration_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// One replayed step's telemetry record.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplayTelemetryEvent {
    pub run_id: Uuid,
    pub step_index: usize,
    pub action_type: EventType,
    pub timestamp: DateTime<Utc>,
    pub strategies_evaluated: Vec<StrategyOutcome>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub used_strategy: Option<StrategyType>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub used_confidence: Option<f64>,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub duration_ms: u64,
    /// Hostname only; full paths are never logged
    pub page_domain: String,
}

/// Telemetry port.
#[async_trait]
pub trait TelemetryLogger: Send + Sync {
    async fn log_event(&self, event: ReplayTelemetryEvent) -> Result<()>;
}

/// Default sink: structured tracing output.
#[derive(Debug, Default)]
pub struct TracingTelemetry;

#[async_trait]
impl TelemetryLogger for TracingTelemetry {
    async fn log_event(&self, event: ReplayTelemetryEvent) -> Result<()> {
        info!(
            run_id = %event.run_id,
            step = event.step_index,
            action = %event.action_type,
            success = event.success,
            used = event.used_strategy.map(|s| s.to_string()).unwrap_or_else(|| "none".into()),
            confidence = event.used_confidence.unwrap_or(0.0),
            strategies = event.strategies_evaluated.len(),
            duration_ms = event.duration_ms,
            domain = %event.page_domain,
            "replay step"
        );
        Ok(())
    }
}

/// In-memory sink, handy for assertions and short sessions.
#[derive(Debug, Default)]
pub struct CollectingTelemetry {
    events: Mutex<Vec<ReplayTelemetryEvent>>,
}

impl CollectingTelemetry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<ReplayTelemetryEvent> {
        self.events.lock().unwrap().clone()
    }
}

#[async_trait]
impl TelemetryLogger for CollectingTelemetry {
    async fn log_event(&self, event: ReplayTelemetryEvent) -> Result<()> {
        self.events.lock().unwrap().push(event);
        Ok(())
    }
}

/// Reduce a URL to its hostname for logging.
pub fn domain_only(url: &str) -> String {
    let stripped = url
        .split_once("://")
        .map(|(_, rest)| rest)
        .unwrap_or(url);
    let host = stripped
        .split(['/', '?', '#'])
        .next()
        .unwrap_or(stripped);
    // Drop credentials and port.
    let host = host.rsplit_once('@').map(|(_, h)| h).unwrap_or(host);
    host.split_once(':').map(|(h, _)| h).unwrap_or(host).to_string()
}
