//! Engine configuration surface.
//!
//! One umbrella config covering both sides of the engine, with
//! builder methods for every recognized key. The nested per-component
//! configs live next to their components; this module wires the flat
//! key surface onto them and assembles configured engines.

use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::actionability::ActionabilityConfig;
use crate::ax::{AccessibilityView, AxConfig};
use crate::capture::vision::VisionCaptureLayer;
use crate::chain::StrategyType;
use crate::ocr::OcrPort;
use crate::recorder::{RecorderConfig, RecordingSession};
use crate::replay::{ActionExecutor, DecisionConfig, DecisionEngine, ExecutorConfig};
use crate::telemetry::TelemetryLogger;
use crate::transport::{CommandTransport, PageClient, TargetId};

/// Full engine configuration: recording and replay.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    pub recording: RecorderConfig,
    pub ax: AxConfig,
    pub actionability: ActionabilityConfig,
    pub decision: DecisionConfig,
    pub executor: ExecutorConfig,
}

impl EngineConfig {
    pub fn new() -> Self {
        Self::default()
    }

    // Layer switches; the DOM layer is always on.

    pub fn with_enable_vision(mut self, enabled: bool) -> Self {
        self.recording.enable_vision = enabled;
        self
    }

    pub fn with_enable_mouse(mut self, enabled: bool) -> Self {
        self.recording.enable_mouse = enabled;
        self
    }

    pub fn with_enable_network(mut self, enabled: bool) -> Self {
        self.recording.enable_network = enabled;
        self
    }

    // Buffer bounds.

    pub fn with_buffer_size_limit(mut self, bytes: usize) -> Self {
        self.recording.buffer.size_limit_bytes = bytes;
        self
    }

    pub fn with_buffer_gc_threshold(mut self, fraction: f64) -> Self {
        self.recording.buffer.gc_threshold = fraction;
        self
    }

    // Mouse sampling.

    pub fn with_sample_rate_ms(mut self, ms: f64) -> Self {
        self.recording.mouse.sample_rate_ms = ms;
        self
    }

    pub fn with_movement_threshold(mut self, px: f64) -> Self {
        self.recording.mouse.movement_threshold_px = px;
        self
    }

    pub fn with_max_trail_length(mut self, points: usize) -> Self {
        self.recording.mouse.max_trail_len = points;
        self
    }

    pub fn with_retention_ms(mut self, ms: f64) -> Self {
        self.recording.mouse.retention_ms = ms;
        self
    }

    // Vision.

    pub fn with_ocr_confidence_min(mut self, min: f64) -> Self {
        self.recording.vision.ocr_confidence_min = min;
        self
    }

    pub fn with_ocr_timeout_ms(mut self, ms: u64) -> Self {
        self.recording.vision.ocr_timeout_ms = ms;
        self
    }

    pub fn with_ocr_cache_ttl_ms(mut self, ms: u64) -> Self {
        self.recording.vision.cache_ttl_ms = ms;
        self
    }

    // Network.

    pub fn with_ignore_patterns(mut self, patterns: Vec<String>) -> Self {
        self.recording.network.ignore_patterns = patterns;
        self
    }

    // Chain builder.

    pub fn with_min_candidate_confidence(mut self, min: f64) -> Self {
        self.recording.builder.min_candidate_confidence = min;
        self
    }

    pub fn with_max_strategies(mut self, max: usize) -> Self {
        self.recording.builder.max_strategies = max;
        self
    }

    pub fn with_min_diverse_types(mut self, min: usize) -> Self {
        self.recording.builder.min_diverse_types = min;
        self
    }

    pub fn with_similarity_threshold(mut self, threshold: f64) -> Self {
        self.recording.builder.similarity_threshold = threshold;
        self
    }

    pub fn with_always_include_coordinates(mut self, always: bool) -> Self {
        self.recording.builder.always_include_coordinates = always;
        self
    }

    pub fn with_preferred_types(mut self, types: Vec<StrategyType>) -> Self {
        self.recording.builder.preferred_types = types;
        self
    }

    // Decision engine.

    pub fn with_eval_timeout_ms(mut self, ms: u64) -> Self {
        self.decision.eval_timeout_ms = ms;
        self
    }

    pub fn with_min_decision_confidence(mut self, min: f64) -> Self {
        self.decision.min_confidence = min;
        self
    }

    pub fn with_parallel_evaluation(mut self, parallel: bool) -> Self {
        self.decision.parallel = parallel;
        self
    }

    pub fn with_retry_on_failure(mut self, retry: bool) -> Self {
        self.decision.retry_on_failure = retry;
        self
    }

    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.decision.max_retries = retries;
        self
    }

    // Executor.

    pub fn with_click_delay(mut self, ms: u64) -> Self {
        self.executor.click_delay_ms = ms;
        self
    }

    pub fn with_type_delay(mut self, ms: u64) -> Self {
        self.executor.type_delay_ms = ms;
        self
    }

    pub fn with_mouse_move_steps(mut self, steps: u32) -> Self {
        self.executor.mouse_move_steps = steps;
        self
    }

    pub fn with_scroll_margin(mut self, margin: f64) -> Self {
        self.executor.scroll_margin = margin;
        self
    }

    pub fn with_focus_before_type(mut self, focus: bool) -> Self {
        self.executor.focus_before_type = focus;
        self
    }

    pub fn with_clear_before_type(mut self, clear: bool) -> Self {
        self.executor.clear_before_type = clear;
        self
    }

    pub fn with_verify_after_action(mut self, verify: bool) -> Self {
        self.executor.verify_after_action = verify;
        self
    }

    pub fn with_action_timeout_ms(mut self, ms: u64) -> Self {
        self.executor.action_timeout_ms = ms;
        self
    }

    /// Assemble a recording session over a transport and OCR port.
    pub fn recording_session(
        &self,
        transport: Arc<dyn CommandTransport>,
        ocr: Arc<dyn OcrPort>,
        target: TargetId,
    ) -> RecordingSession {
        RecordingSession::new(transport, ocr, target, self.recording.clone())
    }

    /// Assemble a replay engine over a transport and OCR port.
    pub fn replay_engine(
        &self,
        transport: Arc<dyn CommandTransport>,
        ocr: Arc<dyn OcrPort>,
        telemetry: Arc<dyn TelemetryLogger>,
    ) -> DecisionEngine {
        let client = PageClient::new(transport);
        let ax = Arc::new(AccessibilityView::new(client.clone(), self.ax.clone()));
        let vision = Arc::new(VisionCaptureLayer::new(
            client.clone(),
            ocr,
            self.recording.vision.clone(),
        ));
        let executor = ActionExecutor::new(
            client.clone(),
            self.actionability.clone(),
            self.executor.clone(),
        );
        DecisionEngine::new(
            client,
            ax,
            vision,
            executor,
            telemetry,
            self.decision.clone(),
        )
    }
}
