//! # replay-core
//!
//! A resilient record-and-replay automation engine for web pages.
//!
//! At record time, four concurrent observers (DOM events, mouse
//! kinematics, visible-text OCR, network activity) feed per-action
//! evidence bundles, and each action gets a **fallback chain**: an
//! ordered list of locator strategies that each independently identify
//! the target element. At replay time, the chain's strategies race in
//! parallel against the live page and the strongest surviving match
//! drives kinematic input dispatch. When the page changes between
//! record and replay, the replay still succeeds because *some*
//! strategy in the chain still matches.
//!
//! ## Core Components
//!
//! - **Transport / OCR ports**: the browser channel and text
//!   recognition as swappable contracts
//! - **Capture layers**: DOM, mouse, vision, network observers
//! - **Chain**: strategy scoring, deduplication, and diversity
//! - **Recorder**: session lifecycle and capture fan-out
//! - **Replay**: parallel evaluation, decision, and execution
//!
//! ## Example
//!
//! ```rust,ignore
//! use replay_core::{EngineConfig, TargetId, TracingTelemetry};
//! use std::sync::Arc;
//!
//! let config = EngineConfig::new().with_ignore_patterns(vec!["analytics".into()]);
//! let session = config.recording_session(transport.clone(), ocr.clone(), TargetId::new("page-1"));
//! let mut actions = session.take_actions().unwrap();
//! session.start().await?;
//! // ... user interacts; captured actions arrive on the channel ...
//! let recorded = session.stop().await?;
//!
//! let engine = config.replay_engine(transport, ocr, Arc::new(TracingTelemetry));
//! for (step, action) in recorded.iter().enumerate() {
//!     engine.replay_action(&TargetId::new("page-1"), action, step).await?;
//! }
//! ```

pub mod actionability;
pub mod ax;
pub mod buffer;
pub mod capture;
pub mod chain;
pub mod config;
pub mod error;
pub mod evidence;
pub mod geom;
pub mod ocr;
pub mod recorder;
pub mod replay;
pub mod telemetry;
pub mod transport;

// Re-exports for convenience
pub use actionability::{Actionability, ActionabilityConfig, ActionabilityWaiter};
pub use ax::{
    AccessibilityView, AxConfig, AxMatch, AxNode, NameMatch, RoleQuery, ROLE_MATCH_CONFIDENCE,
    ROLE_NAME_MATCH_CONFIDENCE,
};
pub use buffer::{BufferConfig, BufferStats, EvidenceBuffer, PutOutcome};
pub use capture::dom::{DomCapture, DomCaptureLayer, DomConfig, RawDomEvent, RawElement};
pub use capture::mouse::{MouseCaptureLayer, MouseConfig};
pub use capture::network::{NetworkCaptureLayer, NetworkConfig, TrackedRequest};
pub use capture::vision::{VisionCaptureLayer, VisionConfig};
pub use capture::{CaptureLayer, LayerStatus};
pub use chain::{
    Candidate, CandidateSource, ChainBuildResult, ChainBuilder, ChainBuilderConfig,
    ChainGenerator, ElementContext, FallbackChain, LocatorStrategy, RejectReason,
    RejectedCandidate, ScorerConfig, StrategyCategory, StrategyMetadata, StrategyScorer,
    StrategyType,
};
pub use config::EngineConfig;
pub use error::{ControlError, ControlErrorCode, Error, Result};
pub use evidence::{
    CapturedAction, ElementDescriptor, EventType, EvidenceBundle, FormContext, IframeEntry,
    MouseEvidence, MousePattern, NetworkEvidence, PageLoadState, TrailPoint, TrailSummary,
    VisionEvidence,
};
pub use geom::{Point, Rect};
pub use ocr::{OcrPort, OcrResult, SerializedOcr};
pub use recorder::{RecorderConfig, RecordingSession, SessionState};
pub use replay::{
    ActionExecutor, ActionRequest, ActionResult, CancelSource, CancelToken, CoordinatesEvaluator,
    DecisionConfig, DecisionEngine, DecisionOutcome, Evaluation, EvidenceEvalConfig,
    EvidenceEvaluator, EvidenceWeights, ExecutorConfig, OcrEvalConfig, OcrEvaluator,
    SelectorEvaluator, SemanticEvaluator, StrategyEvaluator,
};
pub use telemetry::{
    domain_only, CollectingTelemetry, ReplayTelemetryEvent, StrategyOutcome, TelemetryLogger,
    TracingTelemetry,
};
pub use transport::{
    CommandTransport, MouseButton, NodeDescription, NodeRef, PageClient, PageMetrics, TargetId,
    TransportEvent, TransportRetryConfig,
};
