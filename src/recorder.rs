//! Recording orchestrator: session lifecycle and capture fan-out.
//!
//! Coordinates the four capture layers. On every DOM capture the
//! orchestrator snapshots mouse, network, and vision state in
//! parallel, each bounded by a per-layer timeout, assembles the
//! evidence bundle, generates the fallback chain, appends the action
//! to the evidence buffer, and emits it to the consumer. Layers other
//! than DOM are non-critical: an init failure disables the layer with
//! a warning and the session continues.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::buffer::{BufferConfig, BufferStats, EvidenceBuffer};
use crate::capture::dom::{DomCaptureLayer, DomConfig};
use crate::capture::mouse::{MouseCaptureLayer, MouseConfig};
use crate::capture::network::{NetworkCaptureLayer, NetworkConfig};
use crate::capture::vision::{VisionCaptureLayer, VisionConfig};
use crate::capture::{CaptureLayer, LayerStatus, LIFECYCLE_EVENT};
use crate::chain::{ChainBuilderConfig, ChainGenerator, ScorerConfig};
use crate::error::{ControlError, ControlErrorCode, Error};
use crate::evidence::{CapturedAction, ElementDescriptor, EventType, EvidenceBundle};
use crate::ocr::OcrPort;
use crate::transport::{CommandTransport, PageClient, TargetId};

/// Snapshot deadline for the mouse and network layers.
const SNAPSHOT_TIMEOUT_MS: u64 = 100;

/// Recording-side configuration. The DOM layer is always on; the
/// other layers default to enabled and can be switched off.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecorderConfig {
    pub enable_vision: bool,
    pub enable_mouse: bool,
    pub enable_network: bool,
    pub dom: DomConfig,
    pub mouse: MouseConfig,
    pub vision: VisionConfig,
    pub network: NetworkConfig,
    pub buffer: BufferConfig,
    pub scorer: ScorerConfig,
    pub builder: ChainBuilderConfig,
}

impl Default for RecorderConfig {
    fn default() -> Self {
        Self {
            enable_vision: true,
            enable_mouse: true,
            enable_network: true,
            dom: DomConfig::default(),
            mouse: MouseConfig::default(),
            vision: VisionConfig::default(),
            network: NetworkConfig::default(),
            buffer: BufferConfig::default(),
            scorer: ScorerConfig::default(),
            builder: ChainBuilderConfig::default(),
        }
    }
}

/// Lifecycle of a recording session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Idle,
    Initializing,
    Recording,
    Paused,
    Finalizing,
    Completed,
    Error,
}

struct LayerSet {
    dom: Arc<DomCaptureLayer>,
    mouse: Arc<MouseCaptureLayer>,
    vision: Arc<VisionCaptureLayer>,
    network: Arc<NetworkCaptureLayer>,
}

/// One recording session over a page target.
pub struct RecordingSession {
    transport: Arc<dyn CommandTransport>,
    client: PageClient,
    target: TargetId,
    config: RecorderConfig,
    state: Arc<Mutex<SessionState>>,
    session_id: Mutex<Option<Uuid>>,
    layers: LayerSet,
    /// Which non-critical layers currently participate in snapshots
    enabled: Arc<Mutex<HashMap<&'static str, bool>>>,
    started_layers: Mutex<HashMap<&'static str, bool>>,
    buffer: Arc<Mutex<EvidenceBuffer>>,
    generator: Arc<ChainGenerator>,
    actions_tx: mpsc::UnboundedSender<CapturedAction>,
    actions_rx: Mutex<Option<mpsc::UnboundedReceiver<CapturedAction>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl RecordingSession {
    pub fn new(
        transport: Arc<dyn CommandTransport>,
        ocr: Arc<dyn OcrPort>,
        target: TargetId,
        config: RecorderConfig,
    ) -> Self {
        let client = PageClient::new(transport.clone());
        let layers = LayerSet {
            dom: Arc::new(DomCaptureLayer::new(transport.clone(), config.dom.clone())),
            mouse: Arc::new(MouseCaptureLayer::new(
                transport.clone(),
                config.mouse.clone(),
            )),
            vision: Arc::new(VisionCaptureLayer::new(
                client.clone(),
                ocr,
                config.vision.clone(),
            )),
            network: Arc::new(NetworkCaptureLayer::new(
                client.clone(),
                config.network.clone(),
            )),
        };
        let enabled = HashMap::from([
            ("mouse", config.enable_mouse),
            ("vision", config.enable_vision),
            ("network", config.enable_network),
        ]);
        let (actions_tx, actions_rx) = mpsc::unbounded_channel();
        let generator = ChainGenerator::new(config.scorer.clone(), config.builder.clone());
        Self {
            transport,
            client,
            target,
            buffer: Arc::new(Mutex::new(EvidenceBuffer::new(config.buffer.clone()))),
            generator: Arc::new(generator),
            config,
            state: Arc::new(Mutex::new(SessionState::Idle)),
            session_id: Mutex::new(None),
            layers,
            enabled: Arc::new(Mutex::new(enabled)),
            started_layers: Mutex::new(HashMap::new()),
            actions_tx,
            actions_rx: Mutex::new(Some(actions_rx)),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Take the captured-action stream. Single consumer.
    pub fn take_actions(&self) -> Option<mpsc::UnboundedReceiver<CapturedAction>> {
        self.actions_rx.lock().unwrap().take()
    }

    pub fn state(&self) -> SessionState {
        *self.state.lock().unwrap()
    }

    pub fn session_id(&self) -> Option<Uuid> {
        *self.session_id.lock().unwrap()
    }

    fn set_state(&self, next: SessionState) {
        *self.state.lock().unwrap() = next;
    }

    /// Start recording. DOM layer failure is fatal; other layers
    /// degrade to disabled.
    pub async fn start(&self) -> Result<Uuid, ControlError> {
        match self.state() {
            SessionState::Idle => {}
            SessionState::Completed => {
                return Err(ControlError::wrong_mode(
                    "session already completed; create a new session",
                ))
            }
            SessionState::Error => {
                return Err(ControlError::wrong_mode("session is in error state"))
            }
            _ => return Err(ControlError::already_running()),
        }
        self.set_state(SessionState::Initializing);

        if let Err(e) = self.transport.attach(&self.target).await {
            self.set_state(SessionState::Error);
            return Err(ControlError::new(ControlErrorCode::InitFailed, e.to_string()));
        }

        // All enabled layers initialize in parallel.
        let dom_init = self.layers.dom.start(&self.target);
        let mouse_init = self.init_optional("mouse");
        let vision_init = self.init_optional("vision");
        let network_init = self.init_optional("network");
        let (dom_result, ..) = tokio::join!(dom_init, mouse_init, vision_init, network_init);

        if let Err(e) = dom_result {
            warn!("critical DOM layer failed to initialize: {e}");
            self.set_state(SessionState::Error);
            return Err(ControlError::new(ControlErrorCode::InitFailed, e.to_string()));
        }
        self.started_layers.lock().unwrap().insert("dom", true);

        self.spawn_capture_loop();
        self.spawn_navigation_watch().await;

        let session_id = Uuid::new_v4();
        *self.session_id.lock().unwrap() = Some(session_id);
        self.set_state(SessionState::Recording);
        info!(%session_id, target = %self.target, "recording session started");
        Ok(session_id)
    }

    /// Initialize a non-critical layer, disabling it on failure.
    async fn init_optional(&self, name: &'static str) {
        if !self.enabled.lock().unwrap().get(name).copied().unwrap_or(false) {
            return;
        }
        let result = match name {
            "mouse" => self.layers.mouse.start(&self.target).await,
            "vision" => self.layers.vision.start(&self.target).await,
            "network" => self.layers.network.start(&self.target).await,
            _ => Ok(()),
        };
        match result {
            Ok(()) => {
                self.started_layers.lock().unwrap().insert(name, true);
            }
            Err(e) => {
                warn!(layer = name, "non-critical layer disabled: {e}");
                self.enabled.lock().unwrap().insert(name, false);
            }
        }
    }

    fn spawn_capture_loop(&self) {
        let Some(mut captures) = self.layers.dom.take_captures() else {
            return;
        };
        let state = self.state.clone();
        let enabled = self.enabled.clone();
        let mouse = self.layers.mouse.clone();
        let vision = self.layers.vision.clone();
        let network = self.layers.network.clone();
        let generator = self.generator.clone();
        let buffer = self.buffer.clone();
        let actions_tx = self.actions_tx.clone();
        let target = self.target.clone();
        let vision_timeout = Duration::from_millis(self.config.vision.ocr_timeout_ms);

        let handle = tokio::spawn(async move {
            while let Some(capture) = captures.recv().await {
                if *state.lock().unwrap() != SessionState::Recording {
                    debug!("capture dropped outside recording state");
                    continue;
                }
                let (mouse_on, vision_on, network_on) = {
                    let enabled = enabled.lock().unwrap();
                    (
                        enabled.get("mouse").copied().unwrap_or(false),
                        enabled.get("vision").copied().unwrap_or(false),
                        enabled.get("network").copied().unwrap_or(false),
                    )
                };

                // Snapshot the evidence layers in parallel, each
                // bounded; a timed-out layer is simply omitted.
                let snapshot_cap = Duration::from_millis(SNAPSHOT_TIMEOUT_MS);
                let mouse_snap = async {
                    if !mouse_on {
                        return None;
                    }
                    tokio::time::timeout(snapshot_cap, async { mouse.consume() })
                        .await
                        .ok()
                };
                let network_snap = async {
                    if !network_on {
                        return None;
                    }
                    tokio::time::timeout(snapshot_cap, async { network.snapshot() })
                        .await
                        .ok()
                };
                let vision_snap = async {
                    if !vision_on {
                        return None;
                    }
                    match tokio::time::timeout(vision_timeout, vision.capture(&target)).await {
                        Ok(Ok(evidence)) => Some(evidence),
                        Ok(Err(e)) => {
                            warn!("vision snapshot failed, omitting: {e}");
                            None
                        }
                        Err(_) => {
                            warn!("vision snapshot timed out, omitting");
                            None
                        }
                    }
                };
                let (mouse_evidence, network_evidence, vision_evidence) =
                    tokio::join!(mouse_snap, network_snap, vision_snap);

                let bundle = EvidenceBundle {
                    dom: capture.descriptor.clone(),
                    mouse: mouse_evidence,
                    vision: vision_evidence,
                    network: network_evidence,
                };
                let chain = match generator.generate(&bundle) {
                    Ok(result) => result.chain,
                    Err(e) => {
                        warn!("chain generation failed, action dropped: {e}");
                        continue;
                    }
                };
                let action = CapturedAction::new(
                    capture.event_type,
                    capture.timestamp,
                    capture.value.clone(),
                    bundle,
                    chain,
                )
                .with_click_count(capture.click_count);

                let admitted = {
                    let mut buffer = buffer.lock().unwrap();
                    match buffer.put(action.clone()) {
                        Ok(outcome) => {
                            if !outcome.evicted.is_empty() {
                                warn!(
                                    evicted = outcome.evicted.len(),
                                    "buffer GC evicted already-emitted actions"
                                );
                            }
                            true
                        }
                        Err(Error::BufferFull { .. }) => {
                            // Drain and retry once; drained actions were
                            // already emitted when captured.
                            warn!("buffer full, draining before retry");
                            buffer.drain();
                            buffer.put(action.clone()).is_ok()
                        }
                        Err(e) => {
                            warn!("buffer rejected action: {e}");
                            false
                        }
                    }
                };
                if !admitted {
                    *state.lock().unwrap() = SessionState::Error;
                    warn!("buffer admission failed twice, session entering error state");
                    continue;
                }

                debug!(
                    action_id = %action.action_id,
                    event = %action.event_type,
                    strategies = action.fallback_chain.strategies.len(),
                    "action captured"
                );
                let _ = actions_tx.send(action);
            }
        });
        self.tasks.lock().unwrap().push(handle);
    }

    /// Watch page navigations and record them as document actions.
    async fn spawn_navigation_watch(&self) {
        let Ok(mut rx) = self.transport.subscribe(&self.target, LIFECYCLE_EVENT).await else {
            return;
        };
        let state = self.state.clone();
        let generator = self.generator.clone();
        let buffer = self.buffer.clone();
        let actions_tx = self.actions_tx.clone();

        let handle = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                if event.params["state"].as_str() != Some("navigated") {
                    continue;
                }
                if *state.lock().unwrap() != SessionState::Recording {
                    continue;
                }
                let url = event.params["url"].as_str().unwrap_or_default().to_string();
                let descriptor = ElementDescriptor {
                    tag_name: "document".into(),
                    css_path: "html".into(),
                    xpath: "/html".into(),
                    ..Default::default()
                };
                let bundle = EvidenceBundle::new(descriptor);
                let Ok(result) = generator.generate(&bundle) else {
                    continue;
                };
                let action = CapturedAction::new(
                    EventType::Navigate,
                    chrono::Utc::now(),
                    Some(url),
                    bundle,
                    result.chain,
                );
                if buffer.lock().unwrap().put(action.clone()).is_ok() {
                    let _ = actions_tx.send(action);
                }
            }
        });
        self.tasks.lock().unwrap().push(handle);
    }

    pub fn pause(&self) -> Result<(), ControlError> {
        match self.state() {
            SessionState::Recording => {
                self.set_state(SessionState::Paused);
                info!("recording paused");
                Ok(())
            }
            SessionState::Idle | SessionState::Completed => Err(ControlError::not_running()),
            other => Err(ControlError::wrong_mode(format!(
                "cannot pause from {other:?}"
            ))),
        }
    }

    pub fn resume(&self) -> Result<(), ControlError> {
        match self.state() {
            SessionState::Paused => {
                self.set_state(SessionState::Recording);
                info!("recording resumed");
                Ok(())
            }
            SessionState::Idle | SessionState::Completed => Err(ControlError::not_running()),
            other => Err(ControlError::wrong_mode(format!(
                "cannot resume from {other:?}"
            ))),
        }
    }

    /// Stop the session and return the buffered actions in FIFO order.
    pub async fn stop(&self) -> Result<Vec<CapturedAction>, ControlError> {
        match self.state() {
            SessionState::Recording | SessionState::Paused => {}
            SessionState::Idle | SessionState::Completed => {
                return Err(ControlError::not_running())
            }
            other => {
                return Err(ControlError::wrong_mode(format!(
                    "cannot stop from {other:?}"
                )))
            }
        }
        self.set_state(SessionState::Finalizing);

        for task in self.tasks.lock().unwrap().drain(..) {
            task.abort();
        }
        let started: Vec<&'static str> = self
            .started_layers
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, on)| **on)
            .map(|(name, _)| *name)
            .collect();
        for name in started {
            let result = match name {
                "dom" => self.layers.dom.stop(&self.target).await,
                "mouse" => self.layers.mouse.stop(&self.target).await,
                "vision" => self.layers.vision.stop(&self.target).await,
                "network" => self.layers.network.stop(&self.target).await,
                _ => Ok(()),
            };
            if let Err(e) = result {
                warn!(layer = name, "layer stop failed: {e}");
            }
        }
        self.started_layers.lock().unwrap().clear();
        if let Err(e) = self.transport.detach(&self.target).await {
            warn!("detach failed: {e}");
        }

        let drained = self.buffer.lock().unwrap().drain();
        self.set_state(SessionState::Completed);
        info!(actions = drained.len(), "recording session completed");
        Ok(drained)
    }

    /// Enable or disable a non-critical layer mid-session.
    pub async fn toggle_layer(&self, name: &str, enable: bool) -> Result<(), ControlError> {
        let key: &'static str = match name {
            "mouse" => "mouse",
            "vision" => "vision",
            "network" => "network",
            "dom" => {
                return Err(ControlError::new(
                    ControlErrorCode::InvalidArg,
                    "the DOM layer is always on",
                ))
            }
            other => {
                return Err(ControlError::new(
                    ControlErrorCode::InvalidArg,
                    format!("unknown layer '{other}'"),
                ))
            }
        };
        self.enabled.lock().unwrap().insert(key, enable);
        let started = self
            .started_layers
            .lock()
            .unwrap()
            .get(key)
            .copied()
            .unwrap_or(false);
        if enable && !started && self.state() == SessionState::Recording {
            self.init_optional(key).await;
        }
        Ok(())
    }

    pub fn buffer_stats(&self) -> BufferStats {
        self.buffer.lock().unwrap().stats()
    }

    /// Per-layer health for the session-control surface.
    pub fn layer_status(&self) -> Vec<LayerStatus> {
        let enabled = self.enabled.lock().unwrap();
        let status_of = |name: &'static str, layer: &dyn CaptureLayer| {
            if enabled.get(name).copied().unwrap_or(true) {
                layer.status()
            } else {
                LayerStatus::disabled(name)
            }
        };
        vec![
            self.layers.dom.status(),
            status_of("mouse", self.layers.mouse.as_ref()),
            status_of("vision", self.layers.vision.as_ref()),
            status_of("network", self.layers.network.as_ref()),
        ]
    }

    /// The typed page client, shared with the replay side.
    pub fn client(&self) -> &PageClient {
        &self.client
    }
}
