//! Network capture layer: request tracking and idle detection.
//!
//! A page-world interceptor wraps fetch/XHR and reports request
//! lifecycle events through the transport; this layer keeps the
//! pending set, a bounded history of recent completions, and the page
//! load signals. The wrapping is installed on start and reversed on
//! stop; a failed restore is a warning, not fatal.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

use super::{CaptureLayer, LayerStatus, LIFECYCLE_EVENT, NETWORK_EVENT};
use crate::error::{Error, Result};
use crate::evidence::{NetworkEvidence, PageLoadState};
use crate::transport::{PageClient, TargetId};

/// Script evaluated in the page to install the fetch/XHR wrapper.
pub(crate) const INSTALL_EXPRESSION: &str = "__replay.netInstall()";
/// Script evaluated to restore the original entry points.
pub(crate) const RESTORE_EXPRESSION: &str = "__replay.netRestore()";

/// Network layer configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// URL patterns (regex) that are never tracked
    pub ignore_patterns: Vec<String>,
    /// Bound on the recent-completions history
    pub recent_limit: usize,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            ignore_patterns: Vec::new(),
            recent_limit: 50,
        }
    }
}

/// One observed request.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackedRequest {
    pub id: String,
    pub url: String,
    pub method: String,
    #[serde(rename = "type")]
    pub resource_type: String,
    pub start_time: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size_bytes: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    pub pending: bool,
}

struct NetworkState {
    pending: HashMap<String, TrackedRequest>,
    recent: VecDeque<TrackedRequest>,
    last_activity: Option<Instant>,
    load_state: PageLoadState,
    installed: bool,
    restore_warning: Option<String>,
}

impl NetworkState {
    fn new() -> Self {
        Self {
            pending: HashMap::new(),
            recent: VecDeque::new(),
            last_activity: None,
            load_state: PageLoadState::Loading,
            installed: false,
            restore_warning: None,
        }
    }
}

/// Tracks page network activity through transport events.
pub struct NetworkCaptureLayer {
    client: PageClient,
    config: NetworkConfig,
    ignore: Vec<Regex>,
    state: Arc<Mutex<NetworkState>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl NetworkCaptureLayer {
    pub fn new(client: PageClient, config: NetworkConfig) -> Self {
        let ignore = config
            .ignore_patterns
            .iter()
            .filter_map(|p| Regex::new(p).ok())
            .collect();
        Self {
            client,
            config,
            ignore,
            state: Arc::new(Mutex::new(NetworkState::new())),
            tasks: Mutex::new(Vec::new()),
        }
    }

    fn is_ignored(&self, url: &str) -> bool {
        self.ignore.iter().any(|re| re.is_match(url))
    }

    /// Record a request start.
    pub fn observe_start(&self, id: &str, url: &str, method: &str, resource_type: &str) {
        if self.is_ignored(url) {
            return;
        }
        Self::track_start(&self.state, id, url, method, resource_type);
    }

    /// Record a request completion or error.
    pub fn observe_end(&self, id: &str, status: Option<u16>, size_bytes: Option<u64>) {
        Self::track_end(&self.state, self.config.recent_limit, id, status, size_bytes);
    }

    fn track_start(
        state: &Mutex<NetworkState>,
        id: &str,
        url: &str,
        method: &str,
        resource_type: &str,
    ) {
        let mut state = state.lock().unwrap();
        state.pending.insert(
            id.to_string(),
            TrackedRequest {
                id: id.to_string(),
                url: url.to_string(),
                method: method.to_string(),
                resource_type: resource_type.to_string(),
                start_time: Utc::now(),
                end_time: None,
                status: None,
                size_bytes: None,
                duration_ms: None,
                pending: true,
            },
        );
        state.last_activity = Some(Instant::now());
    }

    fn track_end(
        state: &Mutex<NetworkState>,
        recent_limit: usize,
        id: &str,
        status: Option<u16>,
        size_bytes: Option<u64>,
    ) {
        let mut state = state.lock().unwrap();
        let Some(mut request) = state.pending.remove(id) else {
            return;
        };
        let end = Utc::now();
        request.duration_ms = Some((end - request.start_time).num_milliseconds().max(0) as u64);
        request.end_time = Some(end);
        request.status = status;
        request.size_bytes = size_bytes;
        request.pending = false;
        state.recent.push_back(request);
        while state.recent.len() > recent_limit {
            state.recent.pop_front();
        }
        state.last_activity = Some(Instant::now());
    }

    fn observe_lifecycle(&self, signal: &str) {
        let mut state = self.state.lock().unwrap();
        state.load_state = match signal {
            "domcontentloaded" => PageLoadState::DomContentLoaded,
            "load" => PageLoadState::Complete,
            _ => state.load_state,
        };
    }

    pub fn pending_count(&self) -> usize {
        self.state.lock().unwrap().pending.len()
    }

    pub fn pending_urls(&self) -> Vec<String> {
        self.state
            .lock()
            .unwrap()
            .pending
            .values()
            .map(|r| r.url.clone())
            .collect()
    }

    /// Recent completions, oldest first.
    pub fn recent(&self) -> Vec<TrackedRequest> {
        self.state.lock().unwrap().recent.iter().cloned().collect()
    }

    /// No pending requests and no activity for at least the threshold.
    pub fn is_idle(&self, threshold_ms: u64) -> bool {
        let state = self.state.lock().unwrap();
        if !state.pending.is_empty() {
            return false;
        }
        match state.last_activity {
            Some(at) => at.elapsed() >= Duration::from_millis(threshold_ms),
            None => true,
        }
    }

    /// Await network idle, or time out.
    pub async fn wait_for_idle(&self, threshold_ms: u64, timeout_ms: u64) -> Result<()> {
        let deadline = Instant::now() + Duration::from_millis(timeout_ms);
        loop {
            if self.is_idle(threshold_ms) {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(Error::timeout(timeout_ms));
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    }

    /// Await a completion whose URL matches the pattern.
    pub async fn wait_for_request(&self, pattern: &str, timeout_ms: u64) -> Result<TrackedRequest> {
        let re = Regex::new(pattern).map_err(|e| Error::Config(format!("bad pattern: {e}")))?;
        let deadline = Instant::now() + Duration::from_millis(timeout_ms);
        loop {
            {
                let state = self.state.lock().unwrap();
                if let Some(found) = state.recent.iter().rev().find(|r| re.is_match(&r.url)) {
                    return Ok(found.clone());
                }
            }
            if Instant::now() >= deadline {
                return Err(Error::timeout(timeout_ms));
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    }

    /// Snapshot for an evidence bundle.
    pub fn snapshot(&self) -> NetworkEvidence {
        let state = self.state.lock().unwrap();
        NetworkEvidence {
            pending_count: state.pending.len(),
            pending_urls: state.pending.values().map(|r| r.url.clone()).collect(),
            network_idle_ms: state
                .last_activity
                .map(|at| at.elapsed().as_millis() as u64)
                .unwrap_or(u64::MAX),
            page_load_state: state.load_state,
        }
    }
}

#[async_trait]
impl CaptureLayer for NetworkCaptureLayer {
    fn name(&self) -> &'static str {
        "network"
    }

    async fn start(&self, target: &TargetId) -> Result<()> {
        self.client
            .eval(target, INSTALL_EXPRESSION)
            .await
            .map_err(|e| Error::init_failed(self.name(), e.to_string()))?;
        self.state.lock().unwrap().installed = true;

        let mut network_rx = self.client.transport().subscribe(target, NETWORK_EVENT).await?;
        let mut lifecycle_rx = self
            .client
            .transport()
            .subscribe(target, LIFECYCLE_EVENT)
            .await?;

        let layer_state = self.state.clone();
        let ignore = self.ignore.clone();
        let recent_limit = self.config.recent_limit;
        let network_task = tokio::spawn(async move {
            while let Some(event) = network_rx.recv().await {
                let p = &event.params;
                let phase = p["phase"].as_str().unwrap_or_default();
                let id = p["id"].as_str().unwrap_or_default().to_string();
                match phase {
                    "start" => {
                        let url = p["url"].as_str().unwrap_or_default();
                        if ignore.iter().any(|re| re.is_match(url)) {
                            continue;
                        }
                        Self::track_start(
                            &layer_state,
                            &id,
                            url,
                            p["method"].as_str().unwrap_or("GET"),
                            p["type"].as_str().unwrap_or("fetch"),
                        );
                    }
                    "finish" | "error" => {
                        Self::track_end(
                            &layer_state,
                            recent_limit,
                            &id,
                            p["status"].as_u64().map(|s| s as u16),
                            p["size"].as_u64(),
                        );
                    }
                    _ => {}
                }
            }
        });

        let lifecycle_state = self.state.clone();
        let lifecycle_task = tokio::spawn(async move {
            while let Some(event) = lifecycle_rx.recv().await {
                let signal = event.params["state"].as_str().unwrap_or_default();
                let mut state = lifecycle_state.lock().unwrap();
                state.load_state = match signal {
                    "domcontentloaded" => PageLoadState::DomContentLoaded,
                    "load" => PageLoadState::Complete,
                    _ => state.load_state,
                };
            }
        });

        let mut tasks = self.tasks.lock().unwrap();
        tasks.push(network_task);
        tasks.push(lifecycle_task);
        debug!("network capture layer started");
        Ok(())
    }

    async fn stop(&self, target: &TargetId) -> Result<()> {
        for task in self.tasks.lock().unwrap().drain(..) {
            task.abort();
        }
        let installed = self.state.lock().unwrap().installed;
        if installed {
            if let Err(e) = self.client.eval(target, RESTORE_EXPRESSION).await {
                warn!("failed to restore page fetch/XHR wrappers: {e}");
                self.state.lock().unwrap().restore_warning = Some(e.to_string());
            } else {
                self.state.lock().unwrap().installed = false;
            }
        }
        Ok(())
    }

    fn status(&self) -> LayerStatus {
        let state = self.state.lock().unwrap();
        match &state.restore_warning {
            Some(reason) => LayerStatus::degraded(self.name(), reason.clone()),
            None => LayerStatus::healthy(self.name()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::fake::FakeTransport;

    fn layer_with(config: NetworkConfig) -> (NetworkCaptureLayer, Arc<FakeTransport>) {
        let transport = Arc::new(FakeTransport::default());
        let layer = NetworkCaptureLayer::new(PageClient::new(transport.clone()), config);
        (layer, transport)
    }

    fn layer() -> (NetworkCaptureLayer, Arc<FakeTransport>) {
        layer_with(NetworkConfig::default())
    }

    #[test]
    fn test_pending_then_complete() {
        let (layer, _) = layer();
        layer.observe_start("r1", "https://api.test/users", "GET", "fetch");
        assert_eq!(layer.pending_count(), 1);
        assert_eq!(layer.pending_urls(), vec!["https://api.test/users"]);

        layer.observe_end("r1", Some(200), Some(1_024));
        assert_eq!(layer.pending_count(), 0);
        let recent = layer.recent();
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].status, Some(200));
        assert!(!recent[0].pending);
    }

    #[test]
    fn test_ignore_patterns_filter_beacons() {
        let (layer, _) = layer_with(NetworkConfig {
            ignore_patterns: vec!["analytics".into(), r"telemetry\.example".into()],
            ..Default::default()
        });
        layer.observe_start("r1", "https://analytics.test/beacon", "POST", "fetch");
        layer.observe_start("r2", "https://telemetry.example/v1", "POST", "xhr");
        layer.observe_start("r3", "https://api.test/data", "GET", "fetch");

        assert_eq!(layer.pending_count(), 1);
    }

    #[test]
    fn test_recent_history_is_bounded() {
        let (layer, _) = layer_with(NetworkConfig {
            recent_limit: 5,
            ..Default::default()
        });
        for i in 0..20 {
            let id = format!("r{i}");
            layer.observe_start(&id, &format!("https://api.test/{i}"), "GET", "fetch");
            layer.observe_end(&id, Some(200), None);
        }
        let recent = layer.recent();
        assert_eq!(recent.len(), 5);
        assert_eq!(recent[0].url, "https://api.test/15");
    }

    #[tokio::test(start_paused = true)]
    async fn test_is_idle_requires_quiet_window() {
        let (layer, _) = layer();
        assert!(layer.is_idle(500));

        layer.observe_start("r1", "https://api.test/a", "GET", "fetch");
        assert!(!layer.is_idle(500));

        layer.observe_end("r1", Some(200), None);
        assert!(!layer.is_idle(500));

        tokio::time::advance(Duration::from_millis(600)).await;
        assert!(layer.is_idle(500));
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_for_idle_times_out_with_pending() {
        let (layer, _) = layer();
        layer.observe_start("r1", "https://api.test/slow", "GET", "fetch");

        let err = layer.wait_for_idle(100, 300).await.unwrap_err();
        assert_eq!(err.kind(), "timeout");
    }

    #[tokio::test]
    async fn test_wait_for_request_matches_completion() {
        let (layer, _) = layer();
        layer.observe_start("r1", "https://api.test/orders/42", "POST", "fetch");
        layer.observe_end("r1", Some(201), None);

        let found = layer.wait_for_request(r"/orders/\d+", 100).await.unwrap();
        assert_eq!(found.status, Some(201));
    }

    #[tokio::test]
    async fn test_install_and_restore_round_trip() {
        let (layer, transport) = layer();
        let target = TargetId::new("t1");
        layer.start(&target).await.unwrap();
        layer.stop(&target).await.unwrap();

        let evals: Vec<String> = transport
            .sent_matching("runtime.eval")
            .iter()
            .filter_map(|(_, p)| p["expression"].as_str().map(String::from))
            .collect();
        assert!(evals.contains(&INSTALL_EXPRESSION.to_string()));
        assert!(evals.contains(&RESTORE_EXPRESSION.to_string()));
        assert!(layer.status().healthy);
    }

    #[tokio::test]
    async fn test_restore_failure_is_warning_not_fatal() {
        let (layer, transport) = layer();
        let target = TargetId::new("t1");
        layer.start(&target).await.unwrap();
        // Every retry of the restore eval fails.
        transport.fail_next("runtime.eval", 10);
        layer.stop(&target).await.unwrap();

        let status = layer.status();
        assert!(!status.healthy);
        assert!(status.degraded_reason.is_some());
    }

    #[tokio::test]
    async fn test_transport_events_drive_tracking() {
        let (layer, transport) = layer();
        let target = TargetId::new("t1");
        layer.start(&target).await.unwrap();

        transport
            .emit(
                &target,
                NETWORK_EVENT,
                serde_json::json!({
                    "phase": "start", "id": "r1",
                    "url": "https://api.test/live", "method": "GET", "type": "fetch",
                }),
            )
            .await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(layer.pending_count(), 1);

        transport
            .emit(
                &target,
                NETWORK_EVENT,
                serde_json::json!({ "phase": "finish", "id": "r1", "status": 200 }),
            )
            .await;
        transport
            .emit(
                &target,
                LIFECYCLE_EVENT,
                serde_json::json!({ "state": "load" }),
            )
            .await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(layer.pending_count(), 0);
        let snapshot = layer.snapshot();
        assert_eq!(snapshot.page_load_state, PageLoadState::Complete);
        layer.stop(&target).await.unwrap();
    }
}
