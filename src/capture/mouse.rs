//! Mouse capture layer: rolling kinematic trail and pattern classifier.
//!
//! Samples raw mouse events into a bounded ring buffer. Derived
//! metrics (velocity, direction changes, hesitations, pattern) are
//! computed on read, not continuously. `consume` returns the trail and
//! its summary and clears the buffer atomically.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;
use tracing::debug;

use super::{CaptureLayer, LayerStatus, MOUSE_EVENT};
use crate::error::Result;
use crate::evidence::{MouseEvidence, MousePattern, TrailPoint, TrailSummary};
use crate::geom::Point;
use crate::transport::{CommandTransport, TargetId};

/// Turns sharper than this count as direction changes.
const DIRECTION_CHANGE_DEG: f64 = 45.0;
/// A trail this fast reads as deliberate.
const DIRECT_MIN_VELOCITY: f64 = 500.0;
/// A trail this slow with many turns reads as searching.
const SEARCHING_MAX_VELOCITY: f64 = 400.0;
/// Overshoot ratio beyond which a trail is corrective.
const CORRECTIVE_OVERSHOOT_RATIO: f64 = 1.3;

/// Mouse sampling configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MouseConfig {
    /// Minimum milliseconds between samples
    pub sample_rate_ms: f64,
    /// Minimum pixels of movement per sample
    pub movement_threshold_px: f64,
    /// Ring buffer capacity
    pub max_trail_len: usize,
    /// Points older than this are pruned
    pub retention_ms: f64,
    /// Minimum dwell for a hesitation
    pub hesitation_ms: f64,
}

impl Default for MouseConfig {
    fn default() -> Self {
        Self {
            sample_rate_ms: 50.0,
            movement_threshold_px: 3.0,
            max_trail_len: 100,
            retention_ms: 5_000.0,
            hesitation_ms: 200.0,
        }
    }
}

#[derive(Default)]
struct TrailState {
    points: VecDeque<TrailPoint>,
    last_down: Option<Point>,
    pressed: bool,
}

/// Rolling kinematic mouse trail.
pub struct MouseCaptureLayer {
    transport: Arc<dyn CommandTransport>,
    config: MouseConfig,
    state: Arc<Mutex<TrailState>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl MouseCaptureLayer {
    pub fn new(transport: Arc<dyn CommandTransport>, config: MouseConfig) -> Self {
        Self {
            transport,
            config,
            state: Arc::new(Mutex::new(TrailState::default())),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Feed one raw mouse event into the trail.
    pub fn observe(&self, kind: &str, x: f64, y: f64, t: f64) {
        Self::observe_state(&self.state, &self.config, kind, x, y, t);
    }

    fn observe_state(
        state: &Mutex<TrailState>,
        config: &MouseConfig,
        kind: &str,
        x: f64,
        y: f64,
        t: f64,
    ) {
        let mut state = state.lock().unwrap();
        match kind {
            "down" => {
                state.last_down = Some(Point::new(x, y));
                state.pressed = true;
            }
            "up" => {
                state.pressed = false;
            }
            "move" => {
                let last = state.points.back().copied();
                if let Some(last) = last {
                    let dt = t - last.t;
                    let dist = last.point().distance_to(&Point::new(x, y));
                    if dt < config.sample_rate_ms || dist < config.movement_threshold_px {
                        return;
                    }
                    let velocity = dist / (dt / 1_000.0);
                    let acceleration = last
                        .velocity
                        .map(|prev| (velocity - prev) / (dt / 1_000.0));
                    let pressed = state.pressed;
                    state.points.push_back(TrailPoint {
                        x,
                        y,
                        t,
                        velocity: Some(velocity),
                        acceleration,
                        pressed: Some(pressed),
                    });
                } else {
                    let pressed = state.pressed;
                    state.points.push_back(TrailPoint {
                        x,
                        y,
                        t,
                        velocity: None,
                        acceleration: None,
                        pressed: Some(pressed),
                    });
                }
                Self::prune_locked(&mut state, config, t);
            }
            _ => {}
        }
    }

    fn prune_locked(state: &mut TrailState, config: &MouseConfig, now: f64) {
        while state.points.len() > config.max_trail_len {
            state.points.pop_front();
        }
        while state
            .points
            .front()
            .is_some_and(|p| now - p.t > config.retention_ms)
        {
            state.points.pop_front();
        }
    }

    /// Evict points older than the retention window.
    pub fn prune(&self, now: f64) {
        let mut state = self.state.lock().unwrap();
        Self::prune_locked(&mut state, &self.config, now);
    }

    /// Return the trail with its derived summary and clear the buffer.
    pub fn consume(&self) -> MouseEvidence {
        let (points, last_down) = {
            let mut state = self.state.lock().unwrap();
            let points: Vec<TrailPoint> = state.points.drain(..).collect();
            (points, state.last_down)
        };
        let summary = summarize(&points, last_down, &self.config);
        MouseEvidence { points, summary }
    }
}

#[async_trait]
impl CaptureLayer for MouseCaptureLayer {
    fn name(&self) -> &'static str {
        "mouse"
    }

    async fn start(&self, target: &TargetId) -> Result<()> {
        let mut rx = self.transport.subscribe(target, MOUSE_EVENT).await?;
        let state = self.state.clone();
        let config = self.config.clone();
        let handle = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                let kind = event.params["type"].as_str().unwrap_or_default().to_string();
                let x = event.params["x"].as_f64().unwrap_or_default();
                let y = event.params["y"].as_f64().unwrap_or_default();
                let t = event.params["t"].as_f64().unwrap_or_default();
                Self::observe_state(&state, &config, &kind, x, y, t);
            }
        });

        // Background prune so a stalled cursor does not pin stale
        // points for longer than the retention window.
        let prune_state = self.state.clone();
        let prune_config = self.config.clone();
        let pruner = tokio::spawn(async move {
            let period =
                std::time::Duration::from_millis((prune_config.retention_ms / 2.0).max(250.0) as u64);
            loop {
                tokio::time::sleep(period).await;
                let now = chrono::Utc::now().timestamp_millis() as f64;
                let mut state = prune_state.lock().unwrap();
                Self::prune_locked(&mut state, &prune_config, now);
            }
        });

        let mut tasks = self.tasks.lock().unwrap();
        tasks.push(handle);
        tasks.push(pruner);
        debug!("mouse capture layer started");
        Ok(())
    }

    async fn stop(&self, _target: &TargetId) -> Result<()> {
        for task in self.tasks.lock().unwrap().drain(..) {
            task.abort();
        }
        self.state.lock().unwrap().points.clear();
        Ok(())
    }

    fn status(&self) -> LayerStatus {
        LayerStatus::healthy(self.name())
    }
}

/// Compute the derived summary for a trail.
pub fn summarize(points: &[TrailPoint], last_down: Option<Point>, config: &MouseConfig) -> TrailSummary {
    if points.is_empty() {
        return TrailSummary {
            endpoint: last_down.unwrap_or_default(),
            ..Default::default()
        };
    }

    let endpoint = points[points.len() - 1].point();
    let mut total_distance = 0.0;
    for pair in points.windows(2) {
        total_distance += pair[0].point().distance_to(&pair[1].point());
    }
    let duration_s = (points[points.len() - 1].t - points[0].t) / 1_000.0;
    let average_velocity = if duration_s > 0.0 {
        total_distance / duration_s
    } else {
        0.0
    };

    let direction_changes = count_direction_changes(points);
    let hesitation_points = find_hesitations(points, config);
    let overshoot = overshoot_ratio(points, endpoint);

    let pattern = classify(
        points.len(),
        direction_changes,
        hesitation_points.len(),
        average_velocity,
        overshoot,
    );

    TrailSummary {
        endpoint,
        total_distance,
        average_velocity,
        direction_changes,
        hesitation_points,
        pattern,
    }
}

/// Count turns sharper than 45 degrees.
fn count_direction_changes(points: &[TrailPoint]) -> usize {
    let mut changes = 0;
    for window in points.windows(3) {
        let v1 = (
            window[1].x - window[0].x,
            window[1].y - window[0].y,
        );
        let v2 = (
            window[2].x - window[1].x,
            window[2].y - window[1].y,
        );
        let mag1 = (v1.0 * v1.0 + v1.1 * v1.1).sqrt();
        let mag2 = (v2.0 * v2.0 + v2.1 * v2.1).sqrt();
        if mag1 == 0.0 || mag2 == 0.0 {
            continue;
        }
        let cos = ((v1.0 * v2.0 + v1.1 * v2.1) / (mag1 * mag2)).clamp(-1.0, 1.0);
        if cos.acos().to_degrees() > DIRECTION_CHANGE_DEG {
            changes += 1;
        }
    }
    changes
}

/// Find dwell clusters: runs of short hops whose accumulated duration
/// reaches the hesitation threshold.
fn find_hesitations(points: &[TrailPoint], config: &MouseConfig) -> Vec<Point> {
    let near = 2.0 * config.movement_threshold_px;
    let mut hesitations = Vec::new();
    let mut run_start: Option<usize> = None;

    for i in 1..points.len() {
        let dist = points[i - 1].point().distance_to(&points[i].point());
        if dist < near {
            if run_start.is_none() {
                run_start = Some(i - 1);
            }
            continue;
        }
        if let Some(start) = run_start.take() {
            let dwell = points[i - 1].t - points[start].t;
            if dwell >= config.hesitation_ms {
                hesitations.push(points[start].point());
            }
        }
    }
    if let Some(start) = run_start {
        let dwell = points[points.len() - 1].t - points[start].t;
        if dwell >= config.hesitation_ms {
            hesitations.push(points[start].point());
        }
    }
    hesitations
}

/// How far past the endpoint the trail strayed, relative to the
/// straight-line first-to-last distance.
fn overshoot_ratio(points: &[TrailPoint], endpoint: Point) -> f64 {
    let direct = points[0].point().distance_to(&endpoint);
    if direct == 0.0 {
        return 1.0;
    }
    let furthest = points
        .iter()
        .map(|p| points[0].point().distance_to(&p.point()))
        .fold(0.0, f64::max);
    furthest / direct
}

fn classify(
    point_count: usize,
    direction_changes: usize,
    hesitations: usize,
    average_velocity: f64,
    overshoot: f64,
) -> MousePattern {
    if point_count < 2 {
        return MousePattern::Unknown;
    }
    if hesitations >= 2 {
        return MousePattern::Hesitant;
    }
    if overshoot > CORRECTIVE_OVERSHOOT_RATIO {
        return MousePattern::Corrective;
    }
    if direction_changes >= 5 && average_velocity < SEARCHING_MAX_VELOCITY {
        return MousePattern::Searching;
    }
    if direction_changes <= 2 && hesitations == 0 && average_velocity >= DIRECT_MIN_VELOCITY {
        return MousePattern::Direct;
    }
    if direction_changes <= 4 && hesitations == 0 {
        return MousePattern::Curved;
    }
    MousePattern::Unknown
}
