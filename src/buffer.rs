//! Bounded evidence buffer with garbage collection.
//!
//! Holds fully-assembled captured actions between capture and drain.
//! Two ceilings bound it: total estimated bytes and item count. When
//! occupancy crosses the GC threshold, the oldest actions are evicted
//! until occupancy falls to the GC target; evicted actions are handed
//! back to the caller so the outer controller can flush them instead
//! of losing them. Mutation is confined to the recording orchestrator
//! (writer) and the controller's drain routine (reader + eraser), so
//! the buffer itself carries no lock.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::evidence::CapturedAction;

/// Buffer bounds and GC policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BufferConfig {
    /// Byte ceiling over all buffered actions
    pub size_limit_bytes: usize,
    /// Item-count ceiling
    pub max_items: usize,
    /// Occupancy fraction that triggers GC
    pub gc_threshold: f64,
    /// Occupancy fraction GC evicts down to
    pub gc_target: f64,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            size_limit_bytes: 70 * 1024 * 1024,
            max_items: 10_000,
            gc_threshold: 0.8,
            gc_target: 0.6,
        }
    }
}

/// Buffer occupancy snapshot for the session-control surface.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BufferStats {
    pub count: usize,
    pub bytes: usize,
    pub capacity_bytes: usize,
    pub evicted: u64,
}

/// Outcome of an admission.
#[derive(Debug, Default)]
pub struct PutOutcome {
    /// Actions GC pushed out to make room, oldest first
    pub evicted: Vec<CapturedAction>,
}

/// Bounded, GC'd store of captured actions keyed by action id.
pub struct EvidenceBuffer {
    config: BufferConfig,
    entries: HashMap<Uuid, (CapturedAction, usize)>,
    order: VecDeque<Uuid>,
    bytes: usize,
    evicted: u64,
}

impl EvidenceBuffer {
    pub fn new(config: BufferConfig) -> Self {
        Self {
            config,
            entries: HashMap::new(),
            order: VecDeque::new(),
            bytes: 0,
            evicted: 0,
        }
    }

    /// Admit an action.
    ///
    /// Runs GC when occupancy crosses the threshold; returns evicted
    /// actions so the caller can flush them. Fails with `BufferFull`
    /// only if the action cannot fit even after a full GC pass.
    pub fn put(&mut self, action: CapturedAction) -> Result<PutOutcome> {
        let size = action.estimated_bytes();
        if size > self.config.size_limit_bytes {
            return Err(Error::BufferFull {
                occupancy_bytes: self.bytes,
                limit_bytes: self.config.size_limit_bytes,
            });
        }

        let mut outcome = PutOutcome::default();
        let threshold = (self.config.size_limit_bytes as f64 * self.config.gc_threshold) as usize;
        if self.bytes + size > threshold || self.order.len() >= self.config.max_items {
            self.collect(size, &mut outcome.evicted);
        }
        if self.bytes + size > self.config.size_limit_bytes {
            return Err(Error::BufferFull {
                occupancy_bytes: self.bytes,
                limit_bytes: self.config.size_limit_bytes,
            });
        }

        self.order.push_back(action.action_id);
        self.bytes += size;
        self.entries.insert(action.action_id, (action, size));
        Ok(outcome)
    }

    /// Evict oldest actions until occupancy is at the GC target and
    /// the incoming action fits.
    fn collect(&mut self, incoming: usize, evicted: &mut Vec<CapturedAction>) {
        let target = (self.config.size_limit_bytes as f64 * self.config.gc_target) as usize;
        while !self.order.is_empty()
            && (self.bytes + incoming > target || self.order.len() + 1 > self.config.max_items)
        {
            let Some(oldest) = self.order.pop_front() else {
                break;
            };
            if let Some((action, size)) = self.entries.remove(&oldest) {
                self.bytes -= size;
                self.evicted += 1;
                evicted.push(action);
            }
        }
        if !evicted.is_empty() {
            warn!(
                evicted = evicted.len(),
                occupancy = self.bytes,
                "evidence buffer GC evicted oldest actions"
            );
        }
    }

    /// Remove and return every buffered action in FIFO order.
    pub fn drain(&mut self) -> Vec<CapturedAction> {
        let mut drained = Vec::with_capacity(self.order.len());
        while let Some(id) = self.order.pop_front() {
            if let Some((action, _)) = self.entries.remove(&id) {
                drained.push(action);
            }
        }
        self.bytes = 0;
        debug!(count = drained.len(), "evidence buffer drained");
        drained
    }

    pub fn get(&self, action_id: &Uuid) -> Option<&CapturedAction> {
        self.entries.get(action_id).map(|(action, _)| action)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn stats(&self) -> BufferStats {
        BufferStats {
            count: self.order.len(),
            bytes: self.bytes,
            capacity_bytes: self.config.size_limit_bytes,
            evicted: self.evicted,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::{FallbackChain, LocatorStrategy, StrategyMetadata, StrategyType};
    use crate::evidence::{ElementDescriptor, EventType, EvidenceBundle};
    use crate::geom::Point;
    use chrono::Utc;

    fn action(padding: usize) -> CapturedAction {
        let descriptor = ElementDescriptor {
            tag_name: "button".into(),
            text: "x".repeat(padding),
            click_point: Point::new(10.0, 10.0),
            ..Default::default()
        };
        let coords = LocatorStrategy::new(
            StrategyType::Coordinates,
            None,
            StrategyMetadata::Coordinates {
                point: Point::new(10.0, 10.0),
            },
            0.6,
        );
        CapturedAction::new(
            EventType::Click,
            Utc::now(),
            None,
            EvidenceBundle::new(descriptor),
            FallbackChain::new(vec![coords]).unwrap(),
        )
    }

    #[test]
    fn test_put_then_drain_is_fifo() {
        let mut buffer = EvidenceBuffer::new(BufferConfig::default());
        let actions: Vec<CapturedAction> = (0..5).map(|_| action(10)).collect();
        let ids: Vec<Uuid> = actions.iter().map(|a| a.action_id).collect();
        for a in actions {
            buffer.put(a).unwrap();
        }

        let drained = buffer.drain();
        let drained_ids: Vec<Uuid> = drained.iter().map(|a| a.action_id).collect();
        assert_eq!(drained_ids, ids);
        assert!(buffer.is_empty());
        assert_eq!(buffer.stats().bytes, 0);
    }

    #[test]
    fn test_byte_ceiling_never_exceeded() {
        let config = BufferConfig {
            size_limit_bytes: 16 * 1024,
            ..Default::default()
        };
        let mut buffer = EvidenceBuffer::new(config.clone());
        for _ in 0..100 {
            let _ = buffer.put(action(512));
            assert!(buffer.stats().bytes <= config.size_limit_bytes);
        }
    }

    #[test]
    fn test_gc_evicts_oldest_to_target() {
        let config = BufferConfig {
            size_limit_bytes: 10 * 1024,
            gc_threshold: 0.8,
            gc_target: 0.6,
            ..Default::default()
        };
        let mut buffer = EvidenceBuffer::new(config.clone());
        let first = action(256);
        let first_id = first.action_id;
        buffer.put(first).unwrap();

        let mut all_evicted = Vec::new();
        for _ in 0..40 {
            all_evicted.extend(buffer.put(action(256)).unwrap().evicted);
        }

        assert!(!all_evicted.is_empty());
        // Oldest-first eviction starts with the first action admitted.
        assert_eq!(all_evicted[0].action_id, first_id);
        let stats = buffer.stats();
        assert!(stats.bytes <= (config.size_limit_bytes as f64 * 0.8) as usize);
        assert_eq!(stats.evicted as usize, all_evicted.len());
    }

    #[test]
    fn test_item_count_ceiling() {
        let config = BufferConfig {
            max_items: 3,
            ..Default::default()
        };
        let mut buffer = EvidenceBuffer::new(config);
        for _ in 0..10 {
            buffer.put(action(10)).unwrap();
        }
        assert!(buffer.len() <= 3);
    }

    #[test]
    fn test_oversized_action_rejected() {
        let config = BufferConfig {
            size_limit_bytes: 1024,
            ..Default::default()
        };
        let mut buffer = EvidenceBuffer::new(config);
        let err = buffer.put(action(4096)).unwrap_err();
        assert_eq!(err.kind(), "buffer_full");
    }

    #[test]
    fn test_no_duplicates_and_nothing_lost() {
        // Every admitted action either drains or comes back evicted.
        let config = BufferConfig {
            size_limit_bytes: 64 * 1024,
            ..Default::default()
        };
        let mut buffer = EvidenceBuffer::new(config);
        let mut expected: Vec<Uuid> = Vec::new();
        let mut flushed: Vec<Uuid> = Vec::new();
        for _ in 0..2_000 {
            let a = action(512);
            expected.push(a.action_id);
            let outcome = buffer.put(a).unwrap();
            flushed.extend(outcome.evicted.iter().map(|e| e.action_id));
        }
        flushed.extend(buffer.drain().iter().map(|a| a.action_id));

        assert_eq!(flushed.len(), expected.len());
        assert_eq!(flushed, expected);
    }

    #[test]
    fn test_buffer_pressure_scenario() {
        // 1 MB ceiling, 2,000 actions of roughly 2 KB each.
        let config = BufferConfig {
            size_limit_bytes: 1024 * 1024,
            ..Default::default()
        };
        let mut buffer = EvidenceBuffer::new(config.clone());
        let mut emitted = 0usize;
        for _ in 0..2_000 {
            let outcome = buffer.put(action(2_000)).unwrap();
            emitted += 1;
            let _ = outcome;
            let stats = buffer.stats();
            assert!(stats.bytes <= config.size_limit_bytes);
        }
        assert_eq!(emitted, 2_000);
        assert!(buffer.len() <= 600);
    }
}
