//! Accessibility view: cached semantic tree with role/name lookup.
//!
//! Fetches the accessibility tree through the transport on cache miss
//! or forced refresh, then answers traversal queries locally. Hidden
//! and ignored nodes are excluded unless a query opts in. Consumers
//! that need a post-mutation view must force a refresh; the cache only
//! expires on TTL otherwise.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::debug;

use crate::error::Result;
use crate::transport::{NodeRef, PageClient, TargetId};

/// Confidence of a role-only match.
pub const ROLE_MATCH_CONFIDENCE: f64 = 0.85;
/// Confidence of a role+name match.
pub const ROLE_NAME_MATCH_CONFIDENCE: f64 = 0.95;

/// Accessibility view configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AxConfig {
    /// Cache time-to-live in milliseconds
    pub ttl_ms: u64,
}

impl Default for AxConfig {
    fn default() -> Self {
        Self { ttl_ms: 1_000 }
    }
}

/// One node of the semantic tree.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AxNode {
    #[serde(rename = "backendNodeId")]
    pub node: NodeRef,
    #[serde(default)]
    pub role: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub hidden: bool,
    #[serde(default)]
    pub ignored: bool,
    #[serde(default)]
    pub states: Vec<String>,
    #[serde(default)]
    pub level: Option<u32>,
}

/// A tree node matched by a query, with the transport handle needed
/// for interaction.
#[derive(Debug, Clone)]
pub struct AxMatch {
    pub node: AxNode,
    pub confidence: f64,
}

/// Name matching mode for role queries.
#[derive(Debug, Clone, Default)]
pub enum NameMatch {
    /// No name constraint
    #[default]
    Any,
    /// Substring, case-insensitive
    Contains(String),
    /// Full string equality
    Exact(String),
    /// Caller-supplied regex
    Pattern(String),
}

/// Query for [`AccessibilityView::find_by_role`].
#[derive(Debug, Clone, Default)]
pub struct RoleQuery {
    pub role: String,
    pub name: NameMatch,
    /// Required state flags, all must be present
    pub states: Vec<String>,
    pub level: Option<u32>,
    /// Include hidden/ignored nodes
    pub include_hidden: bool,
}

impl RoleQuery {
    pub fn new(role: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            ..Default::default()
        }
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = NameMatch::Contains(name.into());
        self
    }

    pub fn named_exact(mut self, name: impl Into<String>) -> Self {
        self.name = NameMatch::Exact(name.into());
        self
    }
}

struct CachedTree {
    nodes: Vec<AxNode>,
    fetched_at: Instant,
}

/// Per-target cached semantic tree.
pub struct AccessibilityView {
    client: PageClient,
    ttl: Duration,
    cache: RwLock<HashMap<TargetId, CachedTree>>,
}

impl AccessibilityView {
    pub fn new(client: PageClient, config: AxConfig) -> Self {
        Self {
            client,
            ttl: Duration::from_millis(config.ttl_ms),
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// The full tree, from cache when fresh.
    pub async fn tree(&self, target: &TargetId) -> Result<Vec<AxNode>> {
        {
            let cache = self.cache.read().await;
            if let Some(entry) = cache.get(target) {
                if entry.fetched_at.elapsed() < self.ttl {
                    return Ok(entry.nodes.clone());
                }
            }
        }
        self.refresh(target).await
    }

    /// Drop the cache and fetch a fresh tree.
    pub async fn refresh(&self, target: &TargetId) -> Result<Vec<AxNode>> {
        let raw = self.client.accessibility_tree(target).await?;
        let nodes: Vec<AxNode> = serde_json::from_value(raw["nodes"].clone())?;
        debug!(target = %target, nodes = nodes.len(), "accessibility tree fetched");
        let mut cache = self.cache.write().await;
        cache.insert(
            target.clone(),
            CachedTree {
                nodes: nodes.clone(),
                fetched_at: Instant::now(),
            },
        );
        Ok(nodes)
    }

    /// Invalidate the cached tree for a target.
    pub async fn invalidate(&self, target: &TargetId) {
        self.cache.write().await.remove(target);
    }

    /// Find nodes by role, optionally constrained by name/states/level.
    pub async fn find_by_role(&self, target: &TargetId, query: &RoleQuery) -> Result<Vec<AxMatch>> {
        let nodes = self.tree(target).await?;
        let named = !matches!(query.name, NameMatch::Any);
        let confidence = if named {
            ROLE_NAME_MATCH_CONFIDENCE
        } else {
            ROLE_MATCH_CONFIDENCE
        };
        let pattern = match &query.name {
            NameMatch::Pattern(p) => Some(Regex::new(p).map_err(|e| {
                crate::error::Error::Config(format!("invalid name pattern: {e}"))
            })?),
            _ => None,
        };

        Ok(nodes
            .into_iter()
            .filter(|n| query.include_hidden || (!n.hidden && !n.ignored))
            .filter(|n| n.role.eq_ignore_ascii_case(&query.role))
            .filter(|n| match &query.name {
                NameMatch::Any => true,
                NameMatch::Contains(s) => n.name.to_lowercase().contains(&s.to_lowercase()),
                NameMatch::Exact(s) => n.name == *s,
                NameMatch::Pattern(_) => pattern.as_ref().is_some_and(|re| re.is_match(&n.name)),
            })
            .filter(|n| query.states.iter().all(|s| n.states.contains(s)))
            .filter(|n| query.level.is_none() || n.level == query.level)
            .map(|node| AxMatch { node, confidence })
            .collect())
    }

    /// Find nodes whose accessible name matches a label.
    pub async fn find_by_label(
        &self,
        target: &TargetId,
        label: &str,
        exact: bool,
    ) -> Result<Vec<AxMatch>> {
        self.find_by_name(target, label, exact).await
    }

    /// Find nodes by rendered text (accessible name of text nodes and
    /// named containers alike).
    pub async fn find_by_text(
        &self,
        target: &TargetId,
        text: &str,
        exact: bool,
    ) -> Result<Vec<AxMatch>> {
        self.find_by_name(target, text, exact).await
    }

    /// Find nodes by accessible description.
    pub async fn find_by_description(
        &self,
        target: &TargetId,
        description: &str,
        exact: bool,
    ) -> Result<Vec<AxMatch>> {
        let nodes = self.tree(target).await?;
        Ok(nodes
            .into_iter()
            .filter(|n| !n.hidden && !n.ignored)
            .filter(|n| match &n.description {
                Some(d) if exact => d == description,
                Some(d) => d.to_lowercase().contains(&description.to_lowercase()),
                None => false,
            })
            .map(|node| AxMatch {
                node,
                confidence: ROLE_MATCH_CONFIDENCE,
            })
            .collect())
    }

    async fn find_by_name(&self, target: &TargetId, name: &str, exact: bool) -> Result<Vec<AxMatch>> {
        let nodes = self.tree(target).await?;
        Ok(nodes
            .into_iter()
            .filter(|n| !n.hidden && !n.ignored)
            .filter(|n| {
                if exact {
                    n.name == name
                } else {
                    n.name.to_lowercase().contains(&name.to_lowercase())
                }
            })
            .map(|node| AxMatch {
                node,
                confidence: ROLE_NAME_MATCH_CONFIDENCE,
            })
            .collect())
    }
}
