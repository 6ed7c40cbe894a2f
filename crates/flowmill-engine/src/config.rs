//! Engine configuration
//!
//! A single `EngineConfig` snapshot is taken at startup and shared across all
//! executions; there is no hot reload.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::retry::RetryPolicy;

/// How the context snapshot is reduced at completion
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ContextSnapshotMode {
    /// Persist every node's outputs
    #[default]
    Full,
    /// Persist only per-node size/type summaries
    SummaryOnly,
    /// Persist only the configured keys
    KeysOnly,
}

/// What to do when the pruned snapshot still exceeds the size cap
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ContextOverflowBehavior {
    /// Refuse to persist a snapshot (the execution still completes)
    Fail,
    /// Drop oldest node outputs until the snapshot fits
    #[default]
    AutoPruneOldest,
    /// Replace individual oversized outputs with size markers
    DropOversize,
}

/// Context snapshot policy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContextSnapshotConfig {
    #[serde(default)]
    pub mode: ContextSnapshotMode,

    /// Keys retained by `KeysOnly` mode
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keys_to_include: Option<Vec<String>>,

    /// Upper bound on the serialized snapshot, in bytes
    #[serde(default = "default_max_context_size_bytes")]
    pub max_context_size_bytes: usize,

    #[serde(default)]
    pub overflow_behavior: ContextOverflowBehavior,
}

fn default_max_context_size_bytes() -> usize {
    10 * 1024 * 1024
}

impl Default for ContextSnapshotConfig {
    fn default() -> Self {
        Self {
            mode: ContextSnapshotMode::default(),
            keys_to_include: None,
            max_context_size_bytes: default_max_context_size_bytes(),
            overflow_behavior: ContextOverflowBehavior::default(),
        }
    }
}

/// Sub-workflow invocation limits
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubworkflowOptions {
    /// Maximum nesting depth; the root execution is depth 0
    #[serde(default = "default_max_nesting_depth")]
    pub max_nesting_depth: usize,

    /// Whether a workflow may appear in its own ancestor chain
    #[serde(default)]
    pub allow_recursion: bool,

    /// Workflow timeout applied to child executions
    #[serde(default = "default_child_timeout", with = "duration_millis")]
    pub default_child_timeout: Duration,
}

fn default_max_nesting_depth() -> usize {
    5
}

fn default_child_timeout() -> Duration {
    Duration::from_secs(3600)
}

impl Default for SubworkflowOptions {
    fn default() -> Self {
        Self {
            max_nesting_depth: default_max_nesting_depth(),
            allow_recursion: false,
            default_child_timeout: default_child_timeout(),
        }
    }
}

/// Catalog behavior toggles
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct CatalogOptions {
    /// Register built-in actions when the engine is constructed
    #[serde(default)]
    pub auto_register_actions_on_startup: bool,

    /// Validate registered parameter/output schemas at startup
    #[serde(default)]
    pub validate_action_schemas_on_startup: bool,

    /// Allow starting executions against Draft workflows
    #[serde(default)]
    pub allow_draft_execution: bool,
}

/// Remote connector endpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectorConfig {
    /// Base URL of the connector service
    pub url: String,
}

/// Engine configuration snapshot
///
/// # Example
///
/// ```
/// use flowmill_engine::EngineConfig;
/// use std::time::Duration;
///
/// let config = EngineConfig::default()
///     .with_max_parallel_actions(4)
///     .with_default_action_timeout(Duration::from_secs(30));
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineConfig {
    /// Process-wide ceiling on concurrently executing actions
    #[serde(default = "default_max_parallel_actions")]
    pub max_parallel_actions: usize,

    /// Per-node timeout when the node does not set one
    #[serde(default = "default_action_timeout", with = "duration_millis")]
    pub default_action_timeout: Duration,

    /// Workflow timeout for root executions
    #[serde(default = "default_workflow_timeout", with = "duration_millis")]
    pub default_workflow_timeout: Duration,

    /// Retry policy when the node does not set one
    #[serde(default)]
    pub retry: RetryPolicy,

    #[serde(default)]
    pub subworkflow: SubworkflowOptions,

    #[serde(default)]
    pub context_snapshot: ContextSnapshotConfig,

    #[serde(default)]
    pub catalog: CatalogOptions,

    /// Connector id -> endpoint for remote actions
    #[serde(default)]
    pub connectors: HashMap<String, ConnectorConfig>,
}

fn default_max_parallel_actions() -> usize {
    10
}

fn default_action_timeout() -> Duration {
    Duration::from_secs(300)
}

fn default_workflow_timeout() -> Duration {
    Duration::from_secs(3600)
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_parallel_actions: default_max_parallel_actions(),
            default_action_timeout: default_action_timeout(),
            default_workflow_timeout: default_workflow_timeout(),
            retry: RetryPolicy::default(),
            subworkflow: SubworkflowOptions::default(),
            context_snapshot: ContextSnapshotConfig::default(),
            catalog: CatalogOptions::default(),
            connectors: HashMap::new(),
        }
    }
}

impl EngineConfig {
    /// Set the global action concurrency ceiling
    pub fn with_max_parallel_actions(mut self, max: usize) -> Self {
        self.max_parallel_actions = max.max(1);
        self
    }

    /// Set the default per-node timeout
    pub fn with_default_action_timeout(mut self, timeout: Duration) -> Self {
        self.default_action_timeout = timeout;
        self
    }

    /// Set the default workflow timeout
    pub fn with_default_workflow_timeout(mut self, timeout: Duration) -> Self {
        self.default_workflow_timeout = timeout;
        self
    }

    /// Set the default retry policy
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Set sub-workflow limits
    pub fn with_subworkflow(mut self, options: SubworkflowOptions) -> Self {
        self.subworkflow = options;
        self
    }

    /// Set the context snapshot policy
    pub fn with_context_snapshot(mut self, config: ContextSnapshotConfig) -> Self {
        self.context_snapshot = config;
        self
    }

    /// Allow executions against Draft workflows
    pub fn with_allow_draft_execution(mut self, allow: bool) -> Self {
        self.catalog.allow_draft_execution = allow;
        self
    }

    /// Add a remote connector endpoint
    pub fn with_connector(mut self, id: impl Into<String>, url: impl Into<String>) -> Self {
        self.connectors
            .insert(id.into(), ConnectorConfig { url: url.into() });
        self
    }
}

/// Serde support for Option<Duration> as milliseconds
pub(crate) mod option_duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match duration {
            Some(d) => d.as_millis().serialize(serializer),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis: Option<u64> = Option::deserialize(deserializer)?;
        Ok(millis.map(Duration::from_millis))
    }
}

/// Serde support for Duration as milliseconds
pub(crate) mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.as_millis().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.max_parallel_actions, 10);
        assert_eq!(config.default_action_timeout, Duration::from_secs(300));
        assert_eq!(config.default_workflow_timeout, Duration::from_secs(3600));
        assert_eq!(config.subworkflow.max_nesting_depth, 5);
        assert!(!config.subworkflow.allow_recursion);
        assert_eq!(
            config.context_snapshot.max_context_size_bytes,
            10 * 1024 * 1024
        );
        assert!(!config.catalog.allow_draft_execution);
    }

    #[test]
    fn test_builders() {
        let config = EngineConfig::default()
            .with_max_parallel_actions(0)
            .with_connector("slack", "http://slack-connector:8080");

        // Clamped to at least one permit
        assert_eq!(config.max_parallel_actions, 1);
        assert_eq!(
            config.connectors["slack"].url,
            "http://slack-connector:8080"
        );
    }

    #[test]
    fn test_deserialize_empty_object_gets_defaults() {
        let config: EngineConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config, EngineConfig::default());
    }

    #[test]
    fn test_duration_round_trip() {
        let config = EngineConfig::default()
            .with_default_action_timeout(Duration::from_millis(1500));

        let json = serde_json::to_string(&config).unwrap();
        let parsed: EngineConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.default_action_timeout, Duration::from_millis(1500));
    }
}
