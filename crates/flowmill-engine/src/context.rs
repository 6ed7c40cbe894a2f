//! Runtime execution context
//!
//! Holds the node-output map for one execution. Each node has exactly one
//! successful writer per run, so the map is last-writer-wins per key; readers
//! take point-in-time snapshots instead of holding locks across template or
//! condition evaluation.

use std::collections::HashMap;

use parking_lot::RwLock;
use serde_json::{Map, Value};

use crate::config::{ContextOverflowBehavior, ContextSnapshotConfig, ContextSnapshotMode};

/// The snapshot exceeded its configured size cap under `Fail` overflow
/// behavior
#[derive(Debug, thiserror::Error)]
#[error("context snapshot is {actual} bytes, cap is {max} bytes")]
pub struct ContextOverflow {
    pub actual: usize,
    pub max: usize,
}

struct ContextData {
    /// Node ids in insertion order, oldest first (drives AutoPruneOldest)
    order: Vec<String>,
    outputs: HashMap<String, Value>,
}

/// Mutable state of a single execution
pub struct RuntimeContext {
    trigger: Value,
    correlation_id: String,
    tenant_id: Option<String>,
    /// Sub-workflow nesting depth; root executions are 0
    depth: usize,
    /// Workflow ids of ancestor executions, root first
    ancestors: Vec<String>,
    data: RwLock<ContextData>,
}

impl RuntimeContext {
    pub fn new(trigger: Value, correlation_id: impl Into<String>) -> Self {
        Self {
            trigger,
            correlation_id: correlation_id.into(),
            tenant_id: None,
            depth: 0,
            ancestors: Vec::new(),
            data: RwLock::new(ContextData {
                order: Vec::new(),
                outputs: HashMap::new(),
            }),
        }
    }

    pub fn with_tenant(mut self, tenant_id: Option<String>) -> Self {
        self.tenant_id = tenant_id;
        self
    }

    pub fn with_lineage(mut self, depth: usize, ancestors: Vec<String>) -> Self {
        self.depth = depth;
        self.ancestors = ancestors;
        self
    }

    pub fn trigger(&self) -> &Value {
        &self.trigger
    }

    pub fn correlation_id(&self) -> &str {
        &self.correlation_id
    }

    pub fn tenant_id(&self) -> Option<&str> {
        self.tenant_id.as_deref()
    }

    pub fn depth(&self) -> usize {
        self.depth
    }

    pub fn ancestors(&self) -> &[String] {
        &self.ancestors
    }

    /// Record a node's outputs; a later successful attempt overwrites
    pub fn set_output(&self, node_id: &str, outputs: Map<String, Value>) {
        let mut data = self.data.write();
        if !data.outputs.contains_key(node_id) {
            data.order.push(node_id.to_string());
        }
        data.outputs
            .insert(node_id.to_string(), Value::Object(outputs));
    }

    /// Point-in-time copy of the output map, keyed by node id
    pub fn data_snapshot(&self) -> Value {
        let data = self.data.read();
        let mut map = Map::with_capacity(data.outputs.len());
        for node_id in &data.order {
            if let Some(outputs) = data.outputs.get(node_id) {
                map.insert(node_id.clone(), outputs.clone());
            }
        }
        Value::Object(map)
    }

    /// Apply the snapshot policy and produce the persisted `{"data": ...}`
    /// document
    pub fn prune(&self, config: &ContextSnapshotConfig) -> Result<Value, ContextOverflow> {
        let data = self.data.read();

        let mut entries: Vec<(String, Value)> = data
            .order
            .iter()
            .filter_map(|node_id| {
                data.outputs
                    .get(node_id)
                    .map(|outputs| (node_id.clone(), outputs.clone()))
            })
            .collect();
        drop(data);

        match config.mode {
            ContextSnapshotMode::Full => {}
            ContextSnapshotMode::SummaryOnly => {
                for (_, value) in entries.iter_mut() {
                    *value = summarize(value);
                }
            }
            ContextSnapshotMode::KeysOnly => {
                let keep = config.keys_to_include.clone().unwrap_or_default();
                entries.retain(|(node_id, _)| keep.iter().any(|k| k == node_id));
            }
        }

        let max = config.max_context_size_bytes;
        if snapshot_size(&entries) > max {
            match config.overflow_behavior {
                ContextOverflowBehavior::Fail => {
                    return Err(ContextOverflow {
                        actual: snapshot_size(&entries),
                        max,
                    });
                }
                ContextOverflowBehavior::AutoPruneOldest => {
                    while entries.len() > 1 && snapshot_size(&entries) > max {
                        entries.remove(0);
                    }
                }
                ContextOverflowBehavior::DropOversize => {
                    // Replace the largest entries with markers until it fits
                    while snapshot_size(&entries) > max {
                        let largest = entries
                            .iter()
                            .enumerate()
                            .filter(|(_, (_, v))| !is_marker(v))
                            .max_by_key(|(_, (_, v))| value_size(v));
                        match largest {
                            Some((i, _)) => {
                                let size = value_size(&entries[i].1);
                                entries[i].1 = serde_json::json!({
                                    "truncated": true,
                                    "size": size,
                                });
                            }
                            None => break,
                        }
                    }
                }
            }
        }

        let mut map = Map::with_capacity(entries.len());
        for (node_id, value) in entries {
            map.insert(node_id, value);
        }

        let mut doc = Map::new();
        doc.insert("data".to_string(), Value::Object(map));
        Ok(Value::Object(doc))
    }
}

fn summarize(value: &Value) -> Value {
    serde_json::json!({
        "type": json_type_name(value),
        "size": value_size(value),
        "truncated": true,
    })
}

fn is_marker(value: &Value) -> bool {
    value.get("truncated").and_then(Value::as_bool) == Some(true)
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn value_size(value: &Value) -> usize {
    serde_json::to_string(value).map(|s| s.len()).unwrap_or(0)
}

fn snapshot_size(entries: &[(String, Value)]) -> usize {
    // Close enough to the serialized document size for a cap check
    entries
        .iter()
        .map(|(k, v)| k.len() + 4 + value_size(v))
        .sum()
}
