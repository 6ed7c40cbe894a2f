//! Plan compilation
//!
//! The planner turns a validated definition into the runtime plan the
//! conductor executes: adjacency lists, per-node incoming-edge counts,
//! precompiled parameter templates and edge conditions, and implicit
//! on-failure edges. Plans are immutable after compilation and shared across
//! concurrent runs of the same `(workflow_id, version)`.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::debug;

use flowmill_model::{EdgeWhen, NodeType, RoutePolicy, WorkflowDefinition};

use crate::config::option_duration_millis;
use crate::eval::{
    CompiledCondition, CompiledTemplate, ConditionEvaluator, EvalError, TemplateEvaluator,
};
use crate::retry::RetryPolicy;

/// Error compiling a definition into a plan
#[derive(Debug, thiserror::Error)]
pub enum PlanError {
    /// A parameter template failed to compile
    #[error("template compile failed on node '{node}': {source}")]
    Template { node: String, source: EvalError },

    /// An edge condition failed to compile
    #[error("condition compile failed on node '{node}' edge {edge}: {source}")]
    Condition {
        node: String,
        edge: usize,
        source: EvalError,
    },

    /// The graph (including synthesized edges) contains a cycle
    #[error("plan graph contains a cycle through node '{0}'")]
    Cycle(String),

    /// The definition references a node that does not exist
    #[error("unknown node '{0}' referenced by the definition")]
    UnknownNode(String),
}

/// What a node executes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum NodeKind {
    /// Invoke a registered action
    Action { action_type: String },
    /// Start a child workflow execution
    Subworkflow {
        workflow_id: String,
        workflow_version: Option<i32>,
        wait_for_completion: bool,
    },
}

impl NodeKind {
    /// The action type recorded on attempt rows
    pub fn action_type(&self) -> String {
        match self {
            Self::Action { action_type } => action_type.clone(),
            Self::Subworkflow { workflow_id, .. } => format!("subworkflow:{workflow_id}"),
        }
    }
}

/// A compiled node
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeDescriptor {
    pub id: String,
    pub kind: NodeKind,
    /// Precompiled parameter template tree
    pub parameters: CompiledTemplate,
    pub on_failure: Option<String>,
    /// Node-level retry override; engine default applies when absent
    pub retry: Option<RetryPolicy>,
    /// Node-level timeout override
    #[serde(with = "option_duration_millis")]
    pub timeout: Option<Duration>,
    pub rerender_on_retry: bool,
    pub route_policy: RoutePolicy,
}

/// A compiled edge
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EdgeDescriptor {
    pub target: String,
    pub when: EdgeWhen,
    pub condition: Option<CompiledCondition>,
    /// True for the implicit edge synthesized from `onFailure`
    pub synthesized: bool,
}

/// Compiled runtime plan for one definition version
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Plan {
    pub workflow_id: String,
    pub version: i32,
    pub start_node: String,
    pub nodes: HashMap<String, NodeDescriptor>,
    /// Outgoing edges per node, declaration order, synthesized edges last
    pub edges: HashMap<String, Vec<EdgeDescriptor>>,
    /// Incoming-edge count per node, counting only edges whose source is
    /// reachable from the start node
    pub expected_incoming: HashMap<String, usize>,
    /// Reverse adjacency: parents per node
    pub parents: HashMap<String, Vec<String>>,
    /// Nodes reachable from the start node
    pub reachable: HashSet<String>,
}

impl Plan {
    pub fn node(&self, id: &str) -> Option<&NodeDescriptor> {
        self.nodes.get(id)
    }

    pub fn outgoing(&self, id: &str) -> &[EdgeDescriptor] {
        self.edges.get(id).map(Vec::as_slice).unwrap_or(&[])
    }
}

/// Compiles definitions into plans
pub struct Planner {
    templates: Arc<dyn TemplateEvaluator>,
    conditions: Arc<dyn ConditionEvaluator>,
}

impl Planner {
    pub fn new(
        templates: Arc<dyn TemplateEvaluator>,
        conditions: Arc<dyn ConditionEvaluator>,
    ) -> Self {
        Self {
            templates,
            conditions,
        }
    }

    /// Compile a definition into a runtime plan
    pub fn compile(
        &self,
        definition: &WorkflowDefinition,
        version: i32,
    ) -> Result<Plan, PlanError> {
        let mut nodes = HashMap::with_capacity(definition.nodes.len());
        let mut edges: HashMap<String, Vec<EdgeDescriptor>> = HashMap::new();

        for node in &definition.nodes {
            let parameters = self
                .templates
                .compile(&serde_json::Value::Object(node.parameters.clone()))
                .map_err(|source| PlanError::Template {
                    node: node.id.clone(),
                    source,
                })?;

            let mut outgoing = Vec::with_capacity(node.edges.len() + 1);
            for (i, edge) in node.edges.iter().enumerate() {
                let condition = edge
                    .condition
                    .as_deref()
                    .map(|source| self.conditions.compile(source))
                    .transpose()
                    .map_err(|source| PlanError::Condition {
                        node: node.id.clone(),
                        edge: i,
                        source,
                    })?;

                outgoing.push(EdgeDescriptor {
                    target: edge.target_node.clone(),
                    when: edge.when,
                    condition,
                    synthesized: false,
                });
            }

            // onFailure becomes an implicit failure edge unless the node
            // already declares one explicitly.
            if let Some(on_failure) = &node.on_failure {
                let has_explicit_failure =
                    node.edges.iter().any(|e| e.when == EdgeWhen::Failure);
                if !has_explicit_failure {
                    outgoing.push(EdgeDescriptor {
                        target: on_failure.clone(),
                        when: EdgeWhen::Failure,
                        condition: None,
                        synthesized: true,
                    });
                }
            }

            let kind = match node.node_type {
                NodeType::Action => NodeKind::Action {
                    action_type: node.action_type.clone().unwrap_or_default(),
                },
                NodeType::Subworkflow => NodeKind::Subworkflow {
                    workflow_id: node.workflow_id.clone().unwrap_or_default(),
                    workflow_version: node.workflow_version,
                    wait_for_completion: node.wait_for_completion,
                },
            };

            edges.insert(node.id.clone(), outgoing);
            nodes.insert(
                node.id.clone(),
                NodeDescriptor {
                    id: node.id.clone(),
                    kind,
                    parameters,
                    on_failure: node.on_failure.clone(),
                    retry: node.policies.retry.as_ref().map(RetryPolicy::from_spec),
                    timeout: node.policies.timeout_ms.map(Duration::from_millis),
                    rerender_on_retry: node.policies.rerender_on_retry,
                    route_policy: node.route_policy,
                },
            );
        }

        if !nodes.contains_key(&definition.start_node) {
            return Err(PlanError::UnknownNode(definition.start_node.clone()));
        }
        for outgoing in edges.values() {
            for edge in outgoing {
                if !nodes.contains_key(&edge.target) {
                    return Err(PlanError::UnknownNode(edge.target.clone()));
                }
            }
        }

        if let Some(on_cycle) = find_cycle(&edges) {
            return Err(PlanError::Cycle(on_cycle));
        }

        let reachable = reachable_from(&edges, &definition.start_node);

        let mut expected_incoming: HashMap<String, usize> =
            nodes.keys().map(|id| (id.clone(), 0)).collect();
        let mut parents: HashMap<String, Vec<String>> =
            nodes.keys().map(|id| (id.clone(), Vec::new())).collect();

        for (source, outgoing) in &edges {
            if !reachable.contains(source) {
                continue;
            }
            for edge in outgoing {
                *expected_incoming.entry(edge.target.clone()).or_default() += 1;
                parents
                    .entry(edge.target.clone())
                    .or_default()
                    .push(source.clone());
            }
        }

        debug!(
            workflow_id = %definition.id,
            version,
            nodes = nodes.len(),
            reachable = reachable.len(),
            "compiled plan"
        );

        Ok(Plan {
            workflow_id: definition.id.clone(),
            version,
            start_node: definition.start_node.clone(),
            nodes,
            edges,
            expected_incoming,
            parents,
            reachable,
        })
    }
}

/// Kahn's algorithm; nodes left over after peeling sit on a cycle.
fn find_cycle(edges: &HashMap<String, Vec<EdgeDescriptor>>) -> Option<String> {
    let mut indegree: HashMap<&str, usize> = edges.keys().map(|k| (k.as_str(), 0)).collect();
    for outgoing in edges.values() {
        for edge in outgoing {
            *indegree.entry(edge.target.as_str()).or_default() += 1;
        }
    }

    let mut queue: Vec<&str> = indegree
        .iter()
        .filter(|(_, &d)| d == 0)
        .map(|(&n, _)| n)
        .collect();
    let mut seen = 0usize;

    while let Some(node) = queue.pop() {
        seen += 1;
        for edge in edges.get(node).map(Vec::as_slice).unwrap_or(&[]) {
            let degree = indegree.get_mut(edge.target.as_str()).expect("known node");
            *degree -= 1;
            if *degree == 0 {
                queue.push(edge.target.as_str());
            }
        }
    }

    if seen == indegree.len() {
        None
    } else {
        indegree
            .iter()
            .find(|(_, &d)| d > 0)
            .map(|(&n, _)| n.to_string())
    }
}

fn reachable_from(
    edges: &HashMap<String, Vec<EdgeDescriptor>>,
    start: &str,
) -> HashSet<String> {
    let mut reachable = HashSet::new();
    let mut stack = vec![start.to_string()];

    while let Some(node) = stack.pop() {
        if !reachable.insert(node.clone()) {
            continue;
        }
        for edge in edges.get(&node).map(Vec::as_slice).unwrap_or(&[]) {
            stack.push(edge.target.clone());
        }
    }

    reachable
}

/// In-process plan cache keyed by `(workflow_id, version)`
///
/// Reads are cheap shared-lock lookups; the single writer is whichever run
/// compiles a version first. Invalidated when a new version is published.
pub struct PlanCache {
    plans: RwLock<HashMap<(String, i32), Arc<Plan>>>,
}

impl PlanCache {
    pub fn new() -> Self {
        Self {
            plans: RwLock::new(HashMap::new()),
        }
    }

    pub fn get(&self, workflow_id: &str, version: i32) -> Option<Arc<Plan>> {
        self.plans
            .read()
            .get(&(workflow_id.to_string(), version))
            .cloned()
    }

    pub fn put(&self, plan: Arc<Plan>) {
        self.plans
            .write()
            .insert((plan.workflow_id.clone(), plan.version), plan);
    }

    pub fn invalidate(&self, workflow_id: &str) {
        self.plans.write().retain(|(wf, _), _| wf != workflow_id);
    }
}

impl Default for PlanCache {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::eval::{MinijinjaConditionEvaluator, MinijinjaTemplateEvaluator};
    use serde_json::json;

    fn planner() -> Planner {
        Planner::new(
            Arc::new(MinijinjaTemplateEvaluator::new()),
            Arc::new(MinijinjaConditionEvaluator::new()),
        )
    }

    fn parse(value: serde_json::Value) -> WorkflowDefinition {
        WorkflowDefinition::from_value(value).unwrap()
    }

    #[test]
    fn test_compile_linear() {
        let plan = planner()
            .compile(
                &parse(json!({
                    "id": "w",
                    "displayName": "W",
                    "startNode": "a",
                    "nodes": [
                        { "id": "a", "actionType": "core.echo",
                          "edges": [{ "targetNode": "b" }] },
                        { "id": "b", "actionType": "core.echo" }
                    ]
                })),
                1,
            )
            .unwrap();

        assert_eq!(plan.expected_incoming["a"], 0);
        assert_eq!(plan.expected_incoming["b"], 1);
        assert_eq!(plan.outgoing("a").len(), 1);
        assert_eq!(plan.parents["b"], vec!["a"]);
    }

    #[test]
    fn test_synthesized_on_failure_edge() {
        let plan = planner()
            .compile(
                &parse(json!({
                    "id": "w",
                    "displayName": "W",
                    "startNode": "a",
                    "nodes": [
                        { "id": "a", "actionType": "core.echo", "onFailure": "cleanup" },
                        { "id": "cleanup", "actionType": "core.echo" }
                    ]
                })),
                1,
            )
            .unwrap();

        let edges = plan.outgoing("a");
        assert_eq!(edges.len(), 1);
        assert!(edges[0].synthesized);
        assert_eq!(edges[0].when, EdgeWhen::Failure);
        assert_eq!(edges[0].target, "cleanup");
        assert_eq!(plan.expected_incoming["cleanup"], 1);
    }

    #[test]
    fn test_explicit_failure_edge_suppresses_synthesis() {
        let plan = planner()
            .compile(
                &parse(json!({
                    "id": "w",
                    "displayName": "W",
                    "startNode": "a",
                    "nodes": [
                        { "id": "a", "actionType": "core.echo", "onFailure": "cleanup",
                          "edges": [{ "targetNode": "handler", "when": "failure" }] },
                        { "id": "handler", "actionType": "core.echo" },
                        { "id": "cleanup", "actionType": "core.echo" }
                    ]
                })),
                1,
            )
            .unwrap();

        let edges = plan.outgoing("a");
        assert_eq!(edges.len(), 1);
        assert!(!edges[0].synthesized);
        assert_eq!(edges[0].target, "handler");
    }

    #[test]
    fn test_expected_incoming_ignores_unreachable_sources() {
        // "island" -> "b" exists but island is unreachable, so b expects only
        // the edge from a.
        let plan = planner()
            .compile(
                &parse(json!({
                    "id": "w",
                    "displayName": "W",
                    "startNode": "a",
                    "nodes": [
                        { "id": "a", "actionType": "core.echo",
                          "edges": [{ "targetNode": "b" }] },
                        { "id": "b", "actionType": "core.echo" },
                        { "id": "island", "actionType": "core.echo",
                          "edges": [{ "targetNode": "b" }] }
                    ]
                })),
                1,
            )
            .unwrap();

        assert_eq!(plan.expected_incoming["b"], 1);
        assert!(!plan.reachable.contains("island"));
    }

    #[test]
    fn test_template_syntax_error_fails_compile() {
        let err = planner()
            .compile(
                &parse(json!({
                    "id": "w",
                    "displayName": "W",
                    "startNode": "a",
                    "nodes": [
                        { "id": "a", "actionType": "core.echo",
                          "parameters": { "msg": "{{ broken" } }
                    ]
                })),
                1,
            )
            .unwrap_err();

        assert!(matches!(err, PlanError::Template { .. }));
    }

    #[test]
    fn test_condition_syntax_error_fails_compile() {
        let err = planner()
            .compile(
                &parse(json!({
                    "id": "w",
                    "displayName": "W",
                    "startNode": "a",
                    "nodes": [
                        { "id": "a", "actionType": "core.echo",
                          "edges": [{ "targetNode": "b", "condition": "1 ==" }] },
                        { "id": "b", "actionType": "core.echo" }
                    ]
                })),
                1,
            )
            .unwrap_err();

        assert!(matches!(err, PlanError::Condition { .. }));
    }

    #[test]
    fn test_cycle_via_synthesized_edge_rejected() {
        let err = planner()
            .compile(
                &parse(json!({
                    "id": "w",
                    "displayName": "W",
                    "startNode": "a",
                    "nodes": [
                        { "id": "a", "actionType": "core.echo",
                          "edges": [{ "targetNode": "b" }] },
                        { "id": "b", "actionType": "core.echo", "onFailure": "a" }
                    ]
                })),
                1,
            )
            .unwrap_err();

        assert!(matches!(err, PlanError::Cycle(_)));
    }

    #[test]
    fn test_plan_serialization_round_trip() {
        let plan = planner()
            .compile(
                &parse(json!({
                    "id": "w",
                    "displayName": "W",
                    "startNode": "a",
                    "nodes": [
                        { "id": "a", "actionType": "core.echo",
                          "parameters": { "msg": "{{ trigger.x }}" },
                          "policies": { "timeoutMs": 1000,
                            "retry": { "maxAttempts": 2, "baseDelayMs": 10,
                                       "backoffFactor": 2.0 } },
                          "edges": [{ "targetNode": "b", "condition": "true" }] },
                        { "id": "b", "actionType": "core.echo" }
                    ]
                })),
                3,
            )
            .unwrap();

        let json = serde_json::to_value(&plan).unwrap();
        let parsed: Plan = serde_json::from_value(json).unwrap();

        assert_eq!(parsed.version, 3);
        assert_eq!(parsed.nodes["a"].timeout, Some(Duration::from_millis(1000)));
        assert_eq!(
            parsed.outgoing("a")[0].condition.as_ref().unwrap().source(),
            "true"
        );
    }

    #[test]
    fn test_plan_cache() {
        let cache = PlanCache::new();
        let plan = Arc::new(
            planner()
                .compile(
                    &parse(json!({
                        "id": "w",
                        "displayName": "W",
                        "startNode": "a",
                        "nodes": [{ "id": "a", "actionType": "core.echo" }]
                    })),
                    1,
                )
                .unwrap(),
        );

        assert!(cache.get("w", 1).is_none());
        cache.put(plan.clone());
        assert!(cache.get("w", 1).is_some());

        cache.invalidate("w");
        assert!(cache.get("w", 1).is_none());
    }
}
