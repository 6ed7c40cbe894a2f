// Static graph validation
//
// Validates the structure of a parsed definition without touching any
// runtime collaborator: reference integrity, duplicate ids, acyclicity of
// the superset graph (all edges, conditions ignored, implicit on-failure
// edges included), and reachability from the start node.
//
// Unreachable nodes are warnings, not errors; everything else blocks
// publishing.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::definition::{EdgeWhen, NodeSpec, WorkflowDefinition};

/// A single validation finding, addressed by a JSON-path-like locator
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationIssue {
    /// Where in the definition the issue was found, e.g. `nodes[2].edges[0]`
    pub path: String,
    pub message: String,
}

impl ValidationIssue {
    pub fn new(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            message: message.into(),
        }
    }
}

/// Outcome of static validation
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GraphValidation {
    pub errors: Vec<ValidationIssue>,
    pub warnings: Vec<ValidationIssue>,
}

impl GraphValidation {
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Validate the static structure of a workflow definition.
pub fn validate_graph(definition: &WorkflowDefinition) -> GraphValidation {
    let mut result = GraphValidation::default();

    check_duplicate_ids(definition, &mut result);

    let ids: HashSet<&str> = definition.nodes.iter().map(|n| n.id.as_str()).collect();

    if !ids.contains(definition.start_node.as_str()) {
        result.errors.push(ValidationIssue::new(
            "startNode",
            format!("start node '{}' is not defined", definition.start_node),
        ));
    }

    for (i, node) in definition.nodes.iter().enumerate() {
        check_references(node, i, &ids, &mut result);
        check_kind_fields(node, i, &mut result);
    }

    // Graph-shape checks only make sense once references resolve.
    if result.errors.is_empty() {
        let adjacency = superset_adjacency(definition);

        if let Some(cycle_node) = find_cycle(&adjacency) {
            result.errors.push(ValidationIssue::new(
                "nodes",
                format!("workflow graph contains a cycle through node '{cycle_node}'"),
            ));
        } else {
            let reachable = reachable_from(&adjacency, &definition.start_node);
            for node in &definition.nodes {
                if !reachable.contains(node.id.as_str()) {
                    result.warnings.push(ValidationIssue::new(
                        format!("nodes[{}]", node.id),
                        format!("node '{}' is unreachable from the start node", node.id),
                    ));
                }
            }
        }
    }

    result
}

fn check_duplicate_ids(definition: &WorkflowDefinition, result: &mut GraphValidation) {
    let mut seen: HashSet<&str> = HashSet::new();
    for (i, node) in definition.nodes.iter().enumerate() {
        if !seen.insert(node.id.as_str()) {
            result.errors.push(ValidationIssue::new(
                format!("nodes[{i}].id"),
                format!("duplicate node id '{}'", node.id),
            ));
        }
    }
}

fn check_references(
    node: &NodeSpec,
    index: usize,
    ids: &HashSet<&str>,
    result: &mut GraphValidation,
) {
    for (j, edge) in node.edges.iter().enumerate() {
        if !ids.contains(edge.target_node.as_str()) {
            result.errors.push(ValidationIssue::new(
                format!("nodes[{index}].edges[{j}].targetNode"),
                format!("edge target '{}' is not defined", edge.target_node),
            ));
        }
    }

    if let Some(on_failure) = &node.on_failure {
        if !ids.contains(on_failure.as_str()) {
            result.errors.push(ValidationIssue::new(
                format!("nodes[{index}].onFailure"),
                format!("onFailure target '{on_failure}' is not defined"),
            ));
        }
    }
}

fn check_kind_fields(node: &NodeSpec, index: usize, result: &mut GraphValidation) {
    if node.is_subworkflow() {
        if node.workflow_id.is_none() {
            result.errors.push(ValidationIssue::new(
                format!("nodes[{index}].workflowId"),
                format!("sub-workflow node '{}' requires workflowId", node.id),
            ));
        }
    } else if node.action_type.is_none() {
        result.errors.push(ValidationIssue::new(
            format!("nodes[{index}].actionType"),
            format!("action node '{}' requires actionType", node.id),
        ));
    }
}

/// Superset adjacency: every declared edge plus the implicit on-failure edge
/// the planner will synthesize (skipped when an explicit failure edge exists).
pub(crate) fn superset_adjacency(
    definition: &WorkflowDefinition,
) -> HashMap<&str, Vec<&str>> {
    let mut adjacency: HashMap<&str, Vec<&str>> = HashMap::new();

    for node in &definition.nodes {
        let targets = adjacency.entry(node.id.as_str()).or_default();

        for edge in &node.edges {
            targets.push(edge.target_node.as_str());
        }

        if let Some(on_failure) = &node.on_failure {
            let has_explicit_failure =
                node.edges.iter().any(|e| e.when == EdgeWhen::Failure);
            if !has_explicit_failure {
                targets.push(on_failure.as_str());
            }
        }
    }

    adjacency
}

/// Three-color DFS; returns a node on a cycle if one exists.
fn find_cycle<'a>(adjacency: &HashMap<&'a str, Vec<&'a str>>) -> Option<&'a str> {
    #[derive(Clone, Copy, PartialEq)]
    enum Color {
        White,
        Gray,
        Black,
    }

    let mut colors: HashMap<&str, Color> =
        adjacency.keys().map(|&k| (k, Color::White)).collect();

    fn visit<'a>(
        node: &'a str,
        adjacency: &HashMap<&'a str, Vec<&'a str>>,
        colors: &mut HashMap<&'a str, Color>,
    ) -> Option<&'a str> {
        colors.insert(node, Color::Gray);
        for &next in adjacency.get(node).map(Vec::as_slice).unwrap_or(&[]) {
            match colors.get(next).copied().unwrap_or(Color::White) {
                Color::Gray => return Some(next),
                Color::White => {
                    if let Some(found) = visit(next, adjacency, colors) {
                        return Some(found);
                    }
                }
                Color::Black => {}
            }
        }
        colors.insert(node, Color::Black);
        None
    }

    let nodes: Vec<&str> = colors.keys().copied().collect();
    for node in nodes {
        if colors[node] == Color::White {
            if let Some(found) = visit(node, adjacency, &mut colors) {
                return Some(found);
            }
        }
    }
    None
}

/// Nodes reachable from `start` in the superset graph (including `start`).
pub(crate) fn reachable_from<'a>(
    adjacency: &HashMap<&'a str, Vec<&'a str>>,
    start: &'a str,
) -> HashSet<&'a str> {
    let mut reachable = HashSet::new();
    let mut stack = vec![start];

    while let Some(node) = stack.pop() {
        if !reachable.insert(node) {
            continue;
        }
        if let Some(targets) = adjacency.get(node) {
            stack.extend(targets.iter().copied());
        }
    }

    reachable
}
