//! Publish-time validation
//!
//! Publishing mints an immutable version, so everything that can be checked
//! statically is checked here: graph structure, action availability in the
//! registry, template and condition syntax, and a warning-level dry render
//! against an empty context. A definition that fails validation never
//! becomes an executable version.

use std::sync::Arc;

use serde_json::Value;

use flowmill_model::{validate_graph, ValidationIssue, WorkflowDefinition};

use crate::eval::{ConditionEvaluator, EvalContext, TemplateEvaluator};
use crate::registry::ActionRegistry;

/// Outcome of publish validation
#[derive(Debug, Clone, Default)]
pub struct PublishValidationResult {
    pub is_valid: bool,
    pub errors: Vec<ValidationIssue>,
    pub warnings: Vec<ValidationIssue>,
}

/// Composes static graph validation with registry and evaluator checks
pub struct PublishValidator {
    registry: Arc<ActionRegistry>,
    templates: Arc<dyn TemplateEvaluator>,
    conditions: Arc<dyn ConditionEvaluator>,
}

impl PublishValidator {
    pub fn new(
        registry: Arc<ActionRegistry>,
        templates: Arc<dyn TemplateEvaluator>,
        conditions: Arc<dyn ConditionEvaluator>,
    ) -> Self {
        Self {
            registry,
            templates,
            conditions,
        }
    }

    /// Validate a definition for publishing
    pub fn validate(&self, definition: &WorkflowDefinition) -> PublishValidationResult {
        let graph = validate_graph(definition);
        let mut errors = graph.errors;
        let mut warnings = graph.warnings;

        for (i, node) in definition.nodes.iter().enumerate() {
            if !node.is_subworkflow() {
                if let Some(action_type) = &node.action_type {
                    if !self.registry.is_available(action_type) {
                        errors.push(ValidationIssue::new(
                            format!("nodes[{i}].actionType"),
                            format!("action type '{action_type}' is not available"),
                        ));
                    }
                }
            }

            match self
                .templates
                .compile(&Value::Object(node.parameters.clone()))
            {
                Err(e) => {
                    errors.push(ValidationIssue::new(
                        format!("nodes[{i}].parameters"),
                        e.to_string(),
                    ));
                }
                Ok(template) => {
                    // Dry render surfaces likely runtime issues without
                    // blocking the publish
                    if let Err(e) = self.templates.render(&template, &EvalContext::empty()) {
                        warnings.push(ValidationIssue::new(
                            format!("nodes[{i}].parameters"),
                            format!("dry render failed: {e}"),
                        ));
                    }
                }
            }

            for (j, edge) in node.edges.iter().enumerate() {
                if let Some(condition) = &edge.condition {
                    if let Err(e) = self.conditions.compile(condition) {
                        errors.push(ValidationIssue::new(
                            format!("nodes[{i}].edges[{j}].condition"),
                            e.to_string(),
                        ));
                    }
                }
            }
        }

        PublishValidationResult {
            is_valid: errors.is_empty(),
            errors,
            warnings,
        }
    }
}
