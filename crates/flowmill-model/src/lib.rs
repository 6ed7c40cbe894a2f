//! # Flowmill Data Model
//!
//! Pure data layer for the Flowmill workflow conductor:
//!
//! - **Definition model**: typed, normalized representation of the workflow
//!   definition JSON (nodes, edges, policies)
//! - **Canonical JSON**: stable serialization + SHA-256 checksums for
//!   idempotent publishing
//! - **Static validation**: structural checks on the workflow graph
//!   (acyclicity, reachability, reference integrity)
//! - **Statuses and results**: the uniform action result contract shared by
//!   local and remote actions
//!
//! Everything in this crate is synchronous and side-effect free. The engine
//! crate (`flowmill-engine`) builds the runtime on top of these types.

pub mod canonical;
pub mod definition;
pub mod result;
pub mod status;
pub mod validate;

pub use canonical::{canonicalize, checksum};
pub use definition::{
    DefinitionError, EdgeSpec, EdgeWhen, NodePolicies, NodeSpec, NodeType, RetrySpec, RoutePolicy,
    WorkflowDefinition,
};
pub use result::{ActionResult, ResourceLinkRef};
pub use status::{ActionStatus, ExecutionStatus, Principal, Workflow, WorkflowStatus};
pub use validate::{validate_graph, GraphValidation, ValidationIssue};
