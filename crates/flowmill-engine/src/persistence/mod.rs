//! Persistence gateway
//!
//! The store contract the conductor and lifecycle manager run against, plus
//! two implementations: an in-memory twin for tests and embedded use, and a
//! PostgreSQL store for production.

mod gateway;
mod memory;
mod postgres;

pub use gateway::{
    AttemptRecord, ExecutionRecord, GatewayError, HierarchyRecord, LinkOutcome, NewAttempt,
    NewExecution, PersistenceGateway, ResourceLinkRecord, StartedExecution, StoredDefinition,
};
pub use memory::InMemoryGateway;
pub use postgres::PostgresGateway;
