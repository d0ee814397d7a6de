//! Shared building blocks for the service-design agent layer.
//!
//! - **Domain** (`domain`) - entities, entity events, context snapshots, tool descriptors
//! - **Config** (`config`) - layered configuration (defaults, TOML file, env, overrides)
//! - **Audit** (`audit`) - in-memory audit trail of policy decisions and healing outcomes
//! - **Refresh** (`refresh`) - the seam used to re-fetch remote context after a conflict

pub mod audit;
pub mod config;
pub mod domain;
pub mod refresh;

pub use audit::{AuditCategory, AuditContext, AuditEvent, AuditOutcome, AuditSink};
pub use domain::{
    ConnectionState, ContextSnapshot, Entity, EntityAction, EntityCollection, EntityEvent,
    EntityType, HttpMethod, ToolDescriptor,
};
pub use refresh::{ContextRefresh, NoopContextRefresh};
