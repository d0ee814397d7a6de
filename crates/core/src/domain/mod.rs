pub mod entity;
pub mod snapshot;
pub mod tool;

pub use entity::{ConnectionState, Entity, EntityAction, EntityCollection, EntityEvent, EntityType};
pub use snapshot::ContextSnapshot;
pub use tool::{HttpMethod, ToolDescriptor};
