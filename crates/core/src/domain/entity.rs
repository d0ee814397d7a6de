use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    Form,
    Section,
    Field,
    Role,
    Transition,
    Registration,
    Determinant,
    Service,
}

impl EntityType {
    pub const ALL: [EntityType; 8] = [
        Self::Form,
        Self::Section,
        Self::Field,
        Self::Role,
        Self::Transition,
        Self::Registration,
        Self::Determinant,
        Self::Service,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Form => "form",
            Self::Section => "section",
            Self::Field => "field",
            Self::Role => "role",
            Self::Transition => "transition",
            Self::Registration => "registration",
            Self::Determinant => "determinant",
            Self::Service => "service",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        let normalized = value.trim().to_ascii_lowercase();
        Self::ALL.into_iter().find(|entity_type| entity_type.as_str() == normalized)
    }

    /// Snapshot collection holding entities of this type. `Service` has none:
    /// service events mutate the snapshot header instead.
    pub fn collection(&self) -> Option<EntityCollection> {
        match self {
            Self::Form => Some(EntityCollection::Forms),
            Self::Section => Some(EntityCollection::Sections),
            Self::Field => Some(EntityCollection::Fields),
            Self::Role => Some(EntityCollection::Roles),
            Self::Transition => Some(EntityCollection::Transitions),
            Self::Registration => Some(EntityCollection::Registrations),
            Self::Determinant => Some(EntityCollection::Determinants),
            Self::Service => None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EntityCollection {
    Forms,
    Sections,
    Fields,
    Roles,
    Transitions,
    Registrations,
    Determinants,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityAction {
    Created,
    Updated,
    Deleted,
}

impl EntityAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Updated => "updated",
            Self::Deleted => "deleted",
        }
    }
}

/// One change notification for a configuration entity. Events are transient:
/// once applied only `id` is retained for deduplication.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityEvent {
    pub id: String,
    pub entity_type: EntityType,
    pub action: EntityAction,
    pub entity_id: String,
    pub service_id: String,
    pub user_id: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
}

impl EntityEvent {
    /// Entity carried by the payload, keyed by `entity_id` even when the
    /// payload omits or disagrees on its own `id`.
    pub fn entity(&self) -> Entity {
        let attributes = match &self.payload {
            Some(Value::Object(map)) => map
                .iter()
                .filter(|(key, _)| key.as_str() != "id")
                .map(|(key, value)| (key.clone(), value.clone()))
                .collect(),
            _ => Map::new(),
        };
        Entity { id: self.entity_id.clone(), attributes }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    pub id: String,
    #[serde(flatten)]
    pub attributes: Map<String, Value>,
}

impl Entity {
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into(), attributes: Map::new() }
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    pub fn attribute(&self, key: &str) -> Option<&Value> {
        self.attributes.get(key)
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Reconnecting => "reconnecting",
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use serde_json::json;

    use super::{EntityAction, EntityCollection, EntityEvent, EntityType};

    #[test]
    fn entity_event_uses_camel_case_wire_names() {
        let raw = json!({
            "id": "evt-1",
            "entityType": "form",
            "action": "created",
            "entityId": "form-1",
            "serviceId": "svc-1",
            "userId": "user-1",
            "timestamp": "2026-03-01T10:00:00Z",
            "payload": { "id": "form-1", "name": "Applicant details" }
        });

        let event: EntityEvent = serde_json::from_value(raw).expect("event should deserialize");
        assert_eq!(event.entity_type, EntityType::Form);
        assert_eq!(event.action, EntityAction::Created);
        assert_eq!(event.service_id, "svc-1");

        let entity = event.entity();
        assert_eq!(entity.id, "form-1");
        assert_eq!(entity.attribute("name"), Some(&json!("Applicant details")));
        assert!(entity.attribute("id").is_none());
    }

    #[test]
    fn entity_uses_event_entity_id_when_payload_is_missing() {
        let event = EntityEvent {
            id: "evt-2".to_owned(),
            entity_type: EntityType::Role,
            action: EntityAction::Deleted,
            entity_id: "role-9".to_owned(),
            service_id: "svc-1".to_owned(),
            user_id: "user-1".to_owned(),
            timestamp: Utc::now(),
            payload: None,
        };

        let entity = event.entity();
        assert_eq!(entity.id, "role-9");
        assert!(entity.attributes.is_empty());
    }

    #[test]
    fn service_type_has_no_collection() {
        assert_eq!(EntityType::Service.collection(), None);
        assert_eq!(EntityType::Determinant.collection(), Some(EntityCollection::Determinants));
        assert_eq!(EntityType::parse(" Registration "), Some(EntityType::Registration));
        assert_eq!(EntityType::parse("quote"), None);
    }
}
