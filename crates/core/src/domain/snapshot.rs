use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::entity::{Entity, EntityCollection};

/// Locally held, versioned copy of every configuration entity of one service.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContextSnapshot {
    pub service_id: String,
    pub service_name: String,
    #[serde(default)]
    pub forms: Vec<Entity>,
    #[serde(default)]
    pub sections: Vec<Entity>,
    #[serde(default)]
    pub fields: Vec<Entity>,
    #[serde(default)]
    pub roles: Vec<Entity>,
    #[serde(default)]
    pub transitions: Vec<Entity>,
    #[serde(default)]
    pub registrations: Vec<Entity>,
    #[serde(default)]
    pub determinants: Vec<Entity>,
    #[serde(default)]
    pub version: u64,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_event_timestamp: Option<DateTime<Utc>>,
}

impl ContextSnapshot {
    pub fn empty(service_id: impl Into<String>) -> Self {
        Self {
            service_id: service_id.into(),
            service_name: String::new(),
            forms: Vec::new(),
            sections: Vec::new(),
            fields: Vec::new(),
            roles: Vec::new(),
            transitions: Vec::new(),
            registrations: Vec::new(),
            determinants: Vec::new(),
            version: 0,
            timestamp: Utc::now(),
            last_event_timestamp: None,
        }
    }

    pub fn collection(&self, collection: EntityCollection) -> &[Entity] {
        match collection {
            EntityCollection::Forms => &self.forms,
            EntityCollection::Sections => &self.sections,
            EntityCollection::Fields => &self.fields,
            EntityCollection::Roles => &self.roles,
            EntityCollection::Transitions => &self.transitions,
            EntityCollection::Registrations => &self.registrations,
            EntityCollection::Determinants => &self.determinants,
        }
    }

    pub fn collection_mut(&mut self, collection: EntityCollection) -> &mut Vec<Entity> {
        match collection {
            EntityCollection::Forms => &mut self.forms,
            EntityCollection::Sections => &mut self.sections,
            EntityCollection::Fields => &mut self.fields,
            EntityCollection::Roles => &mut self.roles,
            EntityCollection::Transitions => &mut self.transitions,
            EntityCollection::Registrations => &mut self.registrations,
            EntityCollection::Determinants => &mut self.determinants,
        }
    }

    pub fn entity_count(&self) -> usize {
        self.forms.len()
            + self.sections.len()
            + self.fields.len()
            + self.roles.len()
            + self.transitions.len()
            + self.registrations.len()
            + self.determinants.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entity_count() == 0
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::ContextSnapshot;
    use crate::domain::entity::{Entity, EntityCollection};

    #[test]
    fn snapshot_deserializes_with_missing_collections() {
        let raw = json!({
            "serviceId": "svc-1",
            "serviceName": "Business licence",
            "forms": [{ "id": "form-1", "name": "Applicant" }],
            "version": 7,
            "timestamp": "2026-03-01T10:00:00Z"
        });

        let snapshot: ContextSnapshot =
            serde_json::from_value(raw).expect("snapshot should deserialize");
        assert_eq!(snapshot.version, 7);
        assert_eq!(snapshot.forms.len(), 1);
        assert_eq!(snapshot.forms[0].attribute("name"), Some(&json!("Applicant")));
        assert!(snapshot.roles.is_empty());
        assert_eq!(snapshot.entity_count(), 1);
    }

    #[test]
    fn collection_mut_targets_the_named_collection() {
        let mut snapshot = ContextSnapshot::empty("svc-1");
        snapshot.collection_mut(EntityCollection::Roles).push(Entity::new("role-1"));

        assert_eq!(snapshot.collection(EntityCollection::Roles).len(), 1);
        assert!(snapshot.collection(EntityCollection::Forms).is_empty());
        assert!(!snapshot.is_empty());
    }
}
