use blueprint_core::EntityEvent;
use serde::{Deserialize, Serialize};

/// Messages the client sends on the realtime channel.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum ClientMessage {
    #[serde(rename = "subscribe", rename_all = "camelCase")]
    Subscribe { service_id: String },
    #[serde(rename = "unsubscribe", rename_all = "camelCase")]
    Unsubscribe { service_id: String },
    #[serde(rename = "event.ack", rename_all = "camelCase")]
    EventAck { event_id: String, received: bool },
}

impl ClientMessage {
    pub fn subscribe(service_id: impl Into<String>) -> Self {
        Self::Subscribe { service_id: service_id.into() }
    }

    pub fn unsubscribe(service_id: impl Into<String>) -> Self {
        Self::Unsubscribe { service_id: service_id.into() }
    }

    pub fn ack(event_id: impl Into<String>) -> Self {
        Self::EventAck { event_id: event_id.into(), received: true }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Subscribe { .. } => "subscribe",
            Self::Unsubscribe { .. } => "unsubscribe",
            Self::EventAck { .. } => "event.ack",
        }
    }
}

/// Messages the server pushes on the realtime channel. Disconnects are not
/// messages; transports report them as `TransportError::Disconnected`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum ServerMessage {
    #[serde(rename = "entity.event")]
    EntityEvent(EntityEvent),
    #[serde(rename = "subscription.confirmed", rename_all = "camelCase")]
    SubscriptionConfirmed { service_id: String },
    #[serde(rename = "error")]
    Error { message: String },
}

impl ServerMessage {
    pub fn name(&self) -> &'static str {
        match self {
            Self::EntityEvent(_) => "entity.event",
            Self::SubscriptionConfirmed { .. } => "subscription.confirmed",
            Self::Error { .. } => "error",
        }
    }
}

#[cfg(test)]
mod tests {
    use blueprint_core::{EntityAction, EntityType};
    use serde_json::json;

    use super::{ClientMessage, ServerMessage};

    #[test]
    fn client_messages_use_event_names_and_camel_case_fields() {
        assert_eq!(
            serde_json::to_value(ClientMessage::subscribe("svc-1")).expect("serialize"),
            json!({ "event": "subscribe", "data": { "serviceId": "svc-1" } })
        );
        assert_eq!(
            serde_json::to_value(ClientMessage::ack("evt-1")).expect("serialize"),
            json!({ "event": "event.ack", "data": { "eventId": "evt-1", "received": true } })
        );
    }

    #[test]
    fn server_entity_event_deserializes() {
        let raw = json!({
            "event": "entity.event",
            "data": {
                "id": "evt-1",
                "entityType": "field",
                "action": "updated",
                "entityId": "field-3",
                "serviceId": "svc-1",
                "userId": "user-1",
                "timestamp": "2026-03-01T10:00:00Z",
                "payload": { "label": "Surname" }
            }
        });

        let message: ServerMessage = serde_json::from_value(raw).expect("deserialize");
        let ServerMessage::EntityEvent(event) = message else {
            panic!("expected entity event");
        };
        assert_eq!(event.entity_type, EntityType::Field);
        assert_eq!(event.action, EntityAction::Updated);
    }

    #[test]
    fn subscription_confirmation_and_error_deserialize() {
        let confirmed: ServerMessage = serde_json::from_value(json!({
            "event": "subscription.confirmed",
            "data": { "serviceId": "svc-1" }
        }))
        .expect("deserialize");
        assert_eq!(
            confirmed,
            ServerMessage::SubscriptionConfirmed { service_id: "svc-1".to_owned() }
        );

        let error: ServerMessage = serde_json::from_value(json!({
            "event": "error",
            "data": { "message": "not authorised for service" }
        }))
        .expect("deserialize");
        assert_eq!(error.name(), "error");
    }
}
