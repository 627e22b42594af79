// Domain events consumed by the trigger matcher and the distribution queue.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Types of domain events the platform emits. Producers evolve
/// independently, so unknown spellings deserialize to `Unknown` and are
/// ignored rather than rejected.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    MessageReceived,
    LeadCreated,
    LeadStageChanged,
    TagAdded,
    TagRemoved,
    LeadAssigned,
    LeadReengaged,
    Scheduled,
    Inactivity,
    Manual,
    #[serde(other)]
    Unknown,
}

/// An event envelope. `data` carries entity references (lead, conversation,
/// session) and event fields; it never carries a tenant id — the owning
/// tenant is always derived server-side from the referenced entities.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DomainEvent {
    pub event_type: EventType,
    pub data: Value,
}

impl DomainEvent {
    pub fn new(event_type: EventType, data: Value) -> Self {
        Self { event_type, data }
    }

    pub fn lead_created(lead_id: Uuid) -> Self {
        Self::new(EventType::LeadCreated, serde_json::json!({ "lead_id": lead_id }))
    }

    pub fn message_received(
        lead_id: Option<Uuid>,
        conversation_id: Uuid,
        session_id: Option<Uuid>,
        message: &str,
    ) -> Self {
        Self::new(
            EventType::MessageReceived,
            serde_json::json!({
                "lead_id": lead_id,
                "conversation_id": conversation_id,
                "session_id": session_id,
                "message": message
            }),
        )
    }

    pub fn lead_stage_changed(lead_id: Uuid, old_stage_id: Option<Uuid>, new_stage_id: Uuid) -> Self {
        Self::new(
            EventType::LeadStageChanged,
            serde_json::json!({
                "lead_id": lead_id,
                "old_stage_id": old_stage_id,
                "new_stage_id": new_stage_id
            }),
        )
    }

    pub fn tag_added(lead_id: Uuid, tag_id: Uuid) -> Self {
        Self::new(
            EventType::TagAdded,
            serde_json::json!({ "lead_id": lead_id, "tag_id": tag_id }),
        )
    }

    pub fn tag_removed(lead_id: Uuid, tag_id: Uuid) -> Self {
        Self::new(
            EventType::TagRemoved,
            serde_json::json!({ "lead_id": lead_id, "tag_id": tag_id }),
        )
    }

    /// Emitted by the distribution queue after an assignment lands, so
    /// automations can react to it.
    pub fn lead_assigned(lead_id: Uuid, user_id: Uuid, queue_id: Option<Uuid>) -> Self {
        Self::new(
            EventType::LeadAssigned,
            serde_json::json!({
                "lead_id": lead_id,
                "user_id": user_id,
                "queue_id": queue_id
            }),
        )
    }

    pub fn lead_reengaged(lead_id: Uuid) -> Self {
        Self::new(EventType::LeadReengaged, serde_json::json!({ "lead_id": lead_id }))
    }

    pub fn lead_id(&self) -> Option<Uuid> {
        id_field(&self.data, "lead_id")
    }

    pub fn conversation_id(&self) -> Option<Uuid> {
        id_field(&self.data, "conversation_id")
    }

    pub fn session_id(&self) -> Option<Uuid> {
        id_field(&self.data, "session_id")
    }
}

fn id_field(data: &Value, field: &str) -> Option<Uuid> {
    data.get(field)
        .and_then(|v| v.as_str())
        .and_then(|s| s.parse().ok())
}
