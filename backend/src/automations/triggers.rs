// Trigger matching: maps one domain event onto the set of stored trigger
// spellings it can satisfy, then fetches the active definitions listening
// for any of them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::{FromRow, PgPool};
use uuid::Uuid;

use super::events::EventType;

/// A persisted automation definition.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Automation {
    pub id: Uuid,
    pub organization_id: Uuid,
    pub name: String,
    pub is_active: bool,
    pub trigger_type: String,
    pub trigger_config: Value,
    pub created_by: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: Option<DateTime<Utc>>,
}

/// The stored trigger spellings one event type satisfies. Multiple spellings
/// per event tolerate schema evolution: definitions saved under a legacy
/// name keep firing after the event producer renames the event.
pub fn trigger_spellings(event_type: EventType) -> &'static [&'static str] {
    match event_type {
        EventType::MessageReceived => &["message_received"],
        EventType::LeadCreated => &["lead_created"],
        EventType::LeadStageChanged => &["lead_stage_changed", "stage_change"],
        EventType::TagAdded => &["tag_added"],
        EventType::TagRemoved => &["tag_removed"],
        EventType::LeadAssigned => &["lead_assigned"],
        EventType::LeadReengaged => &["lead_reengaged"],
        EventType::Scheduled => &["scheduled"],
        EventType::Inactivity => &["inactivity"],
        EventType::Manual => &["manual"],
        // Forward compatibility: unknown producers are a no-op, not an error.
        EventType::Unknown => &[],
    }
}

/// Fetch the resolved tenant's active automations listening for any of the
/// given trigger spellings.
pub async fn fetch_candidates(
    pool: &PgPool,
    organization_id: Uuid,
    spellings: &[&str],
) -> Result<Vec<Automation>, sqlx::Error> {
    if spellings.is_empty() {
        return Ok(Vec::new());
    }

    let spellings: Vec<String> = spellings.iter().map(|s| s.to_string()).collect();

    sqlx::query_as::<_, Automation>(
        r#"
        SELECT id, organization_id, name, is_active, trigger_type, trigger_config,
               created_by, created_at, updated_at
        FROM automations
        WHERE organization_id = $1
          AND is_active = true
          AND trigger_type = ANY($2)
        ORDER BY created_at ASC
        "#,
    )
    .bind(organization_id)
    .bind(&spellings)
    .fetch_all(pool)
    .await
}
