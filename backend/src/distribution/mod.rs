// Lead Distribution (Round Robin)
//
// Rule matching + strategy-based member selection + schedule/pool/
// redistribution policy. Assigns unassigned leads to users or teams and
// feeds `lead_assigned` events back into the automation engine.

pub mod distributor;
pub mod rules;
pub mod schedule;
pub mod selection;

pub use distributor::{AssignmentOutcome, LeadDistributor};
pub use rules::{LeadProfile, QueueMatch, RuleMatchType};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::FromRow;
use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum DistributionError {
    #[error("lead {0} not found")]
    LeadNotFound(Uuid),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

pub type DistributionResult<T> = Result<T, DistributionError>;

/// A distribution queue row. Settings the matcher reads hot
/// (`reentry_behavior`) live in dedicated columns; the rest is one blob.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct RoundRobinQueue {
    pub id: Uuid,
    pub organization_id: Uuid,
    pub name: String,
    pub strategy: String, // simple, weighted
    pub target_pipeline_id: Option<Uuid>,
    pub target_stage_id: Option<Uuid>,
    pub is_active: bool,
    pub settings: Value,
    pub reentry_behavior: String, // redistribute, keep_assignee
    pub ai_agent_id: Option<Uuid>,
    pub rotation_cursor: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl RoundRobinQueue {
    pub fn settings(&self) -> QueueSettings {
        serde_json::from_value(self.settings.clone()).unwrap_or_default()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueSettings {
    pub enable_redistribution: bool,
    pub redistribution_timeout_minutes: i32,
    pub redistribution_max_attempts: i32,
    /// Whether a redistribution attempt continues the rotation cursor
    /// or restarts it from the top of the member list.
    pub preserve_position: bool,
    pub require_checkin: bool,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            enable_redistribution: false,
            redistribution_timeout_minutes: 30,
            redistribution_max_attempts: 3,
            preserve_position: true,
            require_checkin: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct QueueRule {
    pub id: Uuid,
    pub queue_id: Uuid,
    pub match_type: String,
    pub match_values: Vec<String>,
    pub priority: i32,
    pub is_active: bool,
}

/// An individual selectable member; teams are expanded into these rows at
/// queue-save time, so selection treats solo users and team pools uniformly.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct QueueMember {
    pub user_id: Uuid,
    pub weight: i32,
    pub position: i32,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_settings_parse_with_defaults() {
        let queue = RoundRobinQueue {
            id: Uuid::new_v4(),
            organization_id: Uuid::new_v4(),
            name: "Inbound".to_string(),
            strategy: "simple".to_string(),
            target_pipeline_id: None,
            target_stage_id: None,
            is_active: true,
            settings: json!({ "enable_redistribution": true, "redistribution_timeout_minutes": 15 }),
            reentry_behavior: "redistribute".to_string(),
            ai_agent_id: None,
            rotation_cursor: 0,
            created_at: Utc::now(),
            updated_at: None,
        };

        let settings = queue.settings();
        assert!(settings.enable_redistribution);
        assert_eq!(settings.redistribution_timeout_minutes, 15);
        // unspecified knobs fall back to defaults
        assert_eq!(settings.redistribution_max_attempts, 3);
        assert!(settings.preserve_position);
        assert!(!settings.require_checkin);
    }
}
