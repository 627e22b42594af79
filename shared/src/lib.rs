use chrono::{DateTime, NaiveTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Organization {
    pub id: Uuid,
    pub name: String,
    pub created_at: DateTime<Utc>,
}

#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: Uuid,
    pub organization_id: Uuid,
    pub email: String,
    pub first_name: String,
    pub last_name: String,
    pub role: String, // admin, agent
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
}

#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Team {
    pub id: Uuid,
    pub organization_id: Uuid,
    pub name: String,
    pub created_at: DateTime<Utc>,
}

#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TeamMember {
    pub team_id: Uuid,
    pub user_id: Uuid,
}

#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pipeline {
    pub id: Uuid,
    pub organization_id: Uuid,
    pub name: String,
    /// Pool settings mirrored from the distribution queue that targets this
    /// pipeline. Both representations are read independently (pipeline UI vs
    /// queue matcher), so writes keep them in sync in one transaction.
    pub pool_enabled: bool,
    pub pool_timeout_minutes: i32,
    pub pool_max_redistributions: i32,
    pub created_at: DateTime<Utc>,
}

#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineStage {
    pub id: Uuid,
    pub pipeline_id: Uuid,
    pub name: String,
    pub position: i32,
}

#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tag {
    pub id: Uuid,
    pub organization_id: Uuid,
    pub name: String,
    pub color: Option<String>,
}

/// A sales lead. The attribute columns past `status` exist for the
/// distribution queue's rule matching; `last_assigned_user_id` is the
/// reentry memory used by `keep_assignee` queues.
#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Lead {
    pub id: Uuid,
    pub organization_id: Uuid,
    pub name: String,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub status: String, // open, won, lost, closed
    pub pipeline_id: Option<Uuid>,
    pub stage_id: Option<Uuid>,
    pub assigned_user_id: Option<Uuid>,
    pub last_assigned_user_id: Option<Uuid>,
    pub round_robin_id: Option<Uuid>,
    pub source: Option<String>,
    pub campaign: Option<String>,
    pub city: Option<String>,
    pub webhook_id: Option<Uuid>,
    pub whatsapp_session_id: Option<Uuid>,
    pub meta_form_id: Option<String>,
    pub website_category: Option<String>,
    pub interest_property_id: Option<Uuid>,
    pub interest_plan_id: Option<Uuid>,
    pub value: Option<Decimal>,
    pub created_at: DateTime<Utc>,
    pub updated_at: Option<DateTime<Utc>>,
}

#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversation {
    pub id: Uuid,
    pub organization_id: Uuid,
    pub lead_id: Option<Uuid>,
    pub channel: String,
    pub last_message_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// A connected chat-gateway session (one per phone number).
#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatSession {
    pub id: Uuid,
    pub organization_id: Uuid,
    pub name: String,
    pub phone_number: Option<String>,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
}

#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRecord {
    pub id: Uuid,
    pub organization_id: Uuid,
    pub lead_id: Option<Uuid>,
    pub assigned_user_id: Option<Uuid>,
    pub title: String,
    pub description: Option<String>,
    pub due_at: Option<DateTime<Utc>>,
    pub completed: bool,
    pub created_at: DateTime<Utc>,
}

#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notification {
    pub id: Uuid,
    pub user_id: Uuid,
    pub organization_id: Uuid,
    pub title: String,
    pub content: String,
    pub notification_type: String,
    pub lead_id: Option<Uuid>,
    pub read: bool,
    pub created_at: DateTime<Utc>,
}

/// One day of a queue's weekly activity window.
#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleWindow {
    pub day: i16, // 0 = Monday .. 6 = Sunday
    pub enabled: bool,
    pub start_time: NaiveTime,
    pub end_time: NaiveTime,
}

impl User {
    pub fn full_name(&self) -> String {
        format!("{} {}", self.first_name, self.last_name)
    }

    pub fn is_admin(&self) -> bool {
        self.role == "admin"
    }
}

impl Lead {
    /// A lead that previously reached a terminal status and is talking to us
    /// again needs a reentry decision rather than a fresh distribution.
    pub fn is_closed(&self) -> bool {
        matches!(self.status.as_str(), "won" | "lost" | "closed")
    }
}
