// Distribution queue configuration. Settings, schedule, rules, and members
// are written in one transaction; pool knobs are mirrored onto the target
// pipeline row in the same transaction so both UIs read consistent values.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use chrono::NaiveTime;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;
use std::sync::Arc;
use uuid::Uuid;
use validator::Validate;

use crate::auth::AuthUser;
use crate::distribution::{QueueMember, QueueRule, RoundRobinQueue};
use crate::error::{ApiResult, AppError};
use crate::AppState;
use lattice_shared::ScheduleWindow;

pub fn queue_routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/", get(list_queues).post(create_queue))
        .route("/:id", get(get_queue).put(update_queue))
}

pub fn assignment_routes() -> Router<Arc<AppState>> {
    Router::new().route("/:id/acknowledge", post(acknowledge_assignment))
}

#[derive(Debug, Deserialize, Validate)]
pub struct QueuePayload {
    #[validate(length(min = 1, max = 200, message = "Name must be 1-200 characters"))]
    pub name: String,
    #[serde(default = "default_strategy")]
    pub strategy: String,
    pub target_pipeline_id: Option<Uuid>,
    pub target_stage_id: Option<Uuid>,
    #[serde(default = "default_true")]
    pub is_active: bool,
    #[serde(default)]
    pub settings: SettingsPayload,
    #[serde(default)]
    pub schedule: Vec<SchedulePayload>,
    #[serde(default)]
    pub conditions: Vec<RulePayload>,
    #[serde(default)]
    pub members: Vec<MemberPayload>,
    pub ai_agent_id: Option<Uuid>,
}

fn default_strategy() -> String {
    "simple".to_string()
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SettingsPayload {
    pub enable_redistribution: bool,
    pub redistribution_timeout_minutes: i32,
    pub redistribution_max_attempts: i32,
    pub preserve_position: bool,
    pub require_checkin: bool,
    pub reentry_behavior: String,
}

impl Default for SettingsPayload {
    fn default() -> Self {
        Self {
            enable_redistribution: false,
            redistribution_timeout_minutes: 30,
            redistribution_max_attempts: 3,
            preserve_position: true,
            require_checkin: false,
            reentry_behavior: "redistribute".to_string(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct SchedulePayload {
    pub day: i16,
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub start: NaiveTime,
    pub end: NaiveTime,
}

#[derive(Debug, Deserialize)]
pub struct RulePayload {
    #[serde(rename = "type")]
    pub match_type: String,
    pub values: Vec<String>,
    #[serde(default)]
    pub priority: i32,
}

#[derive(Debug, Deserialize)]
pub struct MemberPayload {
    #[serde(rename = "type")]
    pub member_type: String, // user, team
    #[serde(rename = "entityId")]
    pub entity_id: Uuid,
    #[serde(default = "default_weight")]
    pub weight: i32,
}

fn default_weight() -> i32 {
    1
}

#[derive(Debug, Serialize)]
pub struct QueueDetail {
    #[serde(flatten)]
    pub queue: RoundRobinQueue,
    pub rules: Vec<QueueRule>,
    pub members: Vec<QueueMember>,
    pub schedule: Vec<ScheduleWindow>,
}

fn validate_payload(payload: &QueuePayload) -> Result<(), AppError> {
    payload.validate()?;

    if !matches!(payload.strategy.as_str(), "simple" | "weighted") {
        return Err(AppError::BadRequest(format!("Unknown strategy '{}'", payload.strategy)));
    }

    if !matches!(payload.settings.reentry_behavior.as_str(), "redistribute" | "keep_assignee") {
        return Err(AppError::BadRequest(format!(
            "Unknown reentry behavior '{}'",
            payload.settings.reentry_behavior
        )));
    }

    for window in &payload.schedule {
        if !(0..=6).contains(&window.day) {
            return Err(AppError::BadRequest(format!("Schedule day {} out of range", window.day)));
        }
    }

    for member in &payload.members {
        if !matches!(member.member_type.as_str(), "user" | "team") {
            return Err(AppError::BadRequest(format!("Unknown member type '{}'", member.member_type)));
        }
        if member.weight < 0 {
            return Err(AppError::BadRequest("Member weight must be >= 0".to_string()));
        }
    }

    Ok(())
}

async fn list_queues(State(state): State<Arc<AppState>>, auth: AuthUser) -> ApiResult<impl IntoResponse> {
    let queues = sqlx::query_as::<_, RoundRobinQueue>(
        "SELECT * FROM round_robins WHERE organization_id = $1 ORDER BY created_at ASC",
    )
    .bind(auth.0.organization_id)
    .fetch_all(&state.db_pool)
    .await?;

    Ok(Json(queues))
}

async fn get_queue(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    auth: AuthUser,
) -> ApiResult<impl IntoResponse> {
    let queue = fetch_owned(&state, id, auth.0.organization_id).await?;

    let rules = sqlx::query_as::<_, QueueRule>(
        "SELECT * FROM round_robin_rules WHERE queue_id = $1 ORDER BY priority DESC",
    )
    .bind(id)
    .fetch_all(&state.db_pool)
    .await?;

    let members = sqlx::query_as::<_, QueueMember>(
        "SELECT user_id, weight, position FROM round_robin_members WHERE queue_id = $1 ORDER BY position ASC",
    )
    .bind(id)
    .fetch_all(&state.db_pool)
    .await?;

    let schedule = sqlx::query_as::<_, ScheduleWindow>(
        "SELECT day, enabled, start_time, end_time FROM round_robin_schedules WHERE queue_id = $1 ORDER BY day",
    )
    .bind(id)
    .fetch_all(&state.db_pool)
    .await?;

    Ok(Json(QueueDetail {
        queue,
        rules,
        members,
        schedule,
    }))
}

async fn create_queue(
    State(state): State<Arc<AppState>>,
    auth: AuthUser,
    Json(payload): Json<QueuePayload>,
) -> ApiResult<impl IntoResponse> {
    auth.require_admin()?;
    validate_payload(&payload)?;

    let queue_id = Uuid::new_v4();
    let mut tx = state.db_pool.begin().await?;

    sqlx::query(
        r#"
        INSERT INTO round_robins
            (id, organization_id, name, strategy, target_pipeline_id, target_stage_id,
             is_active, settings, reentry_behavior, ai_agent_id, rotation_cursor, created_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, -1, NOW())
        "#,
    )
    .bind(queue_id)
    .bind(auth.0.organization_id)
    .bind(&payload.name)
    .bind(&payload.strategy)
    .bind(payload.target_pipeline_id)
    .bind(payload.target_stage_id)
    .bind(payload.is_active)
    .bind(settings_blob(&payload.settings))
    .bind(&payload.settings.reentry_behavior)
    .bind(payload.ai_agent_id)
    .execute(&mut *tx)
    .await?;

    write_associations(&mut tx, queue_id, auth.0.organization_id, &payload).await?;
    tx.commit().await?;

    Ok((StatusCode::CREATED, Json(serde_json::json!({ "id": queue_id }))))
}

async fn update_queue(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    auth: AuthUser,
    Json(payload): Json<QueuePayload>,
) -> ApiResult<impl IntoResponse> {
    auth.require_admin()?;
    validate_payload(&payload)?;
    fetch_owned(&state, id, auth.0.organization_id).await?;

    let mut tx = state.db_pool.begin().await?;

    sqlx::query(
        r#"
        UPDATE round_robins
        SET name = $2, strategy = $3, target_pipeline_id = $4, target_stage_id = $5,
            is_active = $6, settings = $7, reentry_behavior = $8, ai_agent_id = $9, updated_at = NOW()
        WHERE id = $1
        "#,
    )
    .bind(id)
    .bind(&payload.name)
    .bind(&payload.strategy)
    .bind(payload.target_pipeline_id)
    .bind(payload.target_stage_id)
    .bind(payload.is_active)
    .bind(settings_blob(&payload.settings))
    .bind(&payload.settings.reentry_behavior)
    .bind(payload.ai_agent_id)
    .execute(&mut *tx)
    .await?;

    sqlx::query("DELETE FROM round_robin_rules WHERE queue_id = $1")
        .bind(id)
        .execute(&mut *tx)
        .await?;
    sqlx::query("DELETE FROM round_robin_members WHERE queue_id = $1")
        .bind(id)
        .execute(&mut *tx)
        .await?;
    sqlx::query("DELETE FROM round_robin_schedules WHERE queue_id = $1")
        .bind(id)
        .execute(&mut *tx)
        .await?;

    write_associations(&mut tx, id, auth.0.organization_id, &payload).await?;
    tx.commit().await?;

    Ok(Json(serde_json::json!({ "id": id })))
}

fn settings_blob(settings: &SettingsPayload) -> Value {
    serde_json::to_value(settings).unwrap_or_else(|_| serde_json::json!({}))
}

/// Rules, schedule, expanded members, and the pipeline pool mirror — all
/// inside the caller's transaction.
async fn write_associations(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    queue_id: Uuid,
    organization_id: Uuid,
    payload: &QueuePayload,
) -> Result<(), AppError> {
    for (index, rule) in payload.conditions.iter().enumerate() {
        // default precedence: earlier rules evaluate first
        let priority = if rule.priority != 0 {
            rule.priority
        } else {
            (payload.conditions.len() - index) as i32
        };

        sqlx::query(
            r#"
            INSERT INTO round_robin_rules (id, queue_id, match_type, match_values, priority, is_active)
            VALUES ($1, $2, $3, $4, $5, true)
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(queue_id)
        .bind(&rule.match_type)
        .bind(&rule.values)
        .bind(priority)
        .execute(&mut **tx)
        .await
        .map_err(AppError::from)?;
    }

    for window in &payload.schedule {
        sqlx::query(
            r#"
            INSERT INTO round_robin_schedules (queue_id, day, enabled, start_time, end_time)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (queue_id, day) DO UPDATE
            SET enabled = EXCLUDED.enabled, start_time = EXCLUDED.start_time, end_time = EXCLUDED.end_time
            "#,
        )
        .bind(queue_id)
        .bind(window.day)
        .bind(window.enabled)
        .bind(window.start)
        .bind(window.end)
        .execute(&mut **tx)
        .await
        .map_err(AppError::from)?;
    }

    // Teams are expanded into individual user rows here, each carrying the
    // team-level weight, so the selection strategies treat solo users and
    // team pools uniformly. Positions are dense and gapless.
    let mut position = 0i32;
    let mut seen: HashSet<Uuid> = HashSet::new();

    for member in &payload.members {
        match member.member_type.as_str() {
            "user" => {
                if seen.insert(member.entity_id) {
                    insert_member(tx, queue_id, member.entity_id, None, member.weight, position).await?;
                    position += 1;
                }
            }
            "team" => {
                let user_ids: Vec<Uuid> = sqlx::query_scalar(
                    r#"
                    SELECT tm.user_id
                    FROM team_members tm
                    JOIN teams t ON t.id = tm.team_id
                    WHERE tm.team_id = $1 AND t.organization_id = $2
                    ORDER BY tm.user_id
                    "#,
                )
                .bind(member.entity_id)
                .bind(organization_id)
                .fetch_all(&mut **tx)
                .await
                .map_err(AppError::from)?;

                for user_id in user_ids {
                    if seen.insert(user_id) {
                        insert_member(tx, queue_id, user_id, Some(member.entity_id), member.weight, position)
                            .await?;
                        position += 1;
                    }
                }
            }
            _ => unreachable!("validated earlier"),
        }
    }

    // Synchronization invariant: pipeline pool fields mirror the queue's
    // redistribution settings in the same transaction.
    if let Some(pipeline_id) = payload.target_pipeline_id {
        sqlx::query(
            r#"
            UPDATE pipelines
            SET pool_enabled = $3, pool_timeout_minutes = $4, pool_max_redistributions = $5
            WHERE id = $1 AND organization_id = $2
            "#,
        )
        .bind(pipeline_id)
        .bind(organization_id)
        .bind(payload.settings.enable_redistribution)
        .bind(payload.settings.redistribution_timeout_minutes)
        .bind(payload.settings.redistribution_max_attempts)
        .execute(&mut **tx)
        .await
        .map_err(AppError::from)?;
    }

    Ok(())
}

async fn insert_member(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    queue_id: Uuid,
    user_id: Uuid,
    team_id: Option<Uuid>,
    weight: i32,
    position: i32,
) -> Result<(), AppError> {
    sqlx::query(
        r#"
        INSERT INTO round_robin_members (id, queue_id, user_id, team_id, weight, position)
        VALUES ($1, $2, $3, $4, $5, $6)
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(queue_id)
    .bind(user_id)
    .bind(team_id)
    .bind(weight)
    .bind(position)
    .execute(&mut **tx)
    .await
    .map_err(AppError::from)?;

    Ok(())
}

async fn acknowledge_assignment(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    auth: AuthUser,
) -> ApiResult<impl IntoResponse> {
    let acknowledged = state
        .distributor
        .acknowledge(id, auth.0.id)
        .await
        .map_err(|e| AppError::InternalError(e.to_string()))?;

    if !acknowledged {
        return Err(AppError::Conflict(
            "Assignment is not pending acknowledgement for this user".to_string(),
        ));
    }

    Ok(Json(serde_json::json!({ "id": id, "acknowledged": true })))
}

async fn fetch_owned(state: &Arc<AppState>, id: Uuid, organization_id: Uuid) -> ApiResult<RoundRobinQueue> {
    sqlx::query_as::<_, RoundRobinQueue>(
        "SELECT * FROM round_robins WHERE id = $1 AND organization_id = $2",
    )
    .bind(id)
    .bind(organization_id)
    .fetch_optional(&state.db_pool)
    .await?
    .ok_or(AppError::NotFound("Queue".to_string()))
}
