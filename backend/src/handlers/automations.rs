// Automation definition CRUD and execution control. The visual designer
// produces the persisted graph; this layer validates and stores it.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;
use std::sync::Arc;
use uuid::Uuid;
use validator::Validate;

use crate::auth::AuthUser;
use crate::automations::engine::ExecutionRow;
use crate::automations::triggers::Automation;
use crate::error::{ApiResult, AppError};
use crate::pagination::{PaginatedResponse, PaginationParams};
use crate::AppState;

pub fn automation_routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/", get(list_automations).post(create_automation))
        .route("/:id", get(get_automation).put(update_automation))
        .route("/:id/activate", post(activate_automation))
        .route("/:id/deactivate", post(deactivate_automation))
        .route("/:id/executions", get(list_executions))
}

pub fn execution_routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/:id/advance", post(advance_execution))
        .route("/:id/cancel", post(cancel_execution))
        .route("/:id/retry", post(retry_execution))
}

#[derive(Debug, Deserialize, Validate)]
pub struct AutomationPayload {
    #[validate(length(min = 1, max = 200, message = "Name must be 1-200 characters"))]
    pub name: String,
    #[validate(length(min = 1, message = "Trigger type is required"))]
    pub trigger_type: String,
    #[serde(default)]
    pub trigger_config: Value,
    #[serde(default)]
    pub is_active: bool,
    #[serde(default)]
    pub nodes: Vec<NodePayload>,
    #[serde(default)]
    pub connections: Vec<ConnectionPayload>,
}

#[derive(Debug, Deserialize)]
pub struct NodePayload {
    pub id: Uuid,
    pub node_type: String,
    pub action_type: Option<String>,
    #[serde(default)]
    pub config: Value,
    #[serde(default)]
    pub position_x: f64,
    #[serde(default)]
    pub position_y: f64,
}

#[derive(Debug, Deserialize)]
pub struct ConnectionPayload {
    pub source_node_id: Uuid,
    pub target_node_id: Uuid,
    pub source_handle: Option<String>,
    pub condition_branch: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct AutomationDetail {
    #[serde(flatten)]
    pub automation: Automation,
    pub nodes: Vec<Value>,
    pub connections: Vec<Value>,
}

/// Exactly one trigger node, and every edge must reference a known node.
fn validate_graph(payload: &AutomationPayload) -> Result<(), AppError> {
    let trigger_count = payload.nodes.iter().filter(|n| n.node_type == "trigger").count();
    if trigger_count != 1 {
        return Err(AppError::BadRequest(format!(
            "Workflow must have exactly one trigger node, found {}",
            trigger_count
        )));
    }

    let known: HashSet<Uuid> = payload.nodes.iter().map(|n| n.id).collect();
    if known.len() != payload.nodes.len() {
        return Err(AppError::BadRequest("Duplicate node ids in workflow".to_string()));
    }

    for connection in &payload.connections {
        if !known.contains(&connection.source_node_id) || !known.contains(&connection.target_node_id) {
            return Err(AppError::BadRequest(
                "Connection references a node that is not part of the workflow".to_string(),
            ));
        }
    }

    Ok(())
}

async fn list_automations(
    State(state): State<Arc<AppState>>,
    Query(params): Query<PaginationParams>,
    auth: AuthUser,
) -> ApiResult<impl IntoResponse> {
    let total: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM automations WHERE organization_id = $1")
        .bind(auth.0.organization_id)
        .fetch_one(&state.db_pool)
        .await?;

    let automations = sqlx::query_as::<_, Automation>(
        r#"
        SELECT id, organization_id, name, is_active, trigger_type, trigger_config,
               created_by, created_at, updated_at
        FROM automations
        WHERE organization_id = $1
        ORDER BY created_at DESC
        LIMIT $2 OFFSET $3
        "#,
    )
    .bind(auth.0.organization_id)
    .bind(params.limit())
    .bind(params.offset())
    .fetch_all(&state.db_pool)
    .await?;

    Ok(Json(PaginatedResponse::new(automations, &params, total)))
}

async fn create_automation(
    State(state): State<Arc<AppState>>,
    auth: AuthUser,
    Json(payload): Json<AutomationPayload>,
) -> ApiResult<impl IntoResponse> {
    auth.require_admin()?;
    payload.validate()?;
    validate_graph(&payload)?;

    let automation_id = Uuid::new_v4();
    let mut tx = state.db_pool.begin().await?;

    sqlx::query(
        r#"
        INSERT INTO automations (id, organization_id, name, is_active, trigger_type, trigger_config, created_by, created_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7, NOW())
        "#,
    )
    .bind(automation_id)
    .bind(auth.0.organization_id)
    .bind(&payload.name)
    .bind(payload.is_active)
    .bind(&payload.trigger_type)
    .bind(&payload.trigger_config)
    .bind(auth.0.id)
    .execute(&mut *tx)
    .await?;

    insert_graph(&mut tx, automation_id, &payload).await?;
    tx.commit().await?;

    Ok((StatusCode::CREATED, Json(serde_json::json!({ "id": automation_id }))))
}

async fn get_automation(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    auth: AuthUser,
) -> ApiResult<impl IntoResponse> {
    let automation = fetch_owned(&state, id, auth.0.organization_id).await?;

    let nodes: Vec<Value> = sqlx::query_scalar(
        r#"
        SELECT jsonb_build_object(
            'id', id, 'node_type', node_type, 'action_type', action_type,
            'config', config, 'position_x', position_x, 'position_y', position_y)
        FROM automation_nodes WHERE automation_id = $1
        "#,
    )
    .bind(id)
    .fetch_all(&state.db_pool)
    .await?;

    let connections: Vec<Value> = sqlx::query_scalar(
        r#"
        SELECT jsonb_build_object(
            'id', id, 'source_node_id', source_node_id, 'target_node_id', target_node_id,
            'source_handle', source_handle, 'condition_branch', condition_branch)
        FROM automation_connections WHERE automation_id = $1
        "#,
    )
    .bind(id)
    .fetch_all(&state.db_pool)
    .await?;

    Ok(Json(AutomationDetail {
        automation,
        nodes,
        connections,
    }))
}

async fn update_automation(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    auth: AuthUser,
    Json(payload): Json<AutomationPayload>,
) -> ApiResult<impl IntoResponse> {
    auth.require_admin()?;
    payload.validate()?;
    validate_graph(&payload)?;

    fetch_owned(&state, id, auth.0.organization_id).await?;

    let mut tx = state.db_pool.begin().await?;

    sqlx::query(
        r#"
        UPDATE automations
        SET name = $2, is_active = $3, trigger_type = $4, trigger_config = $5, updated_at = NOW()
        WHERE id = $1
        "#,
    )
    .bind(id)
    .bind(&payload.name)
    .bind(payload.is_active)
    .bind(&payload.trigger_type)
    .bind(&payload.trigger_config)
    .execute(&mut *tx)
    .await?;

    // Replace the graph wholesale; node ids come from the designer.
    sqlx::query("DELETE FROM automation_connections WHERE automation_id = $1")
        .bind(id)
        .execute(&mut *tx)
        .await?;
    sqlx::query("DELETE FROM automation_nodes WHERE automation_id = $1")
        .bind(id)
        .execute(&mut *tx)
        .await?;

    insert_graph(&mut tx, id, &payload).await?;
    tx.commit().await?;

    Ok(Json(serde_json::json!({ "id": id })))
}

async fn insert_graph(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    automation_id: Uuid,
    payload: &AutomationPayload,
) -> Result<(), sqlx::Error> {
    for node in &payload.nodes {
        sqlx::query(
            r#"
            INSERT INTO automation_nodes (id, automation_id, node_type, action_type, config, position_x, position_y)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(node.id)
        .bind(automation_id)
        .bind(&node.node_type)
        .bind(&node.action_type)
        .bind(&node.config)
        .bind(node.position_x)
        .bind(node.position_y)
        .execute(&mut **tx)
        .await?;
    }

    for connection in &payload.connections {
        sqlx::query(
            r#"
            INSERT INTO automation_connections (id, automation_id, source_node_id, target_node_id, source_handle, condition_branch)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(automation_id)
        .bind(connection.source_node_id)
        .bind(connection.target_node_id)
        .bind(&connection.source_handle)
        .bind(&connection.condition_branch)
        .execute(&mut **tx)
        .await?;
    }

    Ok(())
}

async fn activate_automation(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    auth: AuthUser,
) -> ApiResult<impl IntoResponse> {
    auth.require_admin()?;
    set_active(&state, id, auth.0.organization_id, true).await
}

async fn deactivate_automation(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    auth: AuthUser,
) -> ApiResult<impl IntoResponse> {
    auth.require_admin()?;
    set_active(&state, id, auth.0.organization_id, false).await
}

async fn set_active(
    state: &Arc<AppState>,
    id: Uuid,
    organization_id: Uuid,
    is_active: bool,
) -> ApiResult<Json<Value>> {
    let result = sqlx::query(
        "UPDATE automations SET is_active = $3, updated_at = NOW() WHERE id = $1 AND organization_id = $2",
    )
    .bind(id)
    .bind(organization_id)
    .bind(is_active)
    .execute(&state.db_pool)
    .await?;

    if result.rows_affected() == 0 {
        return Err(AppError::NotFound("Automation".to_string()));
    }

    Ok(Json(serde_json::json!({ "id": id, "is_active": is_active })))
}

async fn list_executions(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Query(params): Query<PaginationParams>,
    auth: AuthUser,
) -> ApiResult<impl IntoResponse> {
    fetch_owned(&state, id, auth.0.organization_id).await?;

    let total: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM automation_executions WHERE automation_id = $1")
            .bind(id)
            .fetch_one(&state.db_pool)
            .await?;

    let executions = sqlx::query_as::<_, ExecutionRow>(
        r#"
        SELECT id, automation_id, organization_id, lead_id, conversation_id, status,
               current_node_id, started_at, completed_at, error_message, execution_data,
               next_execution_at
        FROM automation_executions
        WHERE automation_id = $1
        ORDER BY started_at DESC
        LIMIT $2 OFFSET $3
        "#,
    )
    .bind(id)
    .bind(params.limit())
    .bind(params.offset())
    .fetch_all(&state.db_pool)
    .await?;

    Ok(Json(PaginatedResponse::new(executions, &params, total)))
}

/// Execution continuation: the entire remaining behavior is resolved from
/// the persisted row, so the body is empty.
async fn advance_execution(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    auth: AuthUser,
) -> ApiResult<impl IntoResponse> {
    fetch_owned_execution(&state, id, auth.0.organization_id).await?;

    let outcome = state
        .engine
        .run_execution(id)
        .await
        .map_err(|e| AppError::InternalError(e.to_string()))?;

    Ok(Json(serde_json::json!({ "id": id, "outcome": format!("{:?}", outcome) })))
}

#[derive(Debug, Deserialize)]
pub struct CancelPayload {
    #[serde(default = "default_cancel_reason")]
    pub reason: String,
}

fn default_cancel_reason() -> String {
    "Cancelled by operator".to_string()
}

async fn cancel_execution(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    auth: AuthUser,
    Json(payload): Json<CancelPayload>,
) -> ApiResult<impl IntoResponse> {
    fetch_owned_execution(&state, id, auth.0.organization_id).await?;

    let cancelled = state
        .engine
        .cancel_execution(id, &payload.reason)
        .await
        .map_err(|e| AppError::InternalError(e.to_string()))?;

    if !cancelled {
        return Err(AppError::Conflict("Execution is not running or waiting".to_string()));
    }

    Ok(Json(serde_json::json!({ "id": id, "status": "cancelled" })))
}

#[derive(Debug, Deserialize, Default)]
pub struct RetryPayload {
    /// Node to re-enter at; defaults to the node the execution failed on.
    pub node_id: Option<Uuid>,
}

async fn retry_execution(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    auth: AuthUser,
    Json(payload): Json<RetryPayload>,
) -> ApiResult<impl IntoResponse> {
    auth.require_admin()?;
    fetch_owned_execution(&state, id, auth.0.organization_id).await?;

    match state
        .engine
        .retry_execution(id, payload.node_id)
        .await
        .map_err(|e| AppError::InternalError(e.to_string()))?
    {
        Some(outcome) => Ok(Json(serde_json::json!({ "id": id, "outcome": format!("{:?}", outcome) }))),
        None => Err(AppError::Conflict("Only failed executions can be retried".to_string())),
    }
}

async fn fetch_owned(state: &Arc<AppState>, id: Uuid, organization_id: Uuid) -> ApiResult<Automation> {
    sqlx::query_as::<_, Automation>(
        r#"
        SELECT id, organization_id, name, is_active, trigger_type, trigger_config,
               created_by, created_at, updated_at
        FROM automations WHERE id = $1 AND organization_id = $2
        "#,
    )
    .bind(id)
    .bind(organization_id)
    .fetch_optional(&state.db_pool)
    .await?
    .ok_or(AppError::NotFound("Automation".to_string()))
}

async fn fetch_owned_execution(state: &Arc<AppState>, id: Uuid, organization_id: Uuid) -> ApiResult<()> {
    let exists: Option<Uuid> = sqlx::query_scalar(
        "SELECT id FROM automation_executions WHERE id = $1 AND organization_id = $2",
    )
    .bind(id)
    .bind(organization_id)
    .fetch_optional(&state.db_pool)
    .await?;

    exists.map(|_| ()).ok_or(AppError::NotFound("Execution".to_string()))
}
