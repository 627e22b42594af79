// Execution engine. Creates execution records for matching automations and
// walks the workflow graph one node at a time, persisting the pointer after
// every step so any invocation can resume from the stored row.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::{FromRow, PgPool};
use tracing::{error, info, warn};
use uuid::Uuid;

use super::conditions::{evaluate_field_condition, trigger_filters_pass};
use super::context::ExecutionContext;
use super::events::DomainEvent;
use super::executor::{ActionTarget, NodeProcessor};
use super::graph::{NodeKind, WorkflowGraph};
use super::tenant::resolve_tenant;
use super::triggers::{self, Automation};
use super::{EngineError, EngineResult};
use crate::notifications;

/// Walking a cyclic graph must end in `failed`, never an infinite loop.
const MAX_STEPS_PER_RUN: usize = 256;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, sqlx::Type)]
#[sqlx(type_name = "execution_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Running,
    Waiting,
    Completed,
    Failed,
    Cancelled,
}

impl ExecutionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct ExecutionRow {
    pub id: Uuid,
    pub automation_id: Uuid,
    pub organization_id: Uuid,
    pub lead_id: Option<Uuid>,
    pub conversation_id: Option<Uuid>,
    pub status: ExecutionStatus,
    pub current_node_id: Option<Uuid>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub execution_data: Value,
    pub next_execution_at: Option<DateTime<Utc>>,
}

/// What handling one event amounted to.
#[derive(Debug, Clone, PartialEq)]
pub enum EventOutcome {
    /// Unknown event type: forward-compatible no-op.
    Ignored,
    /// Event processed; zero or more executions started.
    Processed { started: Vec<Uuid> },
}

/// What one engine invocation did to an execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// Terminal or missing execution: nothing to do.
    NoOp,
    /// Waiting and not yet due: left untouched.
    StillWaiting,
    /// Hit a delay node and parked.
    Waiting,
    Completed,
    Failed,
}

pub struct AutomationEngine {
    db_pool: PgPool,
    processor: NodeProcessor,
}

impl AutomationEngine {
    pub fn new(db_pool: PgPool, processor: NodeProcessor) -> Self {
        Self { db_pool, processor }
    }

    /// Process one domain event: resolve the tenant from the referenced
    /// entities, collect the active automations whose trigger spellings the
    /// event satisfies, filter by trigger config, and start one execution
    /// per accepted automation. One automation failing never blocks the
    /// others, and nothing here blocks the originating domain action.
    pub async fn handle_event(&self, event: &DomainEvent) -> EngineResult<EventOutcome> {
        let spellings = triggers::trigger_spellings(event.event_type);
        if spellings.is_empty() {
            return Ok(EventOutcome::Ignored);
        }

        let organization_id = resolve_tenant(&self.db_pool, event).await?;

        let candidates = triggers::fetch_candidates(&self.db_pool, organization_id, spellings).await?;
        if candidates.is_empty() {
            info!("No automation listens for {:?} in tenant {}", event.event_type, organization_id);
            return Ok(EventOutcome::Processed { started: Vec::new() });
        }

        let subject_assignee = match event.lead_id() {
            Some(lead_id) => {
                sqlx::query_scalar::<_, Option<Uuid>>("SELECT assigned_user_id FROM leads WHERE id = $1")
                    .bind(lead_id)
                    .fetch_optional(&self.db_pool)
                    .await?
                    .flatten()
            }
            None => None,
        };

        let mut started = Vec::new();
        for automation in candidates {
            if !trigger_filters_pass(
                &automation.trigger_type,
                &automation.trigger_config,
                &event.data,
                automation.created_by,
                subject_assignee,
            ) {
                info!("Automation '{}' rejected by trigger filters", automation.name);
                continue;
            }

            match self.start_execution(&automation, event, organization_id).await {
                Ok(Some(execution_id)) => started.push(execution_id),
                Ok(None) => {}
                Err(e) => error!("Automation '{}' could not start: {}", automation.name, e),
            }
        }

        Ok(EventOutcome::Processed { started })
    }

    /// Create the execution row for one accepted automation and walk it.
    /// Returns `None` when a non-terminal execution already exists for the
    /// same subject — duplicate trigger events are skipped, not stacked.
    async fn start_execution(
        &self,
        automation: &Automation,
        event: &DomainEvent,
        organization_id: Uuid,
    ) -> EngineResult<Option<Uuid>> {
        let lead_id = event.lead_id();
        let conversation_id = event.conversation_id();

        if let Some(lead_id) = lead_id {
            let existing: Option<Uuid> = sqlx::query_scalar(
                r#"
                SELECT id FROM automation_executions
                WHERE automation_id = $1 AND lead_id = $2 AND status IN ('running', 'waiting')
                LIMIT 1
                "#,
            )
            .bind(automation.id)
            .bind(lead_id)
            .fetch_optional(&self.db_pool)
            .await?;

            if existing.is_some() {
                info!(
                    "Automation '{}' already has a live execution for lead {}, skipping",
                    automation.name, lead_id
                );
                return Ok(None);
            }
        }

        let graph = WorkflowGraph::hydrate(&self.db_pool, automation.id).await?;
        if graph.trigger_node_id().is_none() {
            return Err(EngineError::MissingTrigger(automation.id));
        }

        let execution_id = Uuid::new_v4();
        let ctx = ExecutionContext::new(event.data.clone());
        let entry = graph.entry_node_id();

        let insert = sqlx::query(
            r#"
            INSERT INTO automation_executions
                (id, automation_id, organization_id, lead_id, conversation_id, status,
                 current_node_id, started_at, completed_at, execution_data)
            VALUES ($1, $2, $3, $4, $5, $6, $7, NOW(), $8, $9)
            "#,
        )
        .bind(execution_id)
        .bind(automation.id)
        .bind(organization_id)
        .bind(lead_id)
        .bind(conversation_id)
        .bind(if entry.is_some() { ExecutionStatus::Running } else { ExecutionStatus::Completed })
        .bind(entry)
        .bind(entry.map_or(Some(Utc::now()), |_| None))
        .bind(ctx.snapshot())
        .execute(&self.db_pool)
        .await;

        if let Err(e) = insert {
            // Two events racing past the pre-check land on the partial
            // unique index; the loser is a duplicate, not an error.
            if is_unique_violation(&e) {
                info!("Concurrent duplicate execution for automation '{}' suppressed", automation.name);
                return Ok(None);
            }
            return Err(e.into());
        }

        if entry.is_some() {
            self.run_execution(execution_id).await?;
        }

        Ok(Some(execution_id))
    }

    /// Continue an execution from its persisted pointer. This is the whole
    /// continuation contract: everything is resolved from the row, so the
    /// caller may be the event path, the delay sweep, or a retry endpoint.
    /// Invoking it on a terminal execution is a silent no-op.
    pub async fn run_execution(&self, execution_id: Uuid) -> EngineResult<RunOutcome> {
        let Some(row) = self.fetch_execution(execution_id).await? else {
            warn!("Execution {} not found", execution_id);
            return Ok(RunOutcome::NoOp);
        };

        match row.status {
            ExecutionStatus::Completed | ExecutionStatus::Failed | ExecutionStatus::Cancelled => {
                return Ok(RunOutcome::NoOp);
            }
            ExecutionStatus::Waiting => {
                if let Some(due_at) = row.next_execution_at {
                    if due_at > Utc::now() {
                        return Ok(RunOutcome::StillWaiting);
                    }
                }
            }
            ExecutionStatus::Running => {}
        }

        let automation = sqlx::query_as::<_, Automation>(
            r#"
            SELECT id, organization_id, name, is_active, trigger_type, trigger_config,
                   created_by, created_at, updated_at
            FROM automations WHERE id = $1
            "#,
        )
        .bind(row.automation_id)
        .fetch_one(&self.db_pool)
        .await?;

        let graph = WorkflowGraph::hydrate(&self.db_pool, row.automation_id).await?;
        let mut ctx = ExecutionContext::from_snapshot(&row.execution_data);
        let target = ActionTarget {
            organization_id: row.organization_id,
            lead_id: row.lead_id,
            conversation_id: row.conversation_id,
        };

        let Some(mut current) = row.current_node_id else {
            return self.complete(execution_id, &ctx).await;
        };

        if row.status == ExecutionStatus::Waiting {
            // The pointer sits on the elapsed delay node; advance past it.
            sqlx::query(
                "UPDATE automation_executions SET status = 'running', next_execution_at = NULL WHERE id = $1",
            )
            .bind(execution_id)
            .execute(&self.db_pool)
            .await?;

            match graph.next(current) {
                Some(next) => {
                    current = next;
                    self.persist_pointer(execution_id, current, &ctx).await?;
                }
                None => return self.complete(execution_id, &ctx).await,
            }
        }

        for _ in 0..MAX_STEPS_PER_RUN {
            let Some(node) = graph.node(current) else {
                return self
                    .fail(&row, &automation, format!("node {} not found in workflow graph", current))
                    .await;
            };

            let next = match &node.kind {
                NodeKind::Trigger => graph.next(current),
                NodeKind::Action(kind) => {
                    let rendered = ctx.render_config(&node.config);
                    match self.processor.execute(*kind, &rendered, &ctx, &target).await {
                        Ok(output) => {
                            if let Some(output) = output {
                                ctx.set_var("last_output", output);
                            }
                            graph.next(current)
                        }
                        Err(message) => return self.fail(&row, &automation, message).await,
                    }
                }
                NodeKind::Condition => {
                    let result = match evaluate_field_condition(&node.config, &ctx) {
                        Ok(result) => result,
                        Err(message) => return self.fail(&row, &automation, message).await,
                    };
                    let label = if result { "true" } else { "false" };
                    match graph.branch(current, label) {
                        Some(next) => Some(next),
                        None => {
                            // A condition node must be exhaustively wired.
                            return self
                                .fail(
                                    &row,
                                    &automation,
                                    format!("condition node {} has no outgoing connection for branch '{}'", current, label),
                                )
                                .await;
                        }
                    }
                }
                NodeKind::Delay => {
                    let resume_at = Utc::now() + delay_duration(&node.config);
                    sqlx::query(
                        r#"
                        UPDATE automation_executions
                        SET status = 'waiting', current_node_id = $2, next_execution_at = $3, execution_data = $4
                        WHERE id = $1
                        "#,
                    )
                    .bind(execution_id)
                    .bind(current)
                    .bind(resume_at)
                    .bind(ctx.snapshot())
                    .execute(&self.db_pool)
                    .await?;

                    info!("Execution {} waiting until {}", execution_id, resume_at);
                    return Ok(RunOutcome::Waiting);
                }
            };

            match next {
                Some(next) => {
                    current = next;
                    self.persist_pointer(execution_id, current, &ctx).await?;
                }
                None => return self.complete(execution_id, &ctx).await,
            }
        }

        self.fail(&row, &automation, format!("execution exceeded {} steps", MAX_STEPS_PER_RUN))
            .await
    }

    /// Resume every waiting execution whose delay has elapsed. Driven by the
    /// minute sweep; redundant invocations are covered by the status guard.
    pub async fn resume_due_executions(&self, now: DateTime<Utc>) -> EngineResult<usize> {
        let due: Vec<Uuid> = sqlx::query_scalar(
            "SELECT id FROM automation_executions WHERE status = 'waiting' AND next_execution_at <= $1",
        )
        .bind(now)
        .fetch_all(&self.db_pool)
        .await?;

        let count = due.len();
        for execution_id in due {
            if let Err(e) = self.run_execution(execution_id).await {
                error!("Failed to resume execution {}: {}", execution_id, e);
            }
        }

        Ok(count)
    }

    /// Externally mark an execution cancelled. The next invocation that
    /// finds the non-running status simply stops.
    pub async fn cancel_execution(&self, execution_id: Uuid, reason: &str) -> EngineResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE automation_executions
            SET status = 'cancelled', error_message = $2, completed_at = NOW()
            WHERE id = $1 AND status IN ('running', 'waiting')
            "#,
        )
        .bind(execution_id)
        .bind(reason)
        .execute(&self.db_pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Re-enter a failed execution at a chosen node (defaults to where it
    /// failed). Effects already performed are not rolled back.
    pub async fn retry_execution(
        &self,
        execution_id: Uuid,
        from_node: Option<Uuid>,
    ) -> EngineResult<Option<RunOutcome>> {
        let result = sqlx::query(
            r#"
            UPDATE automation_executions
            SET status = 'running', error_message = NULL, completed_at = NULL,
                current_node_id = COALESCE($2, current_node_id)
            WHERE id = $1 AND status = 'failed'
            "#,
        )
        .bind(execution_id)
        .bind(from_node)
        .execute(&self.db_pool)
        .await?;

        if result.rows_affected() == 0 {
            return Ok(None);
        }

        Ok(Some(self.run_execution(execution_id).await?))
    }

    pub async fn fetch_execution(&self, execution_id: Uuid) -> EngineResult<Option<ExecutionRow>> {
        let row = sqlx::query_as::<_, ExecutionRow>(
            r#"
            SELECT id, automation_id, organization_id, lead_id, conversation_id, status,
                   current_node_id, started_at, completed_at, error_message, execution_data,
                   next_execution_at
            FROM automation_executions WHERE id = $1
            "#,
        )
        .bind(execution_id)
        .fetch_optional(&self.db_pool)
        .await?;

        Ok(row)
    }

    async fn persist_pointer(
        &self,
        execution_id: Uuid,
        node_id: Uuid,
        ctx: &ExecutionContext,
    ) -> EngineResult<()> {
        sqlx::query(
            "UPDATE automation_executions SET current_node_id = $2, execution_data = $3 WHERE id = $1",
        )
        .bind(execution_id)
        .bind(node_id)
        .bind(ctx.snapshot())
        .execute(&self.db_pool)
        .await?;

        Ok(())
    }

    async fn complete(&self, execution_id: Uuid, ctx: &ExecutionContext) -> EngineResult<RunOutcome> {
        sqlx::query(
            r#"
            UPDATE automation_executions
            SET status = 'completed', completed_at = NOW(), execution_data = $2, next_execution_at = NULL
            WHERE id = $1
            "#,
        )
        .bind(execution_id)
        .bind(ctx.snapshot())
        .execute(&self.db_pool)
        .await?;

        info!("Execution {} completed", execution_id);
        Ok(RunOutcome::Completed)
    }

    /// Mark the run failed with the originating error. Prior nodes' effects
    /// already happened and stay; re-entry is a human decision via retry.
    async fn fail(
        &self,
        row: &ExecutionRow,
        automation: &Automation,
        message: String,
    ) -> EngineResult<RunOutcome> {
        error!("Execution {} failed: {}", row.id, message);

        sqlx::query(
            r#"
            UPDATE automation_executions
            SET status = 'failed', error_message = $2, completed_at = NOW(), next_execution_at = NULL
            WHERE id = $1
            "#,
        )
        .bind(row.id)
        .bind(&message)
        .execute(&self.db_pool)
        .await?;

        if let Some(created_by) = automation.created_by {
            if let Err(e) = notifications::notify_execution_failed(
                &self.db_pool,
                created_by,
                row.organization_id,
                &automation.name,
                &message,
                row.lead_id,
            )
            .await
            {
                warn!("Failed to create failure notification: {}", e);
            }
        }

        Ok(RunOutcome::Failed)
    }
}

/// A delay node's `{amount, unit}` config; minutes when the unit is absent.
fn delay_duration(config: &Value) -> Duration {
    let amount = config.get("amount").and_then(|v| v.as_i64()).unwrap_or(0).max(0);

    match config.get("unit").and_then(|v| v.as_str()).unwrap_or("minutes") {
        "days" => Duration::days(amount),
        "hours" => Duration::hours(amount),
        "seconds" => Duration::seconds(amount),
        _ => Duration::minutes(amount),
    }
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(
        err,
        sqlx::Error::Database(db) if db.code().as_deref() == Some("23505")
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_delay_duration_units() {
        assert_eq!(delay_duration(&json!({ "amount": 5 })), Duration::minutes(5));
        assert_eq!(delay_duration(&json!({ "amount": 2, "unit": "hours" })), Duration::hours(2));
        assert_eq!(delay_duration(&json!({ "amount": 1, "unit": "days" })), Duration::days(1));
        assert_eq!(delay_duration(&json!({ "amount": 30, "unit": "seconds" })), Duration::seconds(30));
    }

    #[test]
    fn test_delay_duration_defaults_to_zero() {
        assert_eq!(delay_duration(&json!({})), Duration::minutes(0));
        // negative amounts never schedule into the past
        assert_eq!(delay_duration(&json!({ "amount": -10 })), Duration::minutes(0));
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(ExecutionStatus::Completed.is_terminal());
        assert!(ExecutionStatus::Failed.is_terminal());
        assert!(ExecutionStatus::Cancelled.is_terminal());
        assert!(!ExecutionStatus::Running.is_terminal());
        assert!(!ExecutionStatus::Waiting.is_terminal());
    }
}
