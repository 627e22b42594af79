// The distributor: given an unassigned lead, pick zero or one queue, then
// zero or one member, and always land on a deterministic outcome —
// assigned, pooled, or admin fallback. Never an exception.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{error, info, warn};
use uuid::Uuid;

use super::rules::{select_queue, LeadProfile, QueueMatch};
use super::schedule::is_open;
use super::selection::{select_rotation, select_weighted};
use super::{DistributionError, DistributionResult, QueueMember, QueueRule, RoundRobinQueue};
use crate::automations::{AutomationEngine, DomainEvent};
use crate::notifications;
use lattice_shared::{Lead, ScheduleWindow};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum AssignmentOutcome {
    Assigned { user_id: Uuid, queue_id: Uuid },
    KeptAssignee { user_id: Uuid },
    AdminFallback { user_id: Uuid },
    Pooled { queue_id: Option<Uuid> },
    AlreadyAssigned,
}

#[derive(Debug, Default)]
pub struct SweepStats {
    pub reattempted: usize,
    pub assigned: usize,
    pub exhausted: usize,
}

pub struct LeadDistributor {
    db_pool: PgPool,
    engine: Arc<AutomationEngine>,
}

impl LeadDistributor {
    pub fn new(db_pool: PgPool, engine: Arc<AutomationEngine>) -> Self {
        Self { db_pool, engine }
    }

    /// Entry point for newly created leads.
    pub async fn distribute(&self, lead_id: Uuid) -> DistributionResult<AssignmentOutcome> {
        let lead = self.fetch_lead(lead_id).await?;

        if lead.assigned_user_id.is_some() {
            return Ok(AssignmentOutcome::AlreadyAssigned);
        }

        self.match_and_assign(&lead, true).await
    }

    /// A previously closed/lost lead re-engaged. `keep_assignee` queues
    /// short-circuit straight back to the original owner even if that owner
    /// would no longer match current rules; `redistribute` re-runs the full
    /// matching pipeline.
    pub async fn handle_reentry(&self, lead_id: Uuid) -> DistributionResult<AssignmentOutcome> {
        let lead = self.fetch_lead(lead_id).await?;

        let reentry_behavior: Option<String> = match lead.round_robin_id {
            Some(queue_id) => {
                sqlx::query_scalar("SELECT reentry_behavior FROM round_robins WHERE id = $1")
                    .bind(queue_id)
                    .fetch_optional(&self.db_pool)
                    .await?
            }
            None => None,
        };

        if reentry_behavior.as_deref() == Some("keep_assignee") {
            if let Some(owner) = lead.last_assigned_user_id.or(lead.assigned_user_id) {
                self.write_assignment(&lead, owner, lead.round_robin_id, false, 0).await?;
                self.after_assignment(&lead, owner, lead.round_robin_id).await;
                return Ok(AssignmentOutcome::KeptAssignee { user_id: owner });
            }
        }

        sqlx::query("UPDATE leads SET assigned_user_id = NULL, status = 'open', updated_at = NOW() WHERE id = $1")
            .bind(lead.id)
            .execute(&self.db_pool)
            .await?;

        let mut lead = lead;
        lead.assigned_user_id = None;
        self.match_and_assign(&lead, true).await
    }

    /// The full matching pipeline: rules → schedule gate → member selection.
    async fn match_and_assign(
        &self,
        lead: &Lead,
        continue_cursor: bool,
    ) -> DistributionResult<AssignmentOutcome> {
        let profile = LeadProfile::load(&self.db_pool, lead).await?;
        let queues = self.load_queues_with_rules(lead.organization_id).await?;

        let matched = select_queue(&queues, &profile);
        let queue = match &matched {
            QueueMatch::Rule { queue_id, .. } | QueueMatch::Fallback { queue_id } => queues
                .iter()
                .map(|(q, _)| q)
                .find(|q| q.id == *queue_id)
                .cloned(),
            QueueMatch::None => None,
        };

        let Some(queue) = queue else {
            info!("No queue matches lead {}, falling back to admin", lead.id);
            return self.admin_fallback(lead, None).await;
        };

        let settings = queue.settings();

        let windows = self.load_schedule(queue.id).await?;
        if !is_open(&windows, Utc::now()) {
            info!("Queue '{}' is outside its active windows, pooling lead {}", queue.name, lead.id);
            return self.pool_lead(lead, Some(&queue), "schedule_closed").await;
        }

        let members = self.load_active_members(queue.id).await?;

        let cursor = if continue_cursor { queue.rotation_cursor } else { -1 };
        let selected = match queue.strategy.as_str() {
            "weighted" => select_weighted(&members, &mut rand::thread_rng()).map(|user| (user, cursor)),
            _ => select_rotation(&members, cursor),
        };

        let Some((user_id, new_cursor)) = selected else {
            warn!("Queue '{}' has no selectable member for lead {}", queue.name, lead.id);
            return self.pool_lead(lead, Some(&queue), "no_active_member").await;
        };

        let checkin_minutes = if settings.require_checkin {
            settings.redistribution_timeout_minutes
        } else {
            0
        };

        self.write_assignment_with_cursor(lead, user_id, &queue, settings.require_checkin, checkin_minutes, new_cursor)
            .await?;
        self.after_assignment(lead, user_id, Some(queue.id)).await;

        Ok(AssignmentOutcome::Assigned {
            user_id,
            queue_id: queue.id,
        })
    }

    /// No queue wants the lead: hand it to the first active tenant admin
    /// rather than leaving it silently unassigned. With no admin available
    /// the lead is parked in the pool for manual action.
    async fn admin_fallback(&self, lead: &Lead, queue: Option<&RoundRobinQueue>) -> DistributionResult<AssignmentOutcome> {
        let admin: Option<Uuid> = sqlx::query_scalar(
            r#"
            SELECT id FROM users
            WHERE organization_id = $1 AND role = 'admin' AND is_active = true
            ORDER BY created_at ASC
            LIMIT 1
            "#,
        )
        .bind(lead.organization_id)
        .fetch_optional(&self.db_pool)
        .await?;

        let Some(admin_id) = admin else {
            warn!(
                "No active admin in organization {} for lead {}, leaving pooled",
                lead.organization_id, lead.id
            );
            return self.insert_pool_entry(lead, queue.map(|q| q.id), "no_admin_available", None).await;
        };

        self.write_assignment(lead, admin_id, queue.map(|q| q.id), false, 0).await?;
        self.after_assignment(lead, admin_id, queue.map(|q| q.id)).await;

        Ok(AssignmentOutcome::AdminFallback { user_id: admin_id })
    }

    /// Park the lead: redistribution-enabled queues get a timed retry,
    /// everything else goes straight to the admin fallback.
    async fn pool_lead(
        &self,
        lead: &Lead,
        queue: Option<&RoundRobinQueue>,
        reason: &str,
    ) -> DistributionResult<AssignmentOutcome> {
        let Some(queue) = queue else {
            return self.admin_fallback(lead, None).await;
        };

        let settings = queue.settings();
        if !settings.enable_redistribution {
            return self.admin_fallback(lead, Some(queue)).await;
        }

        let next_attempt = Utc::now() + Duration::minutes(settings.redistribution_timeout_minutes as i64);
        self.insert_pool_entry(lead, Some(queue.id), reason, Some(next_attempt)).await
    }

    async fn insert_pool_entry(
        &self,
        lead: &Lead,
        queue_id: Option<Uuid>,
        reason: &str,
        next_attempt_at: Option<DateTime<Utc>>,
    ) -> DistributionResult<AssignmentOutcome> {
        sqlx::query(
            r#"
            INSERT INTO lead_pool_entries (id, lead_id, queue_id, organization_id, reason, attempts, next_attempt_at, status)
            VALUES ($1, $2, $3, $4, $5, 0, $6, 'pending')
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(lead.id)
        .bind(queue_id)
        .bind(lead.organization_id)
        .bind(reason)
        .bind(next_attempt_at)
        .execute(&self.db_pool)
        .await?;

        info!("Lead {} pooled ({})", lead.id, reason);
        Ok(AssignmentOutcome::Pooled { queue_id })
    }

    async fn write_assignment(
        &self,
        lead: &Lead,
        user_id: Uuid,
        queue_id: Option<Uuid>,
        require_checkin: bool,
        checkin_minutes: i32,
    ) -> DistributionResult<()> {
        let mut tx = self.db_pool.begin().await?;

        sqlx::query(
            r#"
            UPDATE leads
            SET assigned_user_id = $2, last_assigned_user_id = $2, round_robin_id = COALESCE($3, round_robin_id),
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(lead.id)
        .bind(user_id)
        .bind(queue_id)
        .execute(&mut *tx)
        .await?;

        let acknowledge_by = require_checkin.then(|| Utc::now() + Duration::minutes(checkin_minutes.max(1) as i64));

        sqlx::query(
            r#"
            INSERT INTO lead_assignments (id, lead_id, queue_id, user_id, requires_checkin, acknowledged, acknowledge_by)
            VALUES ($1, $2, $3, $4, $5, false, $6)
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(lead.id)
        .bind(queue_id)
        .bind(user_id)
        .bind(require_checkin)
        .bind(acknowledge_by)
        .execute(&mut *tx)
        .await?;

        sqlx::query("UPDATE lead_pool_entries SET status = 'assigned' WHERE lead_id = $1 AND status = 'pending'")
            .bind(lead.id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }

    /// Assignment through a queue also moves the lead to the queue's target
    /// pipeline/stage and persists the rotation cursor, all in one
    /// transaction.
    async fn write_assignment_with_cursor(
        &self,
        lead: &Lead,
        user_id: Uuid,
        queue: &RoundRobinQueue,
        require_checkin: bool,
        checkin_minutes: i32,
        new_cursor: i32,
    ) -> DistributionResult<()> {
        let mut tx = self.db_pool.begin().await?;

        sqlx::query(
            r#"
            UPDATE leads
            SET assigned_user_id = $2, last_assigned_user_id = $2, round_robin_id = $3,
                pipeline_id = COALESCE($4, pipeline_id), stage_id = COALESCE($5, stage_id),
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(lead.id)
        .bind(user_id)
        .bind(queue.id)
        .bind(queue.target_pipeline_id)
        .bind(queue.target_stage_id)
        .execute(&mut *tx)
        .await?;

        if queue.strategy == "simple" {
            sqlx::query("UPDATE round_robins SET rotation_cursor = $2, updated_at = NOW() WHERE id = $1")
                .bind(queue.id)
                .bind(new_cursor)
                .execute(&mut *tx)
                .await?;
        }

        let acknowledge_by = require_checkin.then(|| Utc::now() + Duration::minutes(checkin_minutes.max(1) as i64));

        sqlx::query(
            r#"
            INSERT INTO lead_assignments (id, lead_id, queue_id, user_id, requires_checkin, acknowledged, acknowledge_by)
            VALUES ($1, $2, $3, $4, $5, false, $6)
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(lead.id)
        .bind(queue.id)
        .bind(user_id)
        .bind(require_checkin)
        .bind(acknowledge_by)
        .execute(&mut *tx)
        .await?;

        sqlx::query("UPDATE lead_pool_entries SET status = 'assigned' WHERE lead_id = $1 AND status = 'pending'")
            .bind(lead.id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }

    /// Post-commit effects: member notification and the `lead_assigned`
    /// event automations may listen for. Failures here are logged, never
    /// surfaced — the assignment already happened.
    async fn after_assignment(&self, lead: &Lead, user_id: Uuid, queue_id: Option<Uuid>) {
        if let Err(e) =
            notifications::notify_assignment(&self.db_pool, user_id, lead.organization_id, lead.id, &lead.name).await
        {
            warn!("Failed to create assignment notification: {}", e);
        }

        let event = DomainEvent::lead_assigned(lead.id, user_id, queue_id);
        if let Err(e) = self.engine.handle_event(&event).await {
            error!("lead_assigned event processing failed: {}", e);
        }
    }

    /// Timed pool sweep: re-attempt due entries, up to the queue's max
    /// attempts, then fall back to admin. Safe to double-fire.
    pub async fn redistribute_due(&self, now: DateTime<Utc>) -> DistributionResult<SweepStats> {
        #[derive(sqlx::FromRow)]
        struct PoolRow {
            id: Uuid,
            lead_id: Uuid,
            queue_id: Option<Uuid>,
            attempts: i32,
        }

        let due = sqlx::query_as::<_, PoolRow>(
            r#"
            SELECT id, lead_id, queue_id, attempts
            FROM lead_pool_entries
            WHERE status = 'pending' AND next_attempt_at IS NOT NULL AND next_attempt_at <= $1
            ORDER BY next_attempt_at ASC
            LIMIT 100
            "#,
        )
        .bind(now)
        .fetch_all(&self.db_pool)
        .await?;

        let mut stats = SweepStats::default();

        for entry in due {
            stats.reattempted += 1;

            let lead = match self.fetch_lead(entry.lead_id).await {
                Ok(lead) => lead,
                Err(e) => {
                    warn!("Pool entry {} references missing lead: {}", entry.id, e);
                    sqlx::query("UPDATE lead_pool_entries SET status = 'exhausted' WHERE id = $1")
                        .bind(entry.id)
                        .execute(&self.db_pool)
                        .await?;
                    continue;
                }
            };

            let queue = match entry.queue_id {
                Some(queue_id) => self.fetch_queue(queue_id).await?,
                None => None,
            };
            let settings = queue.as_ref().map(|q| q.settings()).unwrap_or_default();
            let attempts = entry.attempts + 1;

            if attempts >= settings.redistribution_max_attempts {
                sqlx::query("UPDATE lead_pool_entries SET status = 'exhausted', attempts = $2 WHERE id = $1")
                    .bind(entry.id)
                    .bind(attempts)
                    .execute(&self.db_pool)
                    .await?;

                self.admin_fallback(&lead, queue.as_ref()).await?;
                stats.exhausted += 1;
                continue;
            }

            let outcome = self.match_and_assign(&lead, settings.preserve_position).await?;
            match outcome {
                AssignmentOutcome::Assigned { .. } | AssignmentOutcome::AdminFallback { .. } => {
                    sqlx::query("UPDATE lead_pool_entries SET status = 'assigned', attempts = $2 WHERE id = $1")
                        .bind(entry.id)
                        .bind(attempts)
                        .execute(&self.db_pool)
                        .await?;
                    stats.assigned += 1;
                }
                _ => {
                    let next_attempt =
                        now + Duration::minutes(settings.redistribution_timeout_minutes as i64);
                    sqlx::query(
                        "UPDATE lead_pool_entries SET attempts = $2, next_attempt_at = $3 WHERE id = $1 AND status = 'pending'",
                    )
                    .bind(entry.id)
                    .bind(attempts)
                    .bind(next_attempt)
                    .execute(&self.db_pool)
                    .await?;
                }
            }
        }

        Ok(stats)
    }

    /// Check-in sweep: assignments not acknowledged before their deadline
    /// are treated as pool re-entries.
    pub async fn expire_unacknowledged(&self, now: DateTime<Utc>) -> DistributionResult<usize> {
        #[derive(sqlx::FromRow)]
        struct ExpiredRow {
            id: Uuid,
            lead_id: Uuid,
            queue_id: Option<Uuid>,
        }

        let expired = sqlx::query_as::<_, ExpiredRow>(
            r#"
            SELECT id, lead_id, queue_id
            FROM lead_assignments
            WHERE requires_checkin AND NOT acknowledged AND NOT expired AND acknowledge_by <= $1
            "#,
        )
        .bind(now)
        .fetch_all(&self.db_pool)
        .await?;

        let count = expired.len();

        for assignment in expired {
            sqlx::query("UPDATE lead_assignments SET expired = true WHERE id = $1")
                .bind(assignment.id)
                .execute(&self.db_pool)
                .await?;

            sqlx::query("UPDATE leads SET assigned_user_id = NULL, updated_at = NOW() WHERE id = $1")
                .bind(assignment.lead_id)
                .execute(&self.db_pool)
                .await?;

            let lead = match self.fetch_lead(assignment.lead_id).await {
                Ok(lead) => lead,
                Err(_) => continue,
            };
            let queue = match assignment.queue_id {
                Some(queue_id) => self.fetch_queue(queue_id).await?,
                None => None,
            };

            info!("Assignment {} expired without check-in, re-pooling lead {}", assignment.id, lead.id);
            self.pool_lead(&lead, queue.as_ref(), "checkin_timeout").await?;
        }

        Ok(count)
    }

    /// Member check-in: confirms the assignment before the deadline.
    pub async fn acknowledge(&self, assignment_id: Uuid, user_id: Uuid) -> DistributionResult<bool> {
        let result = sqlx::query(
            "UPDATE lead_assignments SET acknowledged = true WHERE id = $1 AND user_id = $2 AND NOT acknowledged AND NOT expired",
        )
        .bind(assignment_id)
        .bind(user_id)
        .execute(&self.db_pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn fetch_lead(&self, lead_id: Uuid) -> DistributionResult<Lead> {
        sqlx::query_as::<_, Lead>("SELECT * FROM leads WHERE id = $1")
            .bind(lead_id)
            .fetch_optional(&self.db_pool)
            .await?
            .ok_or(DistributionError::LeadNotFound(lead_id))
    }

    async fn fetch_queue(&self, queue_id: Uuid) -> DistributionResult<Option<RoundRobinQueue>> {
        let queue = sqlx::query_as::<_, RoundRobinQueue>("SELECT * FROM round_robins WHERE id = $1")
            .bind(queue_id)
            .fetch_optional(&self.db_pool)
            .await?;
        Ok(queue)
    }

    async fn load_queues_with_rules(
        &self,
        organization_id: Uuid,
    ) -> DistributionResult<Vec<(RoundRobinQueue, Vec<QueueRule>)>> {
        let queues = sqlx::query_as::<_, RoundRobinQueue>(
            "SELECT * FROM round_robins WHERE organization_id = $1 AND is_active = true ORDER BY created_at ASC",
        )
        .bind(organization_id)
        .fetch_all(&self.db_pool)
        .await?;

        if queues.is_empty() {
            return Ok(Vec::new());
        }

        let queue_ids: Vec<Uuid> = queues.iter().map(|q| q.id).collect();
        let rules = sqlx::query_as::<_, QueueRule>(
            "SELECT * FROM round_robin_rules WHERE queue_id = ANY($1) ORDER BY priority DESC",
        )
        .bind(&queue_ids)
        .fetch_all(&self.db_pool)
        .await?;

        let mut by_queue: HashMap<Uuid, Vec<QueueRule>> = HashMap::new();
        for rule in rules {
            by_queue.entry(rule.queue_id).or_default().push(rule);
        }

        Ok(queues
            .into_iter()
            .map(|q| {
                let rules = by_queue.remove(&q.id).unwrap_or_default();
                (q, rules)
            })
            .collect())
    }

    async fn load_schedule(&self, queue_id: Uuid) -> DistributionResult<Vec<ScheduleWindow>> {
        let windows = sqlx::query_as::<_, ScheduleWindow>(
            "SELECT day, enabled, start_time, end_time FROM round_robin_schedules WHERE queue_id = $1 ORDER BY day",
        )
        .bind(queue_id)
        .fetch_all(&self.db_pool)
        .await?;
        Ok(windows)
    }

    async fn load_active_members(&self, queue_id: Uuid) -> DistributionResult<Vec<QueueMember>> {
        let members = sqlx::query_as::<_, QueueMember>(
            r#"
            SELECT m.user_id, m.weight, m.position
            FROM round_robin_members m
            JOIN users u ON u.id = m.user_id
            WHERE m.queue_id = $1 AND u.is_active = true
            ORDER BY m.position ASC
            "#,
        )
        .bind(queue_id)
        .fetch_all(&self.db_pool)
        .await?;
        Ok(members)
    }
}
