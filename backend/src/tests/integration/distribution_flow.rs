// End-to-end distribution queue scenarios.

use chrono::{Duration, Utc};
use serde_json::json;
use serial_test::serial;
use std::sync::Arc;
use testcontainers::clients::Cli;
use testcontainers_modules::postgres::Postgres;
use uuid::Uuid;

use crate::automations::{AutomationEngine, NodeProcessor};
use crate::distribution::{AssignmentOutcome, LeadDistributor};
use crate::outbox::Outbox;
use crate::tests::fixtures;
use crate::tests::helpers::{count_table_rows, pool_for_port};

fn distributor_for(pool: &sqlx::PgPool) -> LeadDistributor {
    let processor = NodeProcessor::new(pool.clone(), Outbox::new(pool.clone()), "test-secret".to_string());
    let engine = Arc::new(AutomationEngine::new(pool.clone(), processor));
    LeadDistributor::new(pool.clone(), engine)
}

async fn assigned_user(pool: &sqlx::PgPool, lead_id: Uuid) -> Option<Uuid> {
    sqlx::query_scalar("SELECT assigned_user_id FROM leads WHERE id = $1")
        .bind(lead_id)
        .fetch_one(pool)
        .await
        .expect("lead row")
}

/// Scenario B: a tag rule queue and a zero-rule fallback queue. The tagged
/// lead lands on the first queue; the untagged lead falls through.
#[tokio::test]
#[ignore]
#[serial]
async fn test_tag_rule_and_fallback_queue() {
    let docker = Cli::default();
    let node = docker.run(Postgres::default());
    let pool = pool_for_port(node.get_host_port_ipv4(5432)).await;

    let org = fixtures::insert_organization(&pool).await;
    let closer = fixtures::insert_user(&pool, org, "agent").await;
    let generalist = fixtures::insert_user(&pool, org, "agent").await;

    let hot_tag = fixtures::insert_tag(&pool, org, "hot").await;

    let hot_queue = fixtures::insert_queue(&pool, org, "Hot leads", json!({})).await;
    fixtures::insert_queue_rule(&pool, hot_queue, "tag", vec![hot_tag.to_string()], 10).await;
    fixtures::insert_queue_member(&pool, hot_queue, closer, 1, 0).await;

    let fallback_queue = fixtures::insert_queue(&pool, org, "Everything else", json!({})).await;
    fixtures::insert_queue_member(&pool, fallback_queue, generalist, 1, 0).await;

    let distributor = distributor_for(&pool);

    let hot_lead = fixtures::insert_lead(&pool, org).await;
    fixtures::tag_lead(&pool, hot_lead, hot_tag).await;

    let outcome = distributor.distribute(hot_lead).await.unwrap();
    assert_eq!(
        outcome,
        AssignmentOutcome::Assigned {
            user_id: closer,
            queue_id: hot_queue
        }
    );
    assert_eq!(assigned_user(&pool, hot_lead).await, Some(closer));

    let plain_lead = fixtures::insert_lead(&pool, org).await;
    let outcome = distributor.distribute(plain_lead).await.unwrap();
    assert_eq!(
        outcome,
        AssignmentOutcome::Assigned {
            user_id: generalist,
            queue_id: fallback_queue
        }
    );
}

/// Simple strategy continues the rotation where it left off across
/// separate invocations.
#[tokio::test]
#[ignore]
#[serial]
async fn test_rotation_cursor_persists_between_assignments() {
    let docker = Cli::default();
    let node = docker.run(Postgres::default());
    let pool = pool_for_port(node.get_host_port_ipv4(5432)).await;

    let org = fixtures::insert_organization(&pool).await;
    let first = fixtures::insert_user(&pool, org, "agent").await;
    let second = fixtures::insert_user(&pool, org, "agent").await;

    let queue = fixtures::insert_queue(&pool, org, "Rotation", json!({})).await;
    fixtures::insert_queue_member(&pool, queue, first, 1, 0).await;
    fixtures::insert_queue_member(&pool, queue, second, 1, 1).await;

    let distributor = distributor_for(&pool);

    let lead_a = fixtures::insert_lead(&pool, org).await;
    let lead_b = fixtures::insert_lead(&pool, org).await;
    let lead_c = fixtures::insert_lead(&pool, org).await;

    distributor.distribute(lead_a).await.unwrap();
    distributor.distribute(lead_b).await.unwrap();
    distributor.distribute(lead_c).await.unwrap();

    assert_eq!(assigned_user(&pool, lead_a).await, Some(first));
    assert_eq!(assigned_user(&pool, lead_b).await, Some(second));
    // wraps back to the first member
    assert_eq!(assigned_user(&pool, lead_c).await, Some(first));
}

/// Schedule gating: outside every active window the lead is pooled (with
/// redistribution) instead of being assigned directly.
#[tokio::test]
#[ignore]
#[serial]
async fn test_closed_schedule_routes_to_pool() {
    let docker = Cli::default();
    let node = docker.run(Postgres::default());
    let pool = pool_for_port(node.get_host_port_ipv4(5432)).await;

    let org = fixtures::insert_organization(&pool).await;
    let agent = fixtures::insert_user(&pool, org, "agent").await;

    let queue = fixtures::insert_queue(
        &pool,
        org,
        "Office hours",
        json!({ "enable_redistribution": true, "redistribution_timeout_minutes": 5 }),
    )
    .await;
    fixtures::insert_queue_member(&pool, queue, agent, 1, 0).await;

    // every day disabled: the queue is never open
    for day in 0..7i16 {
        fixtures::insert_schedule_window(&pool, queue, day, false, "09:00", "18:00").await;
    }

    let distributor = distributor_for(&pool);
    let lead = fixtures::insert_lead(&pool, org).await;

    let outcome = distributor.distribute(lead).await.unwrap();
    assert_eq!(outcome, AssignmentOutcome::Pooled { queue_id: Some(queue) });
    assert_eq!(assigned_user(&pool, lead).await, None);
    assert_eq!(count_table_rows(&pool, "lead_pool_entries").await, 1);
}

/// No matching queue and no fallback: the lead goes to the tenant admin.
#[tokio::test]
#[ignore]
#[serial]
async fn test_admin_fallback_when_nothing_matches() {
    let docker = Cli::default();
    let node = docker.run(Postgres::default());
    let pool = pool_for_port(node.get_host_port_ipv4(5432)).await;

    let org = fixtures::insert_organization(&pool).await;
    let admin = fixtures::insert_user(&pool, org, "admin").await;

    let queue = fixtures::insert_queue(&pool, org, "Campaigns only", json!({})).await;
    fixtures::insert_queue_rule(&pool, queue, "campaign_contains", vec!["summer".to_string()], 5).await;

    let distributor = distributor_for(&pool);
    let lead = fixtures::insert_lead(&pool, org).await;

    let outcome = distributor.distribute(lead).await.unwrap();
    assert_eq!(outcome, AssignmentOutcome::AdminFallback { user_id: admin });
    assert_eq!(assigned_user(&pool, lead).await, Some(admin));
}

/// Reentry with keep_assignee goes straight back to the prior owner even
/// though the lead no longer matches any rule; redistribute re-runs the
/// pipeline.
#[tokio::test]
#[ignore]
#[serial]
async fn test_reentry_keep_assignee_short_circuits() {
    let docker = Cli::default();
    let node = docker.run(Postgres::default());
    let pool = pool_for_port(node.get_host_port_ipv4(5432)).await;

    let org = fixtures::insert_organization(&pool).await;
    let owner = fixtures::insert_user(&pool, org, "agent").await;

    let queue = fixtures::insert_queue(&pool, org, "Keepers", json!({})).await;
    sqlx::query("UPDATE round_robins SET reentry_behavior = 'keep_assignee' WHERE id = $1")
        .bind(queue)
        .execute(&pool)
        .await
        .unwrap();

    let lead = fixtures::insert_lead(&pool, org).await;
    sqlx::query(
        "UPDATE leads SET status = 'lost', assigned_user_id = NULL, last_assigned_user_id = $2, round_robin_id = $3 WHERE id = $1",
    )
    .bind(lead)
    .bind(owner)
    .bind(queue)
    .execute(&pool)
    .await
    .unwrap();

    let distributor = distributor_for(&pool);
    let outcome = distributor.handle_reentry(lead).await.unwrap();

    assert_eq!(outcome, AssignmentOutcome::KeptAssignee { user_id: owner });
    assert_eq!(assigned_user(&pool, lead).await, Some(owner));
}

/// Pool redistribution: a due pool entry is re-attempted by the sweep and
/// exhausted entries fall back to the admin.
#[tokio::test]
#[ignore]
#[serial]
async fn test_redistribution_sweep_exhausts_to_admin() {
    let docker = Cli::default();
    let node = docker.run(Postgres::default());
    let pool = pool_for_port(node.get_host_port_ipv4(5432)).await;

    let org = fixtures::insert_organization(&pool).await;
    let admin = fixtures::insert_user(&pool, org, "admin").await;

    // redistribution enabled but the queue has no members at all
    let queue = fixtures::insert_queue(
        &pool,
        org,
        "Empty pool",
        json!({ "enable_redistribution": true, "redistribution_timeout_minutes": 1, "redistribution_max_attempts": 1 }),
    )
    .await;
    // zero rules: unconditional fallback candidate
    let _ = queue;

    let distributor = distributor_for(&pool);
    let lead = fixtures::insert_lead(&pool, org).await;

    let outcome = distributor.distribute(lead).await.unwrap();
    assert_eq!(outcome, AssignmentOutcome::Pooled { queue_id: Some(queue) });

    // make the entry due and sweep: one attempt allowed, so it exhausts
    sqlx::query("UPDATE lead_pool_entries SET next_attempt_at = $1")
        .bind(Utc::now() - Duration::minutes(1))
        .execute(&pool)
        .await
        .unwrap();

    let stats = distributor.redistribute_due(Utc::now()).await.unwrap();
    assert_eq!(stats.reattempted, 1);
    assert_eq!(stats.exhausted, 1);

    assert_eq!(assigned_user(&pool, lead).await, Some(admin));

    let status: String = sqlx::query_scalar("SELECT status FROM lead_pool_entries WHERE lead_id = $1")
        .bind(lead)
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(status, "exhausted");
}
