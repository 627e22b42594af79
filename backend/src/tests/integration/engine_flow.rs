// End-to-end automation engine scenarios.

use chrono::{Duration, Utc};
use serde_json::json;
use serial_test::serial;
use testcontainers::clients::Cli;
use testcontainers_modules::postgres::Postgres;
use uuid::Uuid;

use crate::automations::{AutomationEngine, DomainEvent, EventOutcome, NodeProcessor, RunOutcome};
use crate::outbox::Outbox;
use crate::tests::fixtures;
use crate::tests::helpers::{count_table_rows, execution_status, pool_for_port};

fn engine_for(pool: &sqlx::PgPool) -> AutomationEngine {
    let processor = NodeProcessor::new(pool.clone(), Outbox::new(pool.clone()), "test-secret".to_string());
    AutomationEngine::new(pool.clone(), processor)
}

async fn started_ids(engine: &AutomationEngine, event: &DomainEvent) -> Vec<Uuid> {
    match engine.handle_event(event).await.expect("handle event") {
        EventOutcome::Processed { started } => started,
        EventOutcome::Ignored => Vec::new(),
    }
}

/// Scenario A: lead_created event, one active automation with a lead_created
/// trigger and no conditions — exactly one execution, run to completion.
#[tokio::test]
#[ignore]
#[serial]
async fn test_lead_created_runs_single_execution() {
    let docker = Cli::default();
    let node = docker.run(Postgres::default());
    let pool = pool_for_port(node.get_host_port_ipv4(5432)).await;

    let org = fixtures::insert_organization(&pool).await;
    let admin = fixtures::insert_user(&pool, org, "admin").await;
    let lead = fixtures::insert_lead(&pool, org).await;
    let tag = fixtures::insert_tag(&pool, org, "welcomed").await;

    fixtures::insert_automation_with_chain(
        &pool,
        org,
        admin,
        "lead_created",
        &[("action", Some("add_tag"), json!({ "tag_id": tag.to_string() }))],
    )
    .await;

    let engine = engine_for(&pool);
    let started = started_ids(&engine, &DomainEvent::lead_created(lead)).await;

    assert_eq!(started.len(), 1);
    assert_eq!(execution_status(&pool, started[0]).await, "completed");

    // the action's side effect happened exactly once
    assert_eq!(count_table_rows(&pool, "lead_tags").await, 1);
    assert_eq!(count_table_rows(&pool, "automation_executions").await, 1);
}

#[tokio::test]
#[ignore]
#[serial]
async fn test_inactive_automation_never_starts() {
    let docker = Cli::default();
    let node = docker.run(Postgres::default());
    let pool = pool_for_port(node.get_host_port_ipv4(5432)).await;

    let org = fixtures::insert_organization(&pool).await;
    let admin = fixtures::insert_user(&pool, org, "admin").await;
    let lead = fixtures::insert_lead(&pool, org).await;
    let tag = fixtures::insert_tag(&pool, org, "never").await;

    let fixture = fixtures::insert_automation_with_chain(
        &pool,
        org,
        admin,
        "lead_created",
        &[("action", Some("add_tag"), json!({ "tag_id": tag.to_string() }))],
    )
    .await;

    sqlx::query("UPDATE automations SET is_active = false WHERE id = $1")
        .bind(fixture.automation_id)
        .execute(&pool)
        .await
        .unwrap();

    let engine = engine_for(&pool);
    let started = started_ids(&engine, &DomainEvent::lead_created(lead)).await;

    assert!(started.is_empty());
    assert_eq!(count_table_rows(&pool, "automation_executions").await, 0);
}

#[tokio::test]
#[ignore]
#[serial]
async fn test_unresolved_tenant_creates_nothing() {
    let docker = Cli::default();
    let node = docker.run(Postgres::default());
    let pool = pool_for_port(node.get_host_port_ipv4(5432)).await;

    let engine = engine_for(&pool);

    // references a lead that does not exist
    let result = engine.handle_event(&DomainEvent::lead_created(Uuid::new_v4())).await;
    assert!(result.is_err());

    assert_eq!(count_table_rows(&pool, "automation_executions").await, 0);
    assert_eq!(count_table_rows(&pool, "notifications").await, 0);
}

/// Scenario C plus the duplicate-suppression invariant: a delay node parks
/// the run; early invocations are no-ops; a second qualifying event for the
/// same subject creates no second execution; the elapsed delay resumes and
/// completes the run.
#[tokio::test]
#[ignore]
#[serial]
async fn test_delay_wait_duplicate_suppression_and_resume() {
    let docker = Cli::default();
    let node = docker.run(Postgres::default());
    let pool = pool_for_port(node.get_host_port_ipv4(5432)).await;

    let org = fixtures::insert_organization(&pool).await;
    let admin = fixtures::insert_user(&pool, org, "admin").await;
    let lead = fixtures::insert_lead(&pool, org).await;
    let tag = fixtures::insert_tag(&pool, org, "after-delay").await;

    fixtures::insert_automation_with_chain(
        &pool,
        org,
        admin,
        "lead_created",
        &[
            ("delay", None, json!({ "amount": 60, "unit": "minutes" })),
            ("action", Some("add_tag"), json!({ "tag_id": tag.to_string() })),
        ],
    )
    .await;

    let engine = engine_for(&pool);
    let started = started_ids(&engine, &DomainEvent::lead_created(lead)).await;
    assert_eq!(started.len(), 1);
    let execution_id = started[0];

    assert_eq!(execution_status(&pool, execution_id).await, "waiting");

    // invoking before the delay elapses leaves the execution untouched
    let outcome = engine.run_execution(execution_id).await.unwrap();
    assert_eq!(outcome, RunOutcome::StillWaiting);
    assert_eq!(execution_status(&pool, execution_id).await, "waiting");

    // a second qualifying event for the same subject is skipped, not stacked
    let second = started_ids(&engine, &DomainEvent::lead_created(lead)).await;
    assert!(second.is_empty());
    assert_eq!(count_table_rows(&pool, "automation_executions").await, 1);

    // simulate the delay elapsing, then let the sweep resume it
    sqlx::query("UPDATE automation_executions SET next_execution_at = $2 WHERE id = $1")
        .bind(execution_id)
        .bind(Utc::now() - Duration::seconds(1))
        .execute(&pool)
        .await
        .unwrap();

    let resumed = engine.resume_due_executions(Utc::now()).await.unwrap();
    assert_eq!(resumed, 1);

    assert_eq!(execution_status(&pool, execution_id).await, "completed");
    assert_eq!(count_table_rows(&pool, "lead_tags").await, 1);
}

/// Idempotence: re-invoking the engine on a terminal execution causes no
/// state change and no duplicate side effect.
#[tokio::test]
#[ignore]
#[serial]
async fn test_terminal_execution_reinvocation_is_noop() {
    let docker = Cli::default();
    let node = docker.run(Postgres::default());
    let pool = pool_for_port(node.get_host_port_ipv4(5432)).await;

    let org = fixtures::insert_organization(&pool).await;
    let admin = fixtures::insert_user(&pool, org, "admin").await;
    let lead = fixtures::insert_lead(&pool, org).await;
    let tag = fixtures::insert_tag(&pool, org, "once").await;

    fixtures::insert_automation_with_chain(
        &pool,
        org,
        admin,
        "lead_created",
        &[("action", Some("add_tag"), json!({ "tag_id": tag.to_string() }))],
    )
    .await;

    let engine = engine_for(&pool);
    let started = started_ids(&engine, &DomainEvent::lead_created(lead)).await;
    let execution_id = started[0];
    assert_eq!(execution_status(&pool, execution_id).await, "completed");

    // remove the tag so a duplicate side effect would be visible
    sqlx::query("DELETE FROM lead_tags WHERE lead_id = $1")
        .bind(lead)
        .execute(&pool)
        .await
        .unwrap();

    let outcome = engine.run_execution(execution_id).await.unwrap();
    assert_eq!(outcome, RunOutcome::NoOp);
    assert_eq!(count_table_rows(&pool, "lead_tags").await, 0);
    assert_eq!(execution_status(&pool, execution_id).await, "completed");
}

/// Condition-node exhaustiveness: an unwired branch ends the run in
/// `failed`, never silently stuck in `running`.
#[tokio::test]
#[ignore]
#[serial]
async fn test_unwired_condition_branch_fails_execution() {
    let docker = Cli::default();
    let node = docker.run(Postgres::default());
    let pool = pool_for_port(node.get_host_port_ipv4(5432)).await;

    let org = fixtures::insert_organization(&pool).await;
    let admin = fixtures::insert_user(&pool, org, "admin").await;
    let lead = fixtures::insert_lead(&pool, org).await;
    let tag = fixtures::insert_tag(&pool, org, "hot-path").await;

    let fixture = fixtures::insert_automation_with_chain(
        &pool,
        org,
        admin,
        "message_received",
        &[],
    )
    .await;

    // trigger → condition (keyword check) with only the "true" branch wired
    let condition = fixtures::insert_node(
        &pool,
        fixture.automation_id,
        "condition",
        None,
        json!({ "field": "message", "operator": "contains", "value": "buy" }),
    )
    .await;
    fixtures::insert_connection(&pool, fixture.automation_id, fixture.trigger_node_id, condition, None).await;

    let action = fixtures::insert_node(
        &pool,
        fixture.automation_id,
        "action",
        Some("add_tag"),
        json!({ "tag_id": tag.to_string() }),
    )
    .await;
    fixtures::insert_connection(&pool, fixture.automation_id, condition, action, Some("true")).await;

    let conversation = Uuid::new_v4();
    sqlx::query("INSERT INTO conversations (id, organization_id, lead_id, channel) VALUES ($1, $2, $3, 'whatsapp')")
        .bind(conversation)
        .bind(org)
        .bind(lead)
        .execute(&pool)
        .await
        .unwrap();

    let engine = engine_for(&pool);
    let event = DomainEvent::message_received(Some(lead), conversation, None, "just saying hi");
    let started = started_ids(&engine, &event).await;

    assert_eq!(started.len(), 1);
    assert_eq!(execution_status(&pool, started[0]).await, "failed");

    let error: Option<String> =
        sqlx::query_scalar("SELECT error_message FROM automation_executions WHERE id = $1")
            .bind(started[0])
            .fetch_one(&pool)
            .await
            .unwrap();
    assert!(error.unwrap_or_default().contains("branch"));
}
