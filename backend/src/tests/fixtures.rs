use fake::{Fake, Faker};
use serde_json::json;
use sqlx::PgPool;
use uuid::Uuid;

// Test fixtures for seeding sample data

pub async fn insert_organization(pool: &PgPool) -> Uuid {
    let id = Uuid::new_v4();
    sqlx::query("INSERT INTO organizations (id, name) VALUES ($1, $2)")
        .bind(id)
        .bind(format!("Org {}", Faker.fake::<String>()))
        .execute(pool)
        .await
        .expect("insert organization");
    id
}

pub async fn insert_user(pool: &PgPool, organization_id: Uuid, role: &str) -> Uuid {
    let id = Uuid::new_v4();
    sqlx::query(
        r#"
        INSERT INTO users (id, organization_id, email, first_name, last_name, role, is_active)
        VALUES ($1, $2, $3, $4, $5, $6, true)
        "#,
    )
    .bind(id)
    .bind(organization_id)
    .bind(format!("{}@example.test", id.simple()))
    .bind(Faker.fake::<String>())
    .bind(Faker.fake::<String>())
    .bind(role)
    .execute(pool)
    .await
    .expect("insert user");
    id
}

pub async fn insert_lead(pool: &PgPool, organization_id: Uuid) -> Uuid {
    let id = Uuid::new_v4();
    sqlx::query(
        r#"
        INSERT INTO leads (id, organization_id, name, email, status)
        VALUES ($1, $2, $3, $4, 'open')
        "#,
    )
    .bind(id)
    .bind(organization_id)
    .bind(Faker.fake::<String>())
    .bind(format!("lead-{}@example.test", id.simple()))
    .execute(pool)
    .await
    .expect("insert lead");
    id
}

pub async fn insert_tag(pool: &PgPool, organization_id: Uuid, name: &str) -> Uuid {
    let id = Uuid::new_v4();
    sqlx::query("INSERT INTO tags (id, organization_id, name) VALUES ($1, $2, $3)")
        .bind(id)
        .bind(organization_id)
        .bind(name)
        .execute(pool)
        .await
        .expect("insert tag");
    id
}

pub async fn tag_lead(pool: &PgPool, lead_id: Uuid, tag_id: Uuid) {
    sqlx::query("INSERT INTO lead_tags (lead_id, tag_id) VALUES ($1, $2)")
        .bind(lead_id)
        .bind(tag_id)
        .execute(pool)
        .await
        .expect("tag lead");
}

pub struct AutomationFixture {
    pub automation_id: Uuid,
    pub trigger_node_id: Uuid,
}

/// Insert an active automation whose graph is trigger → the given chain of
/// nodes, wired with unlabelled edges in order.
pub async fn insert_automation_with_chain(
    pool: &PgPool,
    organization_id: Uuid,
    created_by: Uuid,
    trigger_type: &str,
    chain: &[(&str, Option<&str>, serde_json::Value)],
) -> AutomationFixture {
    let automation_id = Uuid::new_v4();
    sqlx::query(
        r#"
        INSERT INTO automations (id, organization_id, name, is_active, trigger_type, trigger_config, created_by)
        VALUES ($1, $2, $3, true, $4, '{}'::jsonb, $5)
        "#,
    )
    .bind(automation_id)
    .bind(organization_id)
    .bind(format!("Automation {}", Faker.fake::<String>()))
    .bind(trigger_type)
    .bind(created_by)
    .execute(pool)
    .await
    .expect("insert automation");

    let trigger_node_id = insert_node(pool, automation_id, "trigger", None, json!({})).await;

    let mut previous = trigger_node_id;
    for (node_type, action_type, config) in chain {
        let node_id = insert_node(pool, automation_id, node_type, *action_type, config.clone()).await;
        insert_connection(pool, automation_id, previous, node_id, None).await;
        previous = node_id;
    }

    AutomationFixture {
        automation_id,
        trigger_node_id,
    }
}

pub async fn insert_node(
    pool: &PgPool,
    automation_id: Uuid,
    node_type: &str,
    action_type: Option<&str>,
    config: serde_json::Value,
) -> Uuid {
    let id = Uuid::new_v4();
    sqlx::query(
        r#"
        INSERT INTO automation_nodes (id, automation_id, node_type, action_type, config)
        VALUES ($1, $2, $3, $4, $5)
        "#,
    )
    .bind(id)
    .bind(automation_id)
    .bind(node_type)
    .bind(action_type)
    .bind(config)
    .execute(pool)
    .await
    .expect("insert node");
    id
}

pub async fn insert_connection(
    pool: &PgPool,
    automation_id: Uuid,
    source: Uuid,
    target: Uuid,
    condition_branch: Option<&str>,
) {
    sqlx::query(
        r#"
        INSERT INTO automation_connections (id, automation_id, source_node_id, target_node_id, condition_branch)
        VALUES ($1, $2, $3, $4, $5)
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(automation_id)
    .bind(source)
    .bind(target)
    .bind(condition_branch)
    .execute(pool)
    .await
    .expect("insert connection");
}

pub async fn insert_queue(
    pool: &PgPool,
    organization_id: Uuid,
    name: &str,
    settings: serde_json::Value,
) -> Uuid {
    let id = Uuid::new_v4();
    sqlx::query(
        r#"
        INSERT INTO round_robins (id, organization_id, name, strategy, is_active, settings, reentry_behavior)
        VALUES ($1, $2, $3, 'simple', true, $4, 'redistribute')
        "#,
    )
    .bind(id)
    .bind(organization_id)
    .bind(name)
    .bind(settings)
    .execute(pool)
    .await
    .expect("insert queue");
    id
}

pub async fn insert_queue_rule(pool: &PgPool, queue_id: Uuid, match_type: &str, values: Vec<String>, priority: i32) {
    sqlx::query(
        r#"
        INSERT INTO round_robin_rules (id, queue_id, match_type, match_values, priority, is_active)
        VALUES ($1, $2, $3, $4, $5, true)
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(queue_id)
    .bind(match_type)
    .bind(values)
    .bind(priority)
    .execute(pool)
    .await
    .expect("insert rule");
}

pub async fn insert_queue_member(pool: &PgPool, queue_id: Uuid, user_id: Uuid, weight: i32, position: i32) {
    sqlx::query(
        r#"
        INSERT INTO round_robin_members (id, queue_id, user_id, weight, position)
        VALUES ($1, $2, $3, $4, $5)
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(queue_id)
    .bind(user_id)
    .bind(weight)
    .bind(position)
    .execute(pool)
    .await
    .expect("insert member");
}

pub async fn insert_schedule_window(
    pool: &PgPool,
    queue_id: Uuid,
    day: i16,
    enabled: bool,
    start: &str,
    end: &str,
) {
    sqlx::query(
        r#"
        INSERT INTO round_robin_schedules (queue_id, day, enabled, start_time, end_time)
        VALUES ($1, $2, $3, $4::time, $5::time)
        "#,
    )
    .bind(queue_id)
    .bind(day)
    .bind(enabled)
    .bind(start)
    .bind(end)
    .execute(pool)
    .await
    .expect("insert schedule window");
}
