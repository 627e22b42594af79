//! Notification records produced by the automation engine and the
//! distribution queue. Delivery to the UI is the notification center's
//! concern; this module only writes the rows.

use sqlx::PgPool;
use uuid::Uuid;

pub async fn create_notification(
    db_pool: &PgPool,
    user_id: Uuid,
    organization_id: Uuid,
    title: String,
    content: String,
    notification_type: String,
    lead_id: Option<Uuid>,
) -> Result<Uuid, sqlx::Error> {
    let notification_id = Uuid::new_v4();

    sqlx::query(
        r#"
        INSERT INTO notifications (id, user_id, organization_id, title, content, notification_type, lead_id, read, created_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7, false, NOW())
        "#,
    )
    .bind(notification_id)
    .bind(user_id)
    .bind(organization_id)
    .bind(title)
    .bind(content)
    .bind(notification_type)
    .bind(lead_id)
    .execute(db_pool)
    .await?;

    Ok(notification_id)
}

/// Notify a member that a lead landed on their plate.
pub async fn notify_assignment(
    db_pool: &PgPool,
    user_id: Uuid,
    organization_id: Uuid,
    lead_id: Uuid,
    lead_name: &str,
) -> Result<(), sqlx::Error> {
    create_notification(
        db_pool,
        user_id,
        organization_id,
        "New lead assigned".to_string(),
        format!("Lead '{}' has been assigned to you", lead_name),
        "lead_assigned".to_string(),
        Some(lead_id),
    )
    .await?;

    Ok(())
}

/// Surface an automation failure to its creator; failures never block the
/// originating domain action, so this is the only user-visible signal.
pub async fn notify_execution_failed(
    db_pool: &PgPool,
    user_id: Uuid,
    organization_id: Uuid,
    automation_name: &str,
    error: &str,
    lead_id: Option<Uuid>,
) -> Result<(), sqlx::Error> {
    create_notification(
        db_pool,
        user_id,
        organization_id,
        "Automation failed".to_string(),
        format!("Automation '{}' failed: {}", automation_name, error),
        "automation_failed".to_string(),
        lead_id,
    )
    .await?;

    Ok(())
}

/// Notify every active admin of the tenant.
pub async fn notify_admins(
    db_pool: &PgPool,
    organization_id: Uuid,
    title: String,
    content: String,
    notification_type: String,
    lead_id: Option<Uuid>,
) -> Result<(), sqlx::Error> {
    let admin_ids: Vec<Uuid> = sqlx::query_scalar(
        "SELECT id FROM users WHERE organization_id = $1 AND role = 'admin' AND is_active = true",
    )
    .bind(organization_id)
    .fetch_all(db_pool)
    .await?;

    for admin_id in admin_ids {
        create_notification(
            db_pool,
            admin_id,
            organization_id,
            title.clone(),
            content.clone(),
            notification_type.clone(),
            lead_id,
        )
        .await?;
    }

    Ok(())
}
