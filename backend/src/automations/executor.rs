// Node processor: performs one action node's side effect. Message-shaped
// effects are recorded on the outbox (delivery owns its own retry policy);
// entity writes go straight to the store; webhook calls go out signed.

use base64::Engine as _;
use hmac::{Hmac, Mac};
use serde_json::Value;
use sha1::Sha1;
use sqlx::PgPool;
use tracing::info;
use uuid::Uuid;

use super::context::ExecutionContext;
use super::graph::ActionKind;
use crate::notifications;
use crate::outbox::Outbox;

/// The subject an action operates on, resolved from the execution row.
#[derive(Debug, Clone, Copy)]
pub struct ActionTarget {
    pub organization_id: Uuid,
    pub lead_id: Option<Uuid>,
    pub conversation_id: Option<Uuid>,
}

pub struct NodeProcessor {
    db_pool: PgPool,
    outbox: Outbox,
    http: reqwest::Client,
    webhook_secret: String,
}

impl NodeProcessor {
    pub fn new(db_pool: PgPool, outbox: Outbox, webhook_secret: String) -> Self {
        Self {
            db_pool,
            outbox,
            http: reqwest::Client::new(),
            webhook_secret,
        }
    }

    /// Execute one action node. `config` has already been rendered against
    /// the execution context. Errors become the run's `error_message`.
    pub async fn execute(
        &self,
        kind: ActionKind,
        config: &Value,
        ctx: &ExecutionContext,
        target: &ActionTarget,
    ) -> Result<Option<Value>, String> {
        info!("Executing action {:?}", kind);

        match kind {
            ActionKind::SendMessage => self.send_message(config, ctx, target).await,
            ActionKind::SendTemplate => self.send_template(config, target).await,
            ActionKind::SendEmail => self.send_email(config, target).await,
            ActionKind::MoveStage => self.move_stage(config, target).await,
            ActionKind::AddTag => self.add_tag(config, target).await,
            ActionKind::RemoveTag => self.remove_tag(config, target).await,
            ActionKind::CreateTask => self.create_task(config, target).await,
            ActionKind::AssignUser => self.assign_user(config, target).await,
            ActionKind::CallWebhook => self.call_webhook(config, ctx).await,
        }
    }

    async fn send_message(
        &self,
        config: &Value,
        ctx: &ExecutionContext,
        target: &ActionTarget,
    ) -> Result<Option<Value>, String> {
        let body = config
            .get("message")
            .and_then(|v| v.as_str())
            .ok_or("send_message config is missing 'message'")?;

        let conversation_id = target.conversation_id.or_else(|| {
            ctx.get("conversation_id")
                .and_then(|v| v.as_str().and_then(|s| s.parse().ok()))
        });

        let outbox_id = self
            .outbox
            .enqueue_chat_message(target.organization_id, target.lead_id, conversation_id, body.to_string())
            .await
            .map_err(|e| format!("failed to enqueue message: {}", e))?;

        Ok(Some(serde_json::json!({ "outbox_id": outbox_id })))
    }

    async fn send_template(
        &self,
        config: &Value,
        target: &ActionTarget,
    ) -> Result<Option<Value>, String> {
        let template_id = config
            .get("template_id")
            .and_then(|v| v.as_str())
            .ok_or("send_template config is missing 'template_id'")?;
        let variables = config.get("variables").cloned().unwrap_or(Value::Null);

        let outbox_id = self
            .outbox
            .enqueue_chat_template(
                target.organization_id,
                target.lead_id,
                target.conversation_id,
                template_id.to_string(),
                variables,
            )
            .await
            .map_err(|e| format!("failed to enqueue template: {}", e))?;

        Ok(Some(serde_json::json!({ "outbox_id": outbox_id })))
    }

    async fn send_email(&self, config: &Value, target: &ActionTarget) -> Result<Option<Value>, String> {
        let subject = config
            .get("subject")
            .and_then(|v| v.as_str())
            .ok_or("send_email config is missing 'subject'")?;
        let body = config.get("body").and_then(|v| v.as_str()).unwrap_or("");

        // The recipient defaults to the subject lead's address.
        let to = match config.get("to").and_then(|v| v.as_str()).filter(|s| !s.is_empty()) {
            Some(to) => to.to_string(),
            None => {
                let lead_id = target.lead_id.ok_or("send_email has no recipient and no subject lead")?;
                sqlx::query_scalar::<_, Option<String>>("SELECT email FROM leads WHERE id = $1")
                    .bind(lead_id)
                    .fetch_one(&self.db_pool)
                    .await
                    .map_err(|e| format!("failed to load lead email: {}", e))?
                    .ok_or("subject lead has no email address")?
            }
        };

        let outbox_id = self
            .outbox
            .enqueue_email(
                target.organization_id,
                target.lead_id,
                to,
                subject.to_string(),
                body.to_string(),
            )
            .await
            .map_err(|e| format!("failed to enqueue email: {}", e))?;

        Ok(Some(serde_json::json!({ "outbox_id": outbox_id })))
    }

    async fn move_stage(&self, config: &Value, target: &ActionTarget) -> Result<Option<Value>, String> {
        let lead_id = target.lead_id.ok_or("move_stage requires a subject lead")?;
        let stage_id: Uuid = parse_uuid_field(config, "stage_id")?;

        sqlx::query(
            r#"
            UPDATE leads
            SET stage_id = $2,
                pipeline_id = COALESCE((SELECT pipeline_id FROM pipeline_stages WHERE id = $2), pipeline_id),
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(lead_id)
        .bind(stage_id)
        .execute(&self.db_pool)
        .await
        .map_err(|e| format!("failed to move lead stage: {}", e))?;

        Ok(Some(serde_json::json!({ "lead_id": lead_id, "stage_id": stage_id })))
    }

    async fn add_tag(&self, config: &Value, target: &ActionTarget) -> Result<Option<Value>, String> {
        let lead_id = target.lead_id.ok_or("add_tag requires a subject lead")?;
        let tag_id: Uuid = parse_uuid_field(config, "tag_id")?;

        sqlx::query("INSERT INTO lead_tags (lead_id, tag_id) VALUES ($1, $2) ON CONFLICT DO NOTHING")
            .bind(lead_id)
            .bind(tag_id)
            .execute(&self.db_pool)
            .await
            .map_err(|e| format!("failed to add tag: {}", e))?;

        Ok(Some(serde_json::json!({ "lead_id": lead_id, "tag_id": tag_id })))
    }

    async fn remove_tag(&self, config: &Value, target: &ActionTarget) -> Result<Option<Value>, String> {
        let lead_id = target.lead_id.ok_or("remove_tag requires a subject lead")?;
        let tag_id: Uuid = parse_uuid_field(config, "tag_id")?;

        sqlx::query("DELETE FROM lead_tags WHERE lead_id = $1 AND tag_id = $2")
            .bind(lead_id)
            .bind(tag_id)
            .execute(&self.db_pool)
            .await
            .map_err(|e| format!("failed to remove tag: {}", e))?;

        Ok(Some(serde_json::json!({ "lead_id": lead_id, "removed_tag": tag_id })))
    }

    async fn create_task(&self, config: &Value, target: &ActionTarget) -> Result<Option<Value>, String> {
        let title = config
            .get("title")
            .and_then(|v| v.as_str())
            .ok_or("create_task config is missing 'title'")?;
        let description = config.get("description").and_then(|v| v.as_str());
        let due_in_hours = config.get("due_in_hours").and_then(|v| v.as_i64());

        let assigned_user_id: Option<Uuid> = match config.get("assigned_user_id").and_then(|v| v.as_str()) {
            Some(raw) => Some(raw.parse().map_err(|_| "invalid 'assigned_user_id'")?),
            None => match target.lead_id {
                Some(lead_id) => {
                    sqlx::query_scalar::<_, Option<Uuid>>("SELECT assigned_user_id FROM leads WHERE id = $1")
                        .bind(lead_id)
                        .fetch_one(&self.db_pool)
                        .await
                        .map_err(|e| format!("failed to load lead assignee: {}", e))?
                }
                None => None,
            },
        };

        let task_id = Uuid::new_v4();
        let due_at = due_in_hours.map(|h| chrono::Utc::now() + chrono::Duration::hours(h));

        sqlx::query(
            r#"
            INSERT INTO tasks (id, organization_id, lead_id, assigned_user_id, title, description, due_at, completed)
            VALUES ($1, $2, $3, $4, $5, $6, $7, false)
            "#,
        )
        .bind(task_id)
        .bind(target.organization_id)
        .bind(target.lead_id)
        .bind(assigned_user_id)
        .bind(title)
        .bind(description)
        .bind(due_at)
        .execute(&self.db_pool)
        .await
        .map_err(|e| format!("failed to create task: {}", e))?;

        Ok(Some(serde_json::json!({ "task_id": task_id })))
    }

    async fn assign_user(&self, config: &Value, target: &ActionTarget) -> Result<Option<Value>, String> {
        let lead_id = target.lead_id.ok_or("assign_user requires a subject lead")?;
        let user_id: Uuid = parse_uuid_field(config, "user_id")?;

        let lead_name: String = sqlx::query_scalar(
            r#"
            UPDATE leads
            SET assigned_user_id = $2, last_assigned_user_id = $2, updated_at = NOW()
            WHERE id = $1
            RETURNING name
            "#,
        )
        .bind(lead_id)
        .bind(user_id)
        .fetch_one(&self.db_pool)
        .await
        .map_err(|e| format!("failed to assign lead: {}", e))?;

        notifications::notify_assignment(&self.db_pool, user_id, target.organization_id, lead_id, &lead_name)
            .await
            .map_err(|e| format!("failed to create assignment notification: {}", e))?;

        Ok(Some(serde_json::json!({ "lead_id": lead_id, "assigned_to": user_id })))
    }

    async fn call_webhook(&self, config: &Value, ctx: &ExecutionContext) -> Result<Option<Value>, String> {
        let url = config
            .get("url")
            .and_then(|v| v.as_str())
            .ok_or("call_webhook config is missing 'url'")?;
        url::Url::parse(url).map_err(|e| format!("invalid webhook url: {}", e))?;

        let method = config.get("method").and_then(|v| v.as_str()).unwrap_or("POST");
        let payload = match config.get("payload") {
            Some(p) if !p.is_null() => p.clone(),
            _ => ctx.trigger().clone(),
        };

        let body = serde_json::to_string(&payload).map_err(|e| e.to_string())?;
        let signature = self.sign(&body);

        let request = match method.to_uppercase().as_str() {
            "GET" => self.http.get(url),
            "POST" => self.http.post(url),
            "PUT" => self.http.put(url),
            other => return Err(format!("unsupported webhook method '{}'", other)),
        };

        let response = request
            .header("Content-Type", "application/json")
            .header("X-Lattice-Signature", signature)
            .body(body)
            .send()
            .await
            .map_err(|e| format!("webhook call failed: {}", e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(format!("webhook returned {}", status));
        }

        Ok(Some(serde_json::json!({ "url": url, "status_code": status.as_u16() })))
    }

    fn sign(&self, body: &str) -> String {
        let mut mac = Hmac::<Sha1>::new_from_slice(self.webhook_secret.as_bytes())
            .expect("HMAC accepts any key length");
        mac.update(body.as_bytes());
        base64::engine::general_purpose::STANDARD.encode(mac.finalize().into_bytes())
    }
}

fn parse_uuid_field(config: &Value, field: &str) -> Result<Uuid, String> {
    config
        .get(field)
        .and_then(|v| v.as_str())
        .ok_or(format!("config is missing '{}'", field))?
        .parse()
        .map_err(|_| format!("invalid '{}'", field))
}
