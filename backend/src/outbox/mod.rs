// Durable outbox: side-effecting instructions (chat sends, emails) are
// recorded as rows and delivered by a worker with its own retry policy.
// The automation engine only records intent; it never blocks on delivery.

pub mod delivery;

pub use delivery::{DeliveryError, DeliveryWorker, HttpMessageGateway, Mailer, MessageGateway, SmtpMailer};

use serde_json::Value;
use sqlx::PgPool;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutboxKind {
    ChatMessage,
    ChatTemplate,
    Email,
}

impl OutboxKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ChatMessage => "chat_message",
            Self::ChatTemplate => "chat_template",
            Self::Email => "email",
        }
    }
}

#[derive(Debug, Clone)]
pub struct Outbox {
    db_pool: PgPool,
}

impl Outbox {
    pub fn new(db_pool: PgPool) -> Self {
        Self { db_pool }
    }

    pub async fn enqueue(
        &self,
        organization_id: Uuid,
        lead_id: Option<Uuid>,
        kind: OutboxKind,
        payload: Value,
    ) -> Result<Uuid, sqlx::Error> {
        let id = Uuid::new_v4();

        sqlx::query(
            r#"
            INSERT INTO outbox_messages (id, organization_id, lead_id, kind, payload, status, attempts, next_attempt_at)
            VALUES ($1, $2, $3, $4, $5, 'pending', 0, NOW())
            "#,
        )
        .bind(id)
        .bind(organization_id)
        .bind(lead_id)
        .bind(kind.as_str())
        .bind(payload)
        .execute(&self.db_pool)
        .await?;

        tracing::debug!("Enqueued outbox message {} ({})", id, kind.as_str());
        Ok(id)
    }

    pub async fn enqueue_chat_message(
        &self,
        organization_id: Uuid,
        lead_id: Option<Uuid>,
        conversation_id: Option<Uuid>,
        body: String,
    ) -> Result<Uuid, sqlx::Error> {
        self.enqueue(
            organization_id,
            lead_id,
            OutboxKind::ChatMessage,
            serde_json::json!({ "conversation_id": conversation_id, "body": body }),
        )
        .await
    }

    pub async fn enqueue_chat_template(
        &self,
        organization_id: Uuid,
        lead_id: Option<Uuid>,
        conversation_id: Option<Uuid>,
        template_id: String,
        variables: Value,
    ) -> Result<Uuid, sqlx::Error> {
        self.enqueue(
            organization_id,
            lead_id,
            OutboxKind::ChatTemplate,
            serde_json::json!({
                "conversation_id": conversation_id,
                "template_id": template_id,
                "variables": variables
            }),
        )
        .await
    }

    pub async fn enqueue_email(
        &self,
        organization_id: Uuid,
        lead_id: Option<Uuid>,
        to: String,
        subject: String,
        body: String,
    ) -> Result<Uuid, sqlx::Error> {
        self.enqueue(
            organization_id,
            lead_id,
            OutboxKind::Email,
            serde_json::json!({ "to": to, "subject": subject, "body": body }),
        )
        .await
    }
}
