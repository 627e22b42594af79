// Outbox delivery worker. Retries with exponential backoff up to the row's
// max_attempts; permanent failure flags the row and notifies admins without
// touching any automation execution.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use lettre::message::header::ContentType;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use serde_json::Value;
use sqlx::{FromRow, PgPool};
use std::sync::Arc;
use thiserror::Error;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::config::{GatewayConfig, SmtpConfig};
use crate::notifications;

#[derive(Error, Debug)]
pub enum DeliveryError {
    #[error("gateway error: {0}")]
    Gateway(String),
    #[error("smtp error: {0}")]
    Smtp(String),
    #[error("malformed payload: {0}")]
    Payload(String),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Outbound chat gateway. The engine never calls the gateway directly; the
/// delivery worker is the only code that crosses this boundary.
#[async_trait]
pub trait MessageGateway: Send + Sync {
    async fn send_message(&self, payload: &Value) -> Result<(), DeliveryError>;
    async fn send_template(&self, payload: &Value) -> Result<(), DeliveryError>;
}

pub struct HttpMessageGateway {
    client: reqwest::Client,
    config: GatewayConfig,
}

impl HttpMessageGateway {
    pub fn new(config: GatewayConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            config,
        }
    }

    async fn post(&self, path: &str, payload: &Value) -> Result<(), DeliveryError> {
        let url = format!("{}{}", self.config.base_url.trim_end_matches('/'), path);

        let response = self
            .client
            .post(&url)
            .header("X-Api-Key", &self.config.api_key)
            .json(payload)
            .send()
            .await
            .map_err(|e| DeliveryError::Gateway(e.to_string()))?;

        if !response.status().is_success() {
            return Err(DeliveryError::Gateway(format!(
                "gateway returned {}",
                response.status()
            )));
        }

        Ok(())
    }
}

#[async_trait]
impl MessageGateway for HttpMessageGateway {
    async fn send_message(&self, payload: &Value) -> Result<(), DeliveryError> {
        self.post("/api/messages", payload).await
    }

    async fn send_template(&self, payload: &Value) -> Result<(), DeliveryError> {
        self.post("/api/templates/send", payload).await
    }
}

#[async_trait]
pub trait Mailer: Send + Sync {
    async fn send_email(&self, to: &str, subject: &str, body: &str) -> Result<(), DeliveryError>;
}

pub struct SmtpMailer {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    from: String,
}

impl SmtpMailer {
    pub fn new(config: &SmtpConfig) -> Result<Self, DeliveryError> {
        let transport = AsyncSmtpTransport::<Tokio1Executor>::relay(&config.host)
            .map_err(|e| DeliveryError::Smtp(e.to_string()))?
            .port(config.port)
            .credentials(Credentials::new(config.username.clone(), config.password.clone()))
            .build();

        Ok(Self {
            transport,
            from: format!("{} <{}>", config.from_name, config.from_email),
        })
    }
}

#[async_trait]
impl Mailer for SmtpMailer {
    async fn send_email(&self, to: &str, subject: &str, body: &str) -> Result<(), DeliveryError> {
        let message = Message::builder()
            .from(self.from.parse().map_err(|e| DeliveryError::Smtp(format!("{}", e)))?)
            .to(to.parse().map_err(|e| DeliveryError::Smtp(format!("{}", e)))?)
            .subject(subject)
            .header(ContentType::TEXT_PLAIN)
            .body(body.to_string())
            .map_err(|e| DeliveryError::Smtp(e.to_string()))?;

        self.transport
            .send(message)
            .await
            .map_err(|e| DeliveryError::Smtp(e.to_string()))?;

        Ok(())
    }
}

#[derive(Debug, Clone, FromRow)]
struct OutboxRow {
    id: Uuid,
    organization_id: Uuid,
    lead_id: Option<Uuid>,
    kind: String,
    payload: Value,
    attempts: i32,
    max_attempts: i32,
}

#[derive(Debug, Default)]
pub struct DeliveryStats {
    pub delivered: i32,
    pub retried: i32,
    pub exhausted: i32,
}

pub struct DeliveryWorker {
    db_pool: PgPool,
    gateway: Arc<dyn MessageGateway>,
    mailer: Arc<dyn Mailer>,
}

impl DeliveryWorker {
    pub fn new(db_pool: PgPool, gateway: Arc<dyn MessageGateway>, mailer: Arc<dyn Mailer>) -> Self {
        Self {
            db_pool,
            gateway,
            mailer,
        }
    }

    /// Deliver every due pending message. Safe to invoke redundantly;
    /// at-least-once delivery is the accepted model.
    pub async fn run_once(&self, now: DateTime<Utc>) -> Result<DeliveryStats, DeliveryError> {
        let due = sqlx::query_as::<_, OutboxRow>(
            r#"
            SELECT id, organization_id, lead_id, kind, payload, attempts, max_attempts
            FROM outbox_messages
            WHERE status = 'pending' AND next_attempt_at <= $1
            ORDER BY next_attempt_at ASC
            LIMIT 100
            "#,
        )
        .bind(now)
        .fetch_all(&self.db_pool)
        .await?;

        let mut stats = DeliveryStats::default();

        for row in due {
            match self.dispatch(&row).await {
                Ok(()) => {
                    sqlx::query(
                        "UPDATE outbox_messages SET status = 'delivered', attempts = attempts + 1 WHERE id = $1",
                    )
                    .bind(row.id)
                    .execute(&self.db_pool)
                    .await?;
                    stats.delivered += 1;
                }
                Err(e) => {
                    let attempts = row.attempts + 1;
                    if attempts >= row.max_attempts {
                        error!("Outbox message {} permanently failed: {}", row.id, e);
                        sqlx::query(
                            "UPDATE outbox_messages SET status = 'failed', attempts = $2, last_error = $3 WHERE id = $1",
                        )
                        .bind(row.id)
                        .bind(attempts)
                        .bind(e.to_string())
                        .execute(&self.db_pool)
                        .await?;

                        if let Err(notify_err) = notifications::notify_admins(
                            &self.db_pool,
                            row.organization_id,
                            "Message delivery failed".to_string(),
                            format!("Outbound {} could not be delivered: {}", row.kind, e),
                            "delivery_failed".to_string(),
                            row.lead_id,
                        )
                        .await
                        {
                            warn!("Failed to notify admins about delivery failure: {}", notify_err);
                        }

                        stats.exhausted += 1;
                    } else {
                        let next_attempt = now + backoff(attempts);
                        warn!(
                            "Outbox message {} attempt {} failed, retrying at {}: {}",
                            row.id, attempts, next_attempt, e
                        );
                        sqlx::query(
                            "UPDATE outbox_messages SET attempts = $2, last_error = $3, next_attempt_at = $4 WHERE id = $1",
                        )
                        .bind(row.id)
                        .bind(attempts)
                        .bind(e.to_string())
                        .bind(next_attempt)
                        .execute(&self.db_pool)
                        .await?;
                        stats.retried += 1;
                    }
                }
            }
        }

        if stats.delivered > 0 || stats.retried > 0 || stats.exhausted > 0 {
            info!(
                "Outbox pass: {} delivered, {} retried, {} exhausted",
                stats.delivered, stats.retried, stats.exhausted
            );
        }

        Ok(stats)
    }

    async fn dispatch(&self, row: &OutboxRow) -> Result<(), DeliveryError> {
        match row.kind.as_str() {
            "chat_message" => self.gateway.send_message(&row.payload).await,
            "chat_template" => self.gateway.send_template(&row.payload).await,
            "email" => {
                let to = row.payload.get("to").and_then(|v| v.as_str()).ok_or_else(|| {
                    DeliveryError::Payload("email instruction is missing 'to'".to_string())
                })?;
                let subject = row.payload.get("subject").and_then(|v| v.as_str()).unwrap_or("");
                let body = row.payload.get("body").and_then(|v| v.as_str()).unwrap_or("");
                self.mailer.send_email(to, subject, body).await
            }
            other => Err(DeliveryError::Payload(format!("unknown outbox kind '{}'", other))),
        }
    }
}

/// Exponential backoff: 2^attempts minutes, capped at a day.
fn backoff(attempts: i32) -> Duration {
    let minutes = 2i64.pow(attempts.clamp(0, 10) as u32);
    Duration::minutes(minutes.min(24 * 60))
}
