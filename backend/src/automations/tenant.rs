// Tenant resolution. The owning organization is derived strictly from the
// entities an event references — a tenant id in the payload is never read.

use sqlx::PgPool;
use uuid::Uuid;

use super::events::DomainEvent;
use super::{EngineError, EngineResult};

/// Resolve the tenant an event belongs to: lead first, then conversation,
/// then chat session. First successful lookup wins. An event that resolves
/// to none can never become resolvable, so it is dropped rather than retried.
pub async fn resolve_tenant(pool: &PgPool, event: &DomainEvent) -> EngineResult<Uuid> {
    if let Some(lead_id) = event.lead_id() {
        let org: Option<Uuid> =
            sqlx::query_scalar("SELECT organization_id FROM leads WHERE id = $1")
                .bind(lead_id)
                .fetch_optional(pool)
                .await?;
        if let Some(org) = org {
            return Ok(org);
        }
    }

    if let Some(conversation_id) = event.conversation_id() {
        let org: Option<Uuid> =
            sqlx::query_scalar("SELECT organization_id FROM conversations WHERE id = $1")
                .bind(conversation_id)
                .fetch_optional(pool)
                .await?;
        if let Some(org) = org {
            return Ok(org);
        }
    }

    if let Some(session_id) = event.session_id() {
        let org: Option<Uuid> =
            sqlx::query_scalar("SELECT organization_id FROM chat_sessions WHERE id = $1")
                .bind(session_id)
                .fetch_optional(pool)
                .await?;
        if let Some(org) = org {
            return Ok(org);
        }
    }

    Err(EngineError::UnresolvedTenant)
}
