// Event ingestion. The envelope carries entity references only; the owning
// tenant is derived server-side and a payload-supplied tenant id would be
// ignored. Failures never block the producer — the originating domain
// action (lead created, message received) has already happened.

use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};
use serde::Serialize;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::auth::AuthUser;
use crate::automations::{DomainEvent, EngineError, EventOutcome, EventType};
use crate::distribution::AssignmentOutcome;
use crate::AppState;

#[derive(Debug, Serialize)]
pub struct EventResponse {
    pub status: &'static str,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub started_executions: Vec<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub distribution: Option<AssignmentOutcome>,
}

pub async fn ingest_event(
    State(state): State<Arc<AppState>>,
    _auth: AuthUser,
    Json(event): Json<DomainEvent>,
) -> impl IntoResponse {
    let started = match state.engine.handle_event(&event).await {
        Ok(EventOutcome::Ignored) => {
            info!("Ignoring unknown event type");
            return (
                StatusCode::ACCEPTED,
                Json(EventResponse {
                    status: "ignored",
                    started_executions: Vec::new(),
                    distribution: None,
                }),
            );
        }
        Ok(EventOutcome::Processed { started }) => started,
        Err(EngineError::UnresolvedTenant) => {
            // Can never become resolvable: drop, log, don't retry.
            warn!("Dropping event with no resolvable tenant");
            return (
                StatusCode::ACCEPTED,
                Json(EventResponse {
                    status: "dropped",
                    started_executions: Vec::new(),
                    distribution: None,
                }),
            );
        }
        Err(e) => {
            warn!("Event processing failed: {}", e);
            return (
                StatusCode::ACCEPTED,
                Json(EventResponse {
                    status: "error",
                    started_executions: Vec::new(),
                    distribution: None,
                }),
            );
        }
    };

    // Lead lifecycle events also flow into the distribution queue.
    let distribution = match (event.event_type, event.lead_id()) {
        (EventType::LeadCreated, Some(lead_id)) => match state.distributor.distribute(lead_id).await {
            Ok(outcome) => Some(outcome),
            Err(e) => {
                warn!("Distribution failed for lead {}: {}", lead_id, e);
                None
            }
        },
        (EventType::LeadReengaged, Some(lead_id)) => {
            match state.distributor.handle_reentry(lead_id).await {
                Ok(outcome) => Some(outcome),
                Err(e) => {
                    warn!("Reentry handling failed for lead {}: {}", lead_id, e);
                    None
                }
            }
        }
        _ => None,
    };

    (
        StatusCode::ACCEPTED,
        Json(EventResponse {
            status: "processed",
            started_executions: started,
            distribution,
        }),
    )
}
