use crate::{
    errors::{ApiError, ServiceError},
    handlers::common::success_response,
    services::commerce::Settlement,
    AppState,
};
use axum::{extract::State, http::HeaderMap, response::IntoResponse, routing::post, Router};
use bytes::Bytes;
use serde::Serialize;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

pub fn payment_webhook_routes() -> Router<Arc<AppState>> {
    Router::new().route("/webhook", post(payment_webhook))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookAck {
    pub handled: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub order_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outcome: Option<&'static str>,
}

// POST /api/v1/payments/webhook
//
// The raw body is needed for signature verification. Redelivery of an
// already applied notification is acknowledged, never rejected.
pub async fn payment_webhook(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<impl IntoResponse, ApiError> {
    let ack = match state.services.checkout.handle_webhook(&headers, &body).await {
        Ok(Some(settlement)) => {
            let outcome = match &settlement {
                Settlement::Confirmed(_) => "confirmed",
                Settlement::Cancelled(_) => "cancelled",
                Settlement::AlreadyFinalized(_) => "already_finalized",
                Settlement::Superseded(_) => "superseded",
            };
            info!(order_id = %settlement.order().id, outcome, "Payment webhook applied");
            WebhookAck {
                handled: true,
                order_id: Some(settlement.order().id),
                outcome: Some(outcome),
            }
        }
        Ok(None) => WebhookAck {
            handled: false,
            order_id: None,
            outcome: None,
        },
        // sessions opened by other systems on a shared provider account
        Err(ServiceError::NotFound(msg)) => {
            warn!(%msg, "Payment webhook for unknown session");
            WebhookAck {
                handled: false,
                order_id: None,
                outcome: None,
            }
        }
        Err(e) => {
            if matches!(e, ServiceError::InvalidSignature(_)) {
                warn!(error = %e, "Payment webhook signature verification failed");
            }
            return Err(e.into());
        }
    };
    Ok(success_response("Webhook accepted", ack))
}
