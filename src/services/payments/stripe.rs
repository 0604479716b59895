//! Stripe Checkout adapter.
//!
//! Sessions are created through the form-encoded REST API and settled by the
//! `checkout.session.*` webhook family.

use std::time::Duration;

use async_trait::async_trait;
use axum::http::HeaderMap;
use chrono::{DateTime, Utc};
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use tracing::{debug, instrument, warn};

use super::{
    signature, to_minor_units, GatewayError, HostedSession, PaymentGateway, PaymentNotification,
    SessionRequest, SessionState,
};
use crate::config::AppConfig;
use crate::errors::ServiceError;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct StripeConfig {
    pub secret_key: String,
    pub api_base: String,
    pub webhook_secret: Option<String>,
    pub tolerance_secs: u64,
}

impl StripeConfig {
    pub fn from_app_config(config: &AppConfig) -> Result<Self, ServiceError> {
        let secret_key = config.stripe_secret_key.clone().ok_or_else(|| {
            ServiceError::InternalError("stripe_secret_key is not configured".into())
        })?;
        Ok(Self {
            secret_key,
            api_base: config.stripe_api_base.trim_end_matches('/').to_string(),
            webhook_secret: config.payment_webhook_secret.clone(),
            tolerance_secs: config.payment_webhook_tolerance_secs,
        })
    }
}

pub struct StripeGateway {
    client: Client,
    config: StripeConfig,
}

#[derive(Debug, Deserialize)]
struct SessionObject {
    id: String,
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    expires_at: Option<i64>,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    payment_status: Option<String>,
}

impl SessionObject {
    fn state(&self) -> SessionState {
        match (self.status.as_deref(), self.payment_status.as_deref()) {
            (Some("complete"), Some("paid")) | (Some("complete"), Some("no_payment_required")) => {
                SessionState::Paid
            }
            (Some("expired"), _) => SessionState::Expired,
            // complete but unpaid: an async method is still clearing
            _ => SessionState::Open,
        }
    }
}

#[derive(Debug, Deserialize)]
struct WebhookEvent {
    id: String,
    #[serde(rename = "type")]
    kind: String,
    data: WebhookData,
}

#[derive(Debug, Deserialize)]
struct WebhookData {
    object: SessionObject,
}

#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    message: Option<String>,
}

impl StripeGateway {
    pub fn new(config: StripeConfig) -> Result<Self, ServiceError> {
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| ServiceError::InternalError(format!("HTTP client: {}", e)))?;
        Ok(Self { client, config })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.api_base, path)
    }

    async fn decode<T: for<'de> Deserialize<'de>>(
        response: reqwest::Response,
    ) -> Result<T, GatewayError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response.json::<T>().await?);
        }
        let message = response
            .json::<ErrorEnvelope>()
            .await
            .ok()
            .and_then(|e| e.error.message)
            .unwrap_or_else(|| status.canonical_reason().unwrap_or("error").to_string());
        Err(GatewayError::Rejected {
            status: status.as_u16(),
            message,
        })
    }

    fn session_form(request: &SessionRequest) -> Result<Vec<(String, String)>, GatewayError> {
        let unit_amount = to_minor_units(request.amount)?;
        Ok(vec![
            ("mode".into(), "payment".into()),
            ("success_url".into(), request.success_url.clone()),
            ("cancel_url".into(), request.cancel_url.clone()),
            ("client_reference_id".into(), request.order_id.to_string()),
            ("expires_at".into(), request.expires_at.timestamp().to_string()),
            ("metadata[order_id]".into(), request.order_id.to_string()),
            ("metadata[order_number]".into(), request.order_number.clone()),
            ("metadata[owner_id]".into(), request.owner_id.to_string()),
            ("line_items[0][quantity]".into(), "1".into()),
            (
                "line_items[0][price_data][currency]".into(),
                request.currency.to_ascii_lowercase(),
            ),
            (
                "line_items[0][price_data][unit_amount]".into(),
                unit_amount.to_string(),
            ),
            (
                "line_items[0][price_data][product_data][name]".into(),
                format!("Order {}", request.order_number),
            ),
        ])
    }
}

#[async_trait]
impl PaymentGateway for StripeGateway {
    fn name(&self) -> &'static str {
        "stripe"
    }

    #[instrument(skip(self, request), fields(order_id = %request.order_id))]
    async fn create_session(
        &self,
        request: &SessionRequest,
    ) -> Result<HostedSession, GatewayError> {
        let response = self
            .client
            .post(self.url("/v1/checkout/sessions"))
            .bearer_auth(&self.config.secret_key)
            .header("Idempotency-Key", &request.idempotency_key)
            .form(&Self::session_form(request)?)
            .send()
            .await?;
        let session: SessionObject = Self::decode(response).await?;

        let checkout_url = session
            .url
            .ok_or_else(|| GatewayError::Decode("session without url".into()))?;
        let expires_at = session
            .expires_at
            .and_then(|ts| DateTime::<Utc>::from_timestamp(ts, 0))
            .unwrap_or(request.expires_at);
        debug!(reference = %session.id, "Stripe session created");
        Ok(HostedSession {
            reference: session.id,
            checkout_url,
            expires_at,
        })
    }

    async fn session_state(&self, reference: &str) -> Result<SessionState, GatewayError> {
        let response = self
            .client
            .get(self.url(&format!("/v1/checkout/sessions/{}", reference)))
            .bearer_auth(&self.config.secret_key)
            .send()
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Err(GatewayError::UnknownSession(reference.to_string()));
        }
        let session: SessionObject = Self::decode(response).await?;
        Ok(session.state())
    }

    #[instrument(skip(self))]
    async fn expire_session(&self, reference: &str) -> Result<SessionState, GatewayError> {
        let response = self
            .client
            .post(self.url(&format!("/v1/checkout/sessions/{}/expire", reference)))
            .bearer_auth(&self.config.secret_key)
            .send()
            .await?;
        match response.status() {
            StatusCode::NOT_FOUND => Err(GatewayError::UnknownSession(reference.to_string())),
            // only open sessions can be expired
            StatusCode::BAD_REQUEST => self.session_state(reference).await,
            _ => {
                let session: SessionObject = Self::decode(response).await?;
                debug!(%reference, "Stripe session expired");
                Ok(session.state())
            }
        }
    }

    fn parse_notification(
        &self,
        headers: &HeaderMap,
        payload: &[u8],
    ) -> Result<Option<PaymentNotification>, ServiceError> {
        if let Some(secret) = &self.config.webhook_secret {
            signature::verify_stripe(
                headers,
                payload,
                secret,
                self.config.tolerance_secs,
                Utc::now().timestamp(),
            )?;
        }

        let event: WebhookEvent = serde_json::from_slice(payload)
            .map_err(|e| ServiceError::ValidationError(format!("Malformed webhook: {}", e)))?;

        let state = match event.kind.as_str() {
            "checkout.session.completed" => match event.data.object.state() {
                SessionState::Paid => SessionState::Paid,
                // async payment methods report later
                _ => return Ok(None),
            },
            "checkout.session.async_payment_succeeded" => SessionState::Paid,
            "checkout.session.async_payment_failed" => SessionState::Failed,
            "checkout.session.expired" => SessionState::Expired,
            other => {
                warn!(event_type = other, "Ignoring Stripe event");
                return Ok(None);
            }
        };

        Ok(Some(PaymentNotification {
            event_id: Some(event.id),
            reference: event.data.object.id,
            state,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;
    use serde_json::json;

    fn gateway(secret: Option<&str>) -> StripeGateway {
        StripeGateway::new(StripeConfig {
            secret_key: "sk_test".into(),
            api_base: "http://127.0.0.1:1".into(),
            webhook_secret: secret.map(str::to_string),
            tolerance_secs: 300,
        })
        .unwrap()
    }

    fn event(kind: &str, status: &str, payment_status: &str) -> Vec<u8> {
        serde_json::to_vec(&json!({
            "id": "evt_1",
            "type": kind,
            "data": { "object": {
                "id": "cs_test_1",
                "status": status,
                "payment_status": payment_status,
            }}
        }))
        .unwrap()
    }

    fn signed(secret: &str, payload: &[u8]) -> HeaderMap {
        let header =
            signature::stripe_header(secret, Utc::now().timestamp(), payload).unwrap();
        let mut headers = HeaderMap::new();
        headers.insert(
            signature::STRIPE_SIGNATURE_HEADER,
            HeaderValue::from_str(&header).unwrap(),
        );
        headers
    }

    #[test]
    fn completed_and_paid_settles() {
        let gw = gateway(Some("whsec"));
        let payload = event("checkout.session.completed", "complete", "paid");
        let notice = gw
            .parse_notification(&signed("whsec", &payload), &payload)
            .unwrap()
            .unwrap();
        assert_eq!(notice.reference, "cs_test_1");
        assert_eq!(notice.state, SessionState::Paid);
        assert_eq!(notice.event_id.as_deref(), Some("evt_1"));
    }

    #[test]
    fn completed_but_unpaid_waits_for_async_event() {
        let gw = gateway(None);
        let payload = event("checkout.session.completed", "complete", "unpaid");
        assert!(gw
            .parse_notification(&HeaderMap::new(), &payload)
            .unwrap()
            .is_none());
    }

    #[test]
    fn expired_and_failed_events_map_to_states() {
        let gw = gateway(None);
        let expired = event("checkout.session.expired", "expired", "unpaid");
        let failed = event("checkout.session.async_payment_failed", "complete", "unpaid");
        assert_eq!(
            gw.parse_notification(&HeaderMap::new(), &expired).unwrap().unwrap().state,
            SessionState::Expired
        );
        assert_eq!(
            gw.parse_notification(&HeaderMap::new(), &failed).unwrap().unwrap().state,
            SessionState::Failed
        );
    }

    #[test]
    fn unsigned_payload_is_rejected_when_secret_configured() {
        let gw = gateway(Some("whsec"));
        let payload = event("checkout.session.completed", "complete", "paid");
        let err = gw.parse_notification(&HeaderMap::new(), &payload).unwrap_err();
        assert_eq!(err.code(), "invalid_signature");
    }

    #[test]
    fn unrelated_events_are_acknowledged() {
        let gw = gateway(None);
        let payload = event("customer.created", "", "");
        assert!(gw
            .parse_notification(&HeaderMap::new(), &payload)
            .unwrap()
            .is_none());
    }
}
