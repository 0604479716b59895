//! In-process payment provider for development and tests.
//!
//! Sessions live in memory; tests and local tooling move them to a final
//! state with [`SandboxGateway::settle`] and deliver notifications signed
//! with the plain `x-timestamp` / `x-signature` scheme.

use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use axum::http::HeaderMap;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use super::{
    signature, GatewayError, HostedSession, PaymentGateway, PaymentNotification, SessionRequest,
    SessionState, SESSION_ID_PLACEHOLDER,
};
use crate::errors::ServiceError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SandboxSession {
    pub order_id: Uuid,
    pub amount: Decimal,
    pub currency: String,
    pub state: SessionState,
    pub success_url: String,
    pub cancel_url: String,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SandboxEvent {
    #[serde(default)]
    event_id: Option<String>,
    reference: String,
    state: SessionState,
}

pub struct SandboxGateway {
    base_url: String,
    webhook_secret: Option<String>,
    tolerance_secs: u64,
    sessions: DashMap<String, SandboxSession>,
    unavailable: AtomicBool,
}

impl SandboxGateway {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            webhook_secret: None,
            tolerance_secs: 300,
            sessions: DashMap::new(),
            unavailable: AtomicBool::new(false),
        }
    }

    pub fn with_webhook_secret(mut self, secret: Option<String>, tolerance_secs: u64) -> Self {
        self.webhook_secret = secret;
        self.tolerance_secs = tolerance_secs;
        self
    }

    /// While set, session creation fails as if the provider were down.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub fn session(&self, reference: &str) -> Option<SandboxSession> {
        self.sessions.get(reference).map(|s| s.clone())
    }

    /// Moves a session to `state` as the shopper's action on the hosted page would.
    /// An expired or cancelled session takes no further action.
    pub fn settle(&self, reference: &str, state: SessionState) -> Result<(), GatewayError> {
        let mut session = self
            .sessions
            .get_mut(reference)
            .ok_or_else(|| GatewayError::UnknownSession(reference.to_string()))?;
        if matches!(session.state, SessionState::Expired | SessionState::Cancelled)
            && session.state != state
        {
            return Err(GatewayError::Rejected {
                status: 400,
                message: format!("session {} is {:?}", reference, session.state),
            });
        }
        session.state = state;
        Ok(())
    }

    /// Webhook body announcing `state` for `reference`.
    pub fn notification_payload(reference: &str, state: SessionState) -> Vec<u8> {
        serde_json::to_vec(&SandboxEvent {
            event_id: Some(format!("evt_{}", Uuid::new_v4().simple())),
            reference: reference.to_string(),
            state,
        })
        .unwrap_or_default()
    }
}

#[async_trait]
impl PaymentGateway for SandboxGateway {
    fn name(&self) -> &'static str {
        "sandbox"
    }

    async fn create_session(
        &self,
        request: &SessionRequest,
    ) -> Result<HostedSession, GatewayError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(GatewayError::Transport("sandbox provider unavailable".into()));
        }
        let reference = format!("sbx_{}", Uuid::new_v4().simple());
        self.sessions.insert(
            reference.clone(),
            SandboxSession {
                order_id: request.order_id,
                amount: request.amount,
                currency: request.currency.clone(),
                state: SessionState::Open,
                success_url: request.success_url.replace(SESSION_ID_PLACEHOLDER, &reference),
                cancel_url: request.cancel_url.replace(SESSION_ID_PLACEHOLDER, &reference),
                expires_at: request.expires_at,
            },
        );
        debug!(%reference, order_id = %request.order_id, "Sandbox session created");
        Ok(HostedSession {
            checkout_url: format!("{}/sandbox/checkout/{}", self.base_url, reference),
            reference,
            expires_at: request.expires_at,
        })
    }

    async fn session_state(&self, reference: &str) -> Result<SessionState, GatewayError> {
        let session = self
            .sessions
            .get(reference)
            .ok_or_else(|| GatewayError::UnknownSession(reference.to_string()))?;
        if session.state == SessionState::Open && session.expires_at <= Utc::now() {
            return Ok(SessionState::Expired);
        }
        Ok(session.state)
    }

    async fn expire_session(&self, reference: &str) -> Result<SessionState, GatewayError> {
        let mut session = self
            .sessions
            .get_mut(reference)
            .ok_or_else(|| GatewayError::UnknownSession(reference.to_string()))?;
        if session.state == SessionState::Open {
            session.state = SessionState::Expired;
            debug!(%reference, "Sandbox session expired");
        }
        Ok(session.state)
    }

    fn parse_notification(
        &self,
        headers: &HeaderMap,
        payload: &[u8],
    ) -> Result<Option<PaymentNotification>, ServiceError> {
        if let Some(secret) = &self.webhook_secret {
            signature::verify_plain(
                headers,
                payload,
                secret,
                self.tolerance_secs,
                Utc::now().timestamp(),
            )?;
        }
        let event: SandboxEvent = serde_json::from_slice(payload)
            .map_err(|e| ServiceError::ValidationError(format!("Malformed webhook: {}", e)))?;
        if event.state == SessionState::Open {
            return Ok(None);
        }
        Ok(Some(PaymentNotification {
            event_id: event.event_id,
            reference: event.reference,
            state: event.state,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use rust_decimal_macros::dec;

    fn request(expires_at: DateTime<Utc>) -> SessionRequest {
        SessionRequest {
            order_id: Uuid::new_v4(),
            order_number: "ORD-TEST0001".into(),
            owner_id: Uuid::new_v4(),
            amount: dec!(86),
            currency: "USD".into(),
            success_url: format!("http://shop/return?session_id={}", SESSION_ID_PLACEHOLDER),
            cancel_url: "http://shop/cancel".into(),
            expires_at,
            idempotency_key: "k".into(),
        }
    }

    #[tokio::test]
    async fn session_lifecycle() {
        let gw = SandboxGateway::new("http://shop/");
        let hosted = gw
            .create_session(&request(Utc::now() + Duration::minutes(30)))
            .await
            .unwrap();
        assert!(hosted.checkout_url.starts_with("http://shop/sandbox/checkout/sbx_"));
        let stored = gw.session(&hosted.reference).unwrap();
        assert!(stored.success_url.ends_with(&hosted.reference));

        assert_eq!(gw.session_state(&hosted.reference).await.unwrap(), SessionState::Open);
        gw.settle(&hosted.reference, SessionState::Paid).unwrap();
        assert_eq!(gw.session_state(&hosted.reference).await.unwrap(), SessionState::Paid);
    }

    #[tokio::test]
    async fn open_session_past_expiry_reports_expired() {
        let gw = SandboxGateway::new("http://shop");
        let hosted = gw
            .create_session(&request(Utc::now() - Duration::seconds(1)))
            .await
            .unwrap();
        assert_eq!(
            gw.session_state(&hosted.reference).await.unwrap(),
            SessionState::Expired
        );
    }

    #[tokio::test]
    async fn expired_session_cannot_be_paid() {
        let gw = SandboxGateway::new("http://shop");
        let hosted = gw
            .create_session(&request(Utc::now() + Duration::minutes(30)))
            .await
            .unwrap();
        assert_eq!(
            gw.expire_session(&hosted.reference).await.unwrap(),
            SessionState::Expired
        );
        assert!(gw.settle(&hosted.reference, SessionState::Paid).is_err());
        assert_eq!(
            gw.session_state(&hosted.reference).await.unwrap(),
            SessionState::Expired
        );
    }

    #[tokio::test]
    async fn expiring_a_paid_session_reports_paid() {
        let gw = SandboxGateway::new("http://shop");
        let hosted = gw
            .create_session(&request(Utc::now() + Duration::minutes(30)))
            .await
            .unwrap();
        gw.settle(&hosted.reference, SessionState::Paid).unwrap();
        assert_eq!(
            gw.expire_session(&hosted.reference).await.unwrap(),
            SessionState::Paid
        );
    }

    #[tokio::test]
    async fn unavailable_provider_refuses_sessions() {
        let gw = SandboxGateway::new("http://shop");
        gw.set_unavailable(true);
        assert!(gw
            .create_session(&request(Utc::now() + Duration::minutes(30)))
            .await
            .is_err());
    }

    #[test]
    fn signed_notifications_are_verified() {
        let gw = SandboxGateway::new("http://shop").with_webhook_secret(Some("s".into()), 300);
        let payload = SandboxGateway::notification_payload("sbx_1", SessionState::Paid);
        assert!(gw.parse_notification(&HeaderMap::new(), &payload).is_err());

        let ts = Utc::now().timestamp();
        let mut headers = HeaderMap::new();
        headers.insert(signature::TIMESTAMP_HEADER, ts.to_string().parse().unwrap());
        headers.insert(
            signature::SIGNATURE_HEADER,
            signature::sign("s", ts, &payload).unwrap().parse().unwrap(),
        );
        let notice = gw.parse_notification(&headers, &payload).unwrap().unwrap();
        assert_eq!(notice.reference, "sbx_1");
        assert_eq!(notice.state, SessionState::Paid);
    }
}
